use std::sync::Arc;
use std::time::Duration;

use common_kafka::{ConnectionPool, KafkaGroupConsumer, OffsetTracker, ReadLoop, Subscriber};
use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use users_consumer::config::Config;
use users_consumer::printer::print_user;

async fn shutdown(cancel: CancellationToken) {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
        _ = cancel.cancelled() => return,
    };

    info!("shutting down gracefully...");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().expect("Invalid configuration:");

    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(config.log_level).into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let pool = ConnectionPool::new(config.kafka.clone());
    let consumer = KafkaGroupConsumer::new(&pool, &config.consumer)?;
    let store = consumer.cursor_store(config.kafka.metadata_timeout());
    let tracker = Arc::new(OffsetTracker::new(
        Arc::new(store),
        config.consumer.kafka_consumer_strict_offsets,
    ));
    let subscriber = Subscriber::new(
        consumer,
        tracker.clone(),
        config.kafka.kafka_topic.clone(),
        &config.consumer,
    );
    let mut read_loop = ReadLoop::new(subscriber, tracker, &config.consumer);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown(cancel.clone()));

    info!(
        topic = %config.kafka.kafka_topic,
        group = %config.consumer.kafka_consumer_group,
        "consuming users"
    );
    let stdout = std::io::stdout();
    let result = read_loop
        .run(cancel.clone(), |record| print_user(&mut stdout.lock(), record))
        .await;

    cancel.cancel();
    pool.close(Duration::from_secs(5));
    result?;
    info!("consumer shut down");
    Ok(())
}
