use std::future::Future;
use std::time::Duration;

use common_kafka::{ConnectionPool, KafkaProducer, Publisher};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::router;
use crate::sinks::kafka::KafkaSink;
use crate::sinks::print::PrintSink;
use crate::time::SystemTime;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let pool = ConnectionPool::new(config.kafka.clone());

    let mut publisher = None;
    let app = if config.print_sink {
        // Print sink is only used for local debug
        router::router(SystemTime {}, PrintSink {}, config.export_prometheus)
    } else {
        let transport = KafkaProducer::new(&pool)?;
        let kafka = Publisher::new(pool.clone(), transport).await?;
        publisher = Some(kafka.clone());
        let sink = KafkaSink::new(kafka, config.publish_timeout());
        router::router(SystemTime {}, sink, config.export_prometheus)
    };

    info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    // In-flight requests are done, push out whatever librdkafka still holds
    if let Some(publisher) = publisher {
        if let Err(e) = publisher.flush(FLUSH_TIMEOUT).await {
            warn!("failed to flush pending users: {}", e);
        }
    }
    tokio::task::spawn_blocking(move || pool.close(FLUSH_TIMEOUT)).await?;
    info!("producer shut down");
    Ok(())
}
