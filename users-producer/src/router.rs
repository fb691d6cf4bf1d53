use std::future::ready;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::sinks::UserSink;
use crate::time::TimeSource;
use crate::users;

#[derive(Clone)]
pub struct State {
    pub sink: Arc<dyn UserSink + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
}

async fn index() -> &'static str {
    "users-producer"
}

async fn health() -> &'static str {
    "ok"
}

pub fn router<TZ, S>(timesource: TZ, sink: S, metrics: bool) -> Router
where
    TZ: TimeSource + Send + Sync + 'static,
    S: UserSink + Send + Sync + 'static,
{
    let state = State {
        sink: Arc::new(sink),
        timesource: Arc::new(timesource),
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/users", post(users::create))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
