//! Consume queued subscription events to keep the daily subscriptions feed
//! consistent.
use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;

use feed_common::health::HealthRegistry;
use feed_common::metrics::{serve, setup_metrics_router};
use feed_common::queue::EventQueue;
use feed_common::retry::RetryPolicy;
use feed_common::store::{FeedStore, PgFeedStore};
use feed_worker::config::Config;
use feed_worker::error::WorkerError;
use feed_worker::worker::FeedWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
    );

    let store = PgFeedStore::new(&config.database_url, config.feed_table_name.as_str())
        .await
        .expect("failed to initialize feed store");
    // The feed table must exist before any event is accepted.
    store
        .ensure_table()
        .await
        .expect("failed to create subscriptions feed table");

    let queue = EventQueue::new(&config.database_url, config.queue_table_name.as_str())
        .await
        .expect("failed to initialize event queue");
    queue
        .ensure_table()
        .await
        .expect("failed to create subscription events table");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker".to_string(), time::Duration::seconds(60));

    let worker = FeedWorker::new(
        &config.worker_name,
        queue,
        Arc::new(store),
        config.poll_interval.0,
        config.max_concurrent_jobs,
        retry_policy,
        worker_liveness,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_metrics_router()
            .route("/_liveness", get(move || std::future::ready(liveness.get_status())));
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await?;

    Ok(())
}
