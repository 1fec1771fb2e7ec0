use std::sync::Arc;
use std::time;

use tokio::sync;
use tracing::error;

use feed_common::health::HealthHandle;
use feed_common::queue::{EventJob, EventQueue, RetryOutcome};
use feed_common::retry::RetryPolicy;
use feed_common::store::FeedStore;

use crate::activity::{update_subscriptions_feed, ActivityStatus};
use crate::error::WorkerError;

/// A worker to poll the event queue and spawn tasks to reconcile
/// subscription events against the feed when one becomes available.
pub struct FeedWorker<S> {
    /// An identifier for this worker. Recorded on jobs we have attempted.
    name: String,
    /// The queue we will be dequeuing events from.
    queue: EventQueue,
    /// The feed store events are reconciled against.
    store: Arc<S>,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// Maximum number of concurrent events being processed.
    max_concurrent_jobs: usize,
    /// Backoff policy for events that failed with a transient store error.
    retry_policy: RetryPolicy,
    /// The liveness check handle, reported on every poll.
    liveness: HealthHandle,
}

impl<S: FeedStore + 'static> FeedWorker<S> {
    pub fn new(
        name: &str,
        queue: EventQueue,
        store: Arc<S>,
        poll_interval: time::Duration,
        max_concurrent_jobs: usize,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            store,
            poll_interval,
            max_concurrent_jobs,
            retry_policy,
            liveness,
        }
    }

    /// Wait until an event becomes available in our queue.
    async fn wait_for_job(&self) -> Result<EventJob, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy();

            if let Some(job) = self.queue.dequeue(&self.name).await? {
                return Ok(job);
            }
        }
    }

    /// Run this worker to continuously process any events that become
    /// available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));

        loop {
            let job = self.wait_for_job().await?;

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore has been closed");

            let queue = self.queue.clone();
            let store = self.store.clone();
            let retry_policy = self.retry_policy;

            metrics::counter!("subscription_events_total").increment(1);

            tokio::spawn(async move {
                let result = process_event_job(queue, store, &retry_policy, job).await;
                drop(permit);
                if let Err(e) = result {
                    error!("failed to process subscription event: {}", e);
                }
            });
        }
    }
}

/// Process one dequeued event and transition it to its next queue state:
/// completed (terminal status reached), failed (undecodable, or out of
/// attempts), or back to available with a backoff (transient store error).
async fn process_event_job<S: FeedStore>(
    queue: EventQueue,
    store: Arc<S>,
    retry_policy: &RetryPolicy,
    job: EventJob,
) -> Result<(), WorkerError> {
    let now = tokio::time::Instant::now();

    let result = update_subscriptions_feed(store.as_ref(), &job.payload).await;

    metrics::histogram!("subscription_events_processing_duration_seconds")
        .record(now.elapsed().as_secs_f64());

    match result {
        Ok(ActivityStatus::Success) => {
            queue.complete(&job).await?;
            metrics::counter!("subscription_events_completed_total").increment(1);
        }
        Ok(ActivityStatus::Failure) => {
            queue.fail(&job, "undecodable payload").await?;
            metrics::counter!("subscription_events_failed_total").increment(1);
        }
        Err(store_error) => {
            let attempt = job.attempt.max(0) as u32;
            let interval = retry_policy.retry_interval(attempt);

            match queue.retry(&job, interval, &store_error.to_string()).await? {
                RetryOutcome::Scheduled => {
                    metrics::counter!("subscription_events_retried_total").increment(1);
                }
                RetryOutcome::Exhausted => {
                    error!(
                        "subscription event {} exhausted its attempts: {}",
                        job.id, store_error
                    );
                    metrics::counter!("subscription_events_failed_total").increment(1);
                }
            }
        }
    }

    Ok(())
}
