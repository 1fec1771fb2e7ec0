use std::fmt;

use tracing::{debug, error};

use feed_common::event::SubscriptionEvent;
use feed_common::reconciler::update_subscription_status;
use feed_common::store::{FeedStore, StoreError};

/// Terminal status reported to the orchestrating caller.
///
/// `Failure` is only ever produced for undecodable payloads: the payload
/// will not decode on redelivery either, so the caller must not retry.
/// Transient store failures are not a terminal status; they surface as
/// [`StoreError`] so the caller reschedules the whole event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityStatus {
    Success,
    Failure,
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ActivityStatus::Success => write!(f, "SUCCESS"),
            ActivityStatus::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Process one raw subscription event payload against the feed.
///
/// Decodes and validates the payload, then runs the feed reconciliation.
/// Safe to re-run any number of times for the same payload.
pub async fn update_subscriptions_feed<S: FeedStore + ?Sized>(
    store: &S,
    payload: &serde_json::Value,
) -> Result<ActivityStatus, StoreError> {
    let event = match SubscriptionEvent::decode(payload) {
        Ok(event) => event,
        Err(e) => {
            error!("cannot parse subscription event: {}", e);
            metrics::counter!("subscription_events_undecodable_total").increment(1);
            return Ok(ActivityStatus::Failure);
        }
    };

    debug!(
        operation = ?event.operation,
        day = %event.day,
        subject = ?event.subject,
        "updating subscriptions feed"
    );

    let update = update_subscription_status(store, &event).await?;
    debug!(update = ?update, "subscriptions feed updated");

    Ok(ActivityStatus::Success)
}
