use tracing::debug;

use crate::event::SubscriptionEvent;
use crate::feedkey::FeedEntryKey;
use crate::store::{DeleteOutcome, FeedStore, InsertOutcome, StoreError};

/// How the feed changed when an event was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedUpdate {
    /// The contrary entry for the same day was present and has been
    /// retracted; the day nets out to no change for this subject.
    OppositeRemoved,
    /// A new entry was inserted for the event's own operation.
    Marked,
    /// The event's own entry was already present; a prior delivery of the
    /// same logical event converged first.
    AlreadyMarked,
}

/// Reconcile one subscription event against the feed store.
///
/// For each day, (optionally) service and user, either the S or the U key
/// exists, but not both. We first try to delete the contrary operation's
/// entry for the day: if that succeeds the user previously made the
/// opposite choice today, the two cancel out, and nothing is inserted.
/// Only when no contrary entry exists do we insert our own.
///
/// At most two store calls, no internal retries, no state between
/// invocations. On a transient [`StoreError`] the caller must re-run the
/// whole event: per-key `NotFound` / `AlreadyExists` signals make the rerun
/// converge no matter where the previous attempt stopped, so blind retry is
/// always correct, including concurrent duplicate deliveries.
pub async fn update_subscription_status<S: FeedStore + ?Sized>(
    store: &S,
    event: &SubscriptionEvent,
) -> Result<FeedUpdate, StoreError> {
    let self_key = FeedEntryKey::for_event(event);
    let opposite_key = FeedEntryKey::for_opposite(event);

    debug!(
        partition_key = %opposite_key.partition_key,
        "retracting contrary feed entry"
    );
    match store.delete_entry(&opposite_key).await? {
        DeleteOutcome::Deleted => {
            // The day's delta is back to empty for this subject; inserting
            // our own entry now would double-count the event.
            metrics::counter!("feed_entries_removed_total").increment(1);
            return Ok(FeedUpdate::OppositeRemoved);
        }
        DeleteOutcome::NotFound => {}
    }

    debug!(partition_key = %self_key.partition_key, "inserting feed entry");
    match store.insert_entry(&self_key, event.version).await? {
        InsertOutcome::Inserted => {
            metrics::counter!("feed_entries_inserted_total").increment(1);
            Ok(FeedUpdate::Marked)
        }
        InsertOutcome::AlreadyExists => {
            metrics::counter!("feed_entries_already_present_total").increment(1);
            Ok(FeedUpdate::AlreadyMarked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FeedSubject, Operation};
    use crate::store::MemoryFeedStore;

    fn profile_event(operation: Operation) -> SubscriptionEvent {
        SubscriptionEvent {
            subject_token: "abc123".to_owned(),
            operation,
            day: "2024-03-01".to_owned(),
            subject: FeedSubject::Profile,
            version: 1,
        }
    }

    fn service_event(operation: Operation, service_id: &str) -> SubscriptionEvent {
        SubscriptionEvent {
            subject: FeedSubject::Service {
                service_id: service_id.to_owned(),
            },
            ..profile_event(operation)
        }
    }

    fn assert_no_double_marking(store: &MemoryFeedStore, event: &SubscriptionEvent) {
        let own = FeedEntryKey::for_event(event);
        let opposite = FeedEntryKey::for_opposite(event);
        assert!(
            !(store.contains(&own) && store.contains(&opposite)),
            "both S and U entries present for the same subject and day"
        );
    }

    #[tokio::test]
    async fn test_subscribe_on_empty_store_marks_the_day() {
        let store = MemoryFeedStore::new();
        let event = profile_event(Operation::Subscribed);

        let update = update_subscription_status(&store, &event).await.unwrap();

        assert_eq!(update, FeedUpdate::Marked);
        assert_eq!(store.rows_with_prefix("P-2024-03-01-S-"), vec!["P-2024-03-01-S-abc123"]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_opposite_event_cancels_same_day_entry() {
        let store = MemoryFeedStore::new();

        let subscribe = profile_event(Operation::Subscribed);
        update_subscription_status(&store, &subscribe).await.unwrap();

        let unsubscribe = profile_event(Operation::Unsubscribed);
        let update = update_subscription_status(&store, &unsubscribe).await.unwrap();

        // The subscribe entry is retracted and no unsubscribe entry is
        // written; the day nets out to nothing for this user.
        assert_eq!(update, FeedUpdate::OppositeRemoved);
        assert!(store.is_empty());
        assert_no_double_marking(&store, &unsubscribe);
    }

    #[tokio::test]
    async fn test_cancellation_is_symmetric() {
        let store = MemoryFeedStore::new();

        update_subscription_status(&store, &profile_event(Operation::Unsubscribed))
            .await
            .unwrap();
        let update = update_subscription_status(&store, &profile_event(Operation::Subscribed))
            .await
            .unwrap();

        assert_eq!(update, FeedUpdate::OppositeRemoved);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_service_unsubscribe_on_empty_store() {
        let store = MemoryFeedStore::new();
        let event = service_event(Operation::Unsubscribed, "svc42");

        let update = update_subscription_status(&store, &event).await.unwrap();

        assert_eq!(update, FeedUpdate::Marked);
        assert_eq!(
            store.rows_with_prefix("S-2024-03-01-svc42-U-"),
            vec!["S-2024-03-01-svc42-U-abc123"]
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_converges_to_single_delivery_state() {
        let store = MemoryFeedStore::new();
        let event = profile_event(Operation::Subscribed);

        assert_eq!(
            update_subscription_status(&store, &event).await.unwrap(),
            FeedUpdate::Marked
        );
        for _ in 0..3 {
            // Redeliveries observe `already exists` and change nothing.
            assert_eq!(
                update_subscription_status(&store, &event).await.unwrap(),
                FeedUpdate::AlreadyMarked
            );
        }

        assert_eq!(store.len(), 1);
        assert!(store.contains(&FeedEntryKey::for_event(&event)));
    }

    #[tokio::test]
    async fn test_repeated_alternating_events_never_double_mark() {
        let store = MemoryFeedStore::new();

        let mut operation = Operation::Subscribed;
        for _ in 0..8 {
            let event = profile_event(operation);
            update_subscription_status(&store, &event).await.unwrap();
            assert_no_double_marking(&store, &event);
            operation = operation.opposite();
        }

        // An even number of alternations cancels out entirely.
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_transient_delete_failure_propagates_without_half_applied_state() {
        let store = MemoryFeedStore::new();
        let event = profile_event(Operation::Subscribed);

        store.fail_next_deletes(1);
        assert!(update_subscription_status(&store, &event).await.is_err());
        assert!(store.is_empty());

        // The caller's blind rerun of the whole event converges.
        assert_eq!(
            update_subscription_status(&store, &event).await.unwrap(),
            FeedUpdate::Marked
        );
    }

    #[tokio::test]
    async fn test_crash_between_delete_and_insert_recovers_on_rerun() {
        let store = MemoryFeedStore::new();

        update_subscription_status(&store, &profile_event(Operation::Unsubscribed))
            .await
            .unwrap();

        // The delete of the contrary entry succeeds, then the insert dies.
        let event = profile_event(Operation::Subscribed);
        store.fail_next_inserts(1);
        assert!(update_subscription_status(&store, &event).await.is_err());
        assert!(store.is_empty());

        // Rerunning from the full event finds nothing to delete and
        // completes the insert.
        assert_eq!(
            update_subscription_status(&store, &event).await.unwrap(),
            FeedUpdate::Marked
        );
        assert!(store.contains(&FeedEntryKey::for_event(&event)));
        assert!(!store.contains(&FeedEntryKey::for_opposite(&event)));
    }

    #[tokio::test]
    async fn test_different_subjects_do_not_interfere() {
        let store = MemoryFeedStore::new();

        update_subscription_status(&store, &profile_event(Operation::Subscribed))
            .await
            .unwrap();
        update_subscription_status(&store, &service_event(Operation::Unsubscribed, "svc42"))
            .await
            .unwrap();

        // The service unsubscription does not cancel the profile entry.
        assert_eq!(store.len(), 2);
    }
}
