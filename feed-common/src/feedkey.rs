use crate::event::{FeedSubject, Operation, SubscriptionEvent};

/// Storage address of a single feed entry.
///
/// Keys have the following format:
///
/// * Profile subscription events: `P-<DATE>-<EVENT>-<HASH>`
/// * Service subscription events: `S-<DATE>-<SERVICE_ID>-<EVENT>-<HASH>`
///
/// Where:
///
/// * `DATE` is `YYYY-MM-DD` (UTC)
/// * `SERVICE_ID` is the service the user subscribed/unsubscribed
/// * `EVENT` is either `S` for subscription events or `U` for unsubscriptions
/// * `HASH` is the hex encoded SHA-256 of the user identifier
///
/// The partition key holds everything up to `EVENT`; the row key is the
/// partition key plus the hash. Feed readers enumerate a day's subscribed
/// and unsubscribed sets by partition key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedEntryKey {
    pub partition_key: String,
    pub row_key: String,
}

impl FeedEntryKey {
    pub fn encode(
        day: &str,
        subject: &FeedSubject,
        operation: Operation,
        subject_token: &str,
    ) -> FeedEntryKey {
        let letter = match operation {
            Operation::Subscribed => 'S',
            Operation::Unsubscribed => 'U',
        };
        let partition_key = match subject {
            FeedSubject::Profile => format!("P-{}-{}", day, letter),
            FeedSubject::Service { service_id } => {
                format!("S-{}-{}-{}", day, service_id, letter)
            }
        };
        let row_key = format!("{}-{}", partition_key, subject_token);

        FeedEntryKey {
            partition_key,
            row_key,
        }
    }

    /// The key this event's own operation addresses.
    pub fn for_event(event: &SubscriptionEvent) -> FeedEntryKey {
        FeedEntryKey::encode(
            &event.day,
            &event.subject,
            event.operation,
            &event.subject_token,
        )
    }

    /// The key of the contrary operation, retracted when this event lands.
    pub fn for_opposite(event: &SubscriptionEvent) -> FeedEntryKey {
        FeedEntryKey::encode(
            &event.day,
            &event.subject,
            event.operation.opposite(),
            &event.subject_token,
        )
    }
}
