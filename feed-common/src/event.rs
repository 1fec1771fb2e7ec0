use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::hash::subject_token;

/// Longest accepted service identifier, in bytes.
const MAX_SERVICE_ID_LEN: usize = 100;

/// Enumeration of errors raised while decoding a subscription event payload.
/// None of these are retryable: a payload that does not decode now will not
/// decode on redelivery either.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("cannot parse subscription event payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("{0} is not a valid epoch milliseconds timestamp")]
    InvalidTimestamp(i64),
    #[error("invalid service identifier: {reason}")]
    InvalidServiceId { reason: &'static str },
}

/// Whether the user subscribed or unsubscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Subscribed,
    Unsubscribed,
}

impl Operation {
    /// The contrary operation, whose feed entry this event retracts.
    pub fn opposite(&self) -> Operation {
        match self {
            Operation::Subscribed => Operation::Unsubscribed,
            Operation::Unsubscribed => Operation::Subscribed,
        }
    }
}

/// What the subscription event refers to: the user's platform registration
/// as a whole, or their relationship to one sending service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "subscriptionKind")]
pub enum FeedSubject {
    #[serde(rename = "PROFILE")]
    Profile,
    #[serde(rename = "SERVICE")]
    Service {
        #[serde(rename = "serviceId")]
        service_id: String,
    },
}

/// Wire shape of an incoming subscription event, prior to validation.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "fiscalCode")]
    fiscal_code: String,
    operation: Operation,
    #[serde(rename = "updatedAt")]
    updated_at: i64,
    version: i64,
    #[serde(flatten)]
    subject: FeedSubject,
}

/// A decoded and validated subscription event.
///
/// The raw user identifier is hashed during decoding and is not retained;
/// everything downstream of this type only ever sees the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEvent {
    /// Hex SHA-256 of the user identifier.
    pub subject_token: String,
    pub operation: Operation,
    /// UTC calendar day of the event, `YYYY-MM-DD`.
    pub day: String,
    pub subject: FeedSubject,
    /// Profile version at the time of the event. Stored with the feed entry
    /// for observability; reconciliation does not order by it.
    pub version: i64,
}

impl SubscriptionEvent {
    /// Decode an untyped payload into a validated event.
    pub fn decode(payload: &serde_json::Value) -> Result<SubscriptionEvent, DecodeError> {
        let raw = RawEvent::deserialize(payload)?;

        if let FeedSubject::Service { service_id } = &raw.subject {
            if service_id.is_empty() {
                return Err(DecodeError::InvalidServiceId { reason: "empty" });
            }
            if service_id.len() > MAX_SERVICE_ID_LEN {
                return Err(DecodeError::InvalidServiceId { reason: "too long" });
            }
            // The feed key delimiter must not occur inside a key segment.
            if service_id.contains('-') {
                return Err(DecodeError::InvalidServiceId {
                    reason: "contains the key delimiter",
                });
            }
        }

        let day = DateTime::<Utc>::from_timestamp_millis(raw.updated_at)
            .ok_or(DecodeError::InvalidTimestamp(raw.updated_at))?
            .format("%Y-%m-%d")
            .to_string();

        Ok(SubscriptionEvent {
            subject_token: subject_token(&raw.fiscal_code),
            operation: raw.operation,
            day,
            subject: raw.subject,
            version: raw.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_profile_event() {
        let payload = json!({
            "fiscalCode": "AAAAAA00A00A000A",
            "operation": "SUBSCRIBED",
            "updatedAt": 1709251200000_i64, // 2024-03-01T00:00:00Z
            "version": 3,
            "subscriptionKind": "PROFILE",
        });

        let event = SubscriptionEvent::decode(&payload).expect("payload should decode");
        assert_eq!(event.operation, Operation::Subscribed);
        assert_eq!(event.day, "2024-03-01");
        assert_eq!(event.subject, FeedSubject::Profile);
        assert_eq!(event.version, 3);
        assert_eq!(event.subject_token, subject_token("AAAAAA00A00A000A"));
    }

    #[test]
    fn test_decode_service_event() {
        let payload = json!({
            "fiscalCode": "AAAAAA00A00A000A",
            "operation": "UNSUBSCRIBED",
            "updatedAt": 1709337599999_i64, // 2024-03-01T23:59:59.999Z
            "version": 1,
            "subscriptionKind": "SERVICE",
            "serviceId": "svc42",
        });

        let event = SubscriptionEvent::decode(&payload).expect("payload should decode");
        assert_eq!(event.operation, Operation::Unsubscribed);
        assert_eq!(event.day, "2024-03-01");
        assert_eq!(
            event.subject,
            FeedSubject::Service {
                service_id: "svc42".to_owned()
            }
        );
    }

    #[test]
    fn test_decode_truncates_to_utc_day() {
        // One millisecond after midnight lands on the next day.
        let payload = json!({
            "fiscalCode": "AAAAAA00A00A000A",
            "operation": "SUBSCRIBED",
            "updatedAt": 1709337600001_i64,
            "version": 0,
            "subscriptionKind": "PROFILE",
        });

        let event = SubscriptionEvent::decode(&payload).expect("payload should decode");
        assert_eq!(event.day, "2024-03-02");
    }

    #[test]
    fn test_decode_rejects_service_event_without_service_id() {
        let payload = json!({
            "fiscalCode": "AAAAAA00A00A000A",
            "operation": "SUBSCRIBED",
            "updatedAt": 1709251200000_i64,
            "version": 0,
            "subscriptionKind": "SERVICE",
        });

        assert!(matches!(
            SubscriptionEvent::decode(&payload),
            Err(DecodeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_service_ids() {
        for (service_id, reason) in [
            (String::new(), "empty"),
            ("a".repeat(MAX_SERVICE_ID_LEN + 1), "too long"),
            ("svc-42".to_owned(), "contains the key delimiter"),
        ] {
            let payload = json!({
                "fiscalCode": "AAAAAA00A00A000A",
                "operation": "SUBSCRIBED",
                "updatedAt": 1709251200000_i64,
                "version": 0,
                "subscriptionKind": "SERVICE",
                "serviceId": service_id,
            });

            match SubscriptionEvent::decode(&payload) {
                Err(DecodeError::InvalidServiceId { reason: got }) => assert_eq!(got, reason),
                other => panic!("expected InvalidServiceId, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_rejects_missing_and_mistyped_fields() {
        let missing_operation = json!({
            "fiscalCode": "AAAAAA00A00A000A",
            "updatedAt": 1709251200000_i64,
            "version": 0,
            "subscriptionKind": "PROFILE",
        });
        assert!(SubscriptionEvent::decode(&missing_operation).is_err());

        let mistyped_timestamp = json!({
            "fiscalCode": "AAAAAA00A00A000A",
            "operation": "SUBSCRIBED",
            "updatedAt": "not-a-number",
            "version": 0,
            "subscriptionKind": "PROFILE",
        });
        assert!(SubscriptionEvent::decode(&mistyped_timestamp).is_err());
    }

    #[test]
    fn test_operation_opposite() {
        assert_eq!(Operation::Subscribed.opposite(), Operation::Unsubscribed);
        assert_eq!(Operation::Unsubscribed.opposite(), Operation::Subscribed);
    }
}
