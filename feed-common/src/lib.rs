//! Shared building blocks for the subscriptions feed services.
//!
//! The feed records, for each calendar day, whether a user subscribed to or
//! unsubscribed from the notification platform (or from an individual
//! service). Entries live in a key-value table with no cross-key
//! transactions; correctness under at-least-once redelivery comes from the
//! idempotent reconciliation in [`reconciler`].

pub mod event;
pub mod feedkey;
pub mod hash;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod store;
