//! # nudge-store
//!
//! SQLite-backed persistence for the nudge engine: the durable prompt
//! lifecycle, read-only preference and user-state views, delivery
//! statistics for the frequency controller, and the per-attempt
//! delivery log.

pub mod log;
pub mod store;

pub use log::{DeliveryEvent, DeliveryEventKind, DeliveryLog};
pub use store::{QueueCandidate, RetryDisposition, Store};
