//! # nudge-providers
//!
//! Clients for the engine's external collaborators: the coach content
//! service (synthesis + heuristic timing detection) and the health-records
//! service (reply side effects). A deterministic canned synthesizer ships
//! for offline and development use.

pub mod canned;
pub mod coach;
pub mod records;

pub use canned::CannedSynthesizer;
pub use coach::{HttpHeuristic, HttpSynthesizer};
pub use records::{HttpRecordService, NoopRecordService};
