//! `eatsavvy-core`: domain building blocks for the restaurant enrichment pipeline.
//!
//! This crate contains **pure domain** code (no IO): the weekly time model with the
//! open-hours evaluator and retry-delay calculator, restaurant/call records and the
//! enrichment state machine, the queue envelope and the end-of-call report.

pub mod clock;
pub mod error;
pub mod hours;
pub mod id;
pub mod job;
pub mod phone;
pub mod report;
pub mod restaurant;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use hours::{is_open, next_open_delay, TimePoint, TimeRange};
pub use id::{JobId, PlaceId, ProviderCallId};
pub use job::EnrichmentJob;
pub use report::EndOfCallReport;
pub use restaurant::{Call, CallStatus, EnrichmentStatus, Restaurant};
