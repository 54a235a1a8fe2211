//! Infrastructure layer: config, Postgres, Redis, external services, and the
//! enrichment pipeline built on top of them.

pub mod config;
pub mod external;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod store;
