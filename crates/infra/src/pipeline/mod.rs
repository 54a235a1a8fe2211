//! The enrichment pipeline: request → queue → worker → call → webhook.

pub mod callback;
pub mod gateway;
pub mod worker;

pub use callback::{CallbackError, CallbackOutcome, CallbackProcessor};
pub use gateway::{EnrichmentError, EnrichmentGateway, MAX_SEARCH_AND_ENRICH};
pub use worker::{EnrichmentWorker, JobOutcome, WorkerError, WorkerHandle};
