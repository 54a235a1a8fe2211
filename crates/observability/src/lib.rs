//! Process-wide logging setup shared by the API and worker binaries.

/// Initialize tracing for the process with the default `info` filter.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Subscriber construction (filters, JSON formatting).
pub mod tracing;
