//! Tracing and logging (shared setup).

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use tracing::{LogFormat, UnknownLogFormat};

/// Initialize process-wide logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(format: LogFormat) {
    tracing::init(format);
}
