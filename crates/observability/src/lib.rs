//! Tracing and logging setup shared by the wallethub binaries.

pub mod subscriber;

pub use subscriber::LogFormat;

/// Initialize process-wide tracing with the format named by `LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init(LogFormat::from_env());
}
