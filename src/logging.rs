//! Logging macros that set target to "gatehouse_agent" for all log calls.
//!
//! The gateway consumes agent logs under a single logger name. Without an
//! explicit target, tracing uses the full module path
//! (e.g., "gatehouse_agent::proxy::postgres"), creating overly verbose
//! logger names. These macros ensure all logs from this crate use a single
//! "gatehouse_agent" target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "gatehouse_agent", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "gatehouse_agent", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "gatehouse_agent", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "gatehouse_agent", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "gatehouse_agent", $($arg)*) };
}
