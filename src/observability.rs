//! Shared tracing configuration for dispatcher observability.
//!
//! Centralises the log target used by the crate and the subscriber setup for
//! the binary. Every dispatcher event carries a `host` field naming either
//! `localhost` or the worker the event concerns, so interleaved lines from
//! concurrent transactions stay attributable.

use tracing_subscriber::EnvFilter;

/// Target used by dispatcher spans and logs.
pub(crate) const LOG_TARGET: &str = "kssh::dispatch";

/// Host tag for events that originate locally rather than on a worker.
pub(crate) const LOCAL_HOST: &str = "localhost";

/// Installs the global fmt subscriber for the binary.
///
/// Events are written to standard error with UTC timestamps so block output
/// on standard out stays clean. `RUST_LOG` overrides the default `info`
/// level.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
