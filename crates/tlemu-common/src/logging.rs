use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable that overrides every other filter source.
pub const LOG_ENV: &str = "TLEMU_LOG";

/// Initialize structured logging with an environment filter.
/// Set TLEMU_LOG=debug (or trace, info, warn, error) for verbosity control;
/// otherwise `default_filter` applies.
///
/// Output goes to stderr because the layer lives inside someone else's process.
/// An already installed global subscriber wins and this call becomes a no-op.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
