//! Tracing subscriber initialization.

/// Initializes the global tracing subscriber with env-filter support.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}
