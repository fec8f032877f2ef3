/// Install the global tracing subscriber.
///
/// `default_filter` is used when `RUST_LOG` is not set. Safe to call more
/// than once; later calls are no-ops.
pub fn init(default_filter: &str) {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(default_filter)),
        )
        .compact()
        .with_target(true)
        .try_init();
}
