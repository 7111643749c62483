use tracing_subscriber::EnvFilter;

/// Structured logging for the whole process. `RUST_LOG` wins over the
/// configured level when set.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("eigenswarm={level},warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
