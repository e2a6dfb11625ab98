use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging() {
    init_logging_with("info");
}

/// `default_directive` applies only when `RUST_LOG` is unset or invalid.
pub fn init_logging_with(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
