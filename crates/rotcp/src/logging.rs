use tracing_subscriber::EnvFilter;

/// Builds the default `EnvFilter` level from `--debug` (0 → warn, 1 →
/// info, 2 → debug, 3+ → trace), overridable by `RUST_LOG`.
fn default_level(debug: u8) -> &'static str {
    match debug {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

pub fn init(debug: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level(debug)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
