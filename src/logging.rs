use tracing_subscriber::EnvFilter;

/// Installs the console subscriber. `RUST_LOG` wins over `default_level`.
///
/// Output goes to stderr so stdout stays free for the run report. Returns `false` when a global
/// subscriber was already installed.
pub fn init_logging(default_level: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(std::io::stderr).try_init().is_ok()
}
