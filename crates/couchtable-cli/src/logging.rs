use tracing_subscriber::EnvFilter;

/// Noisy dependency targets kept at `warn` regardless of the base level.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

fn build_env_filter(level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_TARGETS.iter().map(|t| format!("{t}=warn")));
    EnvFilter::try_new(directives.join(",")).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Log to stderr so stdout carries only JSON. `RUST_LOG` overrides `level`.
pub fn init_logging(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
