//! Subscriber setup shared by `iasd` and `iasagent`.

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins over `--debug`.
pub fn init(debug: bool) {
    let rust_log = std::env::var("RUST_LOG").ok();
    tracing_subscriber::fmt()
        .with_env_filter(filter(debug, rust_log.as_deref()))
        .with_target(false)
        .init();
}

fn filter(debug: bool, rust_log: Option<&str>) -> EnvFilter {
    let level = if debug { "debug" } else { "info" };
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}
