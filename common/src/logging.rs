//! Logging bootstrap for host binaries and tests

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// info-level filter. Safe to call more than once; later calls are ignored.
pub fn init(service: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{}=debug", service.replace('-', "_"))));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
