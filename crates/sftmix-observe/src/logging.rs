use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `SFTMIX_LOG` first, then
/// `RUST_LOG`, then a default.
///
/// Log field contract for pipeline operations:
/// - Always include `op` on run-level events.
/// - Include `label` on any per-source event.
/// - Include `seed` and `profile_hash` once a run is configured.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("SFTMIX_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
