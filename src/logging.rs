use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a subscriber printing harness logs through the test writer.
///
/// Verbosity follows `RUST_LOG`. Safe to call from every test: only the first call installs
/// anything, later ones report `false`.
pub fn init() -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_ok()
}
