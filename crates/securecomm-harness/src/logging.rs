//! Test logging.

use tracing_subscriber::{EnvFilter, fmt};

/// Install a test-friendly subscriber filtered by `RUST_LOG` (default
/// `warn`). Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A subscriber installed by an earlier test is kept
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
