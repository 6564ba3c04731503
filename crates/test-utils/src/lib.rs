pub mod builders;
pub mod fake_process;
pub mod fake_reactor;
pub mod harness;
pub mod sinks;

pub use builders::{ConfigFileBuilder, WatcherBuilder};
pub use fake_process::FakeProcessBackend;
pub use fake_reactor::FakeReactor;
pub use harness::{FakeArbiter, Harness, fake_arbiter};
pub use sinks::{Captured, CollectingSink};

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Route procwarden's tracing output into the test harness.
///
/// Captured per test and only shown for failures (or with `--nocapture`).
/// Reads `PROCWARDEN_LOG`, e.g. `PROCWARDEN_LOG=procwarden=trace cargo test`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("PROCWARDEN_LOG")
            .unwrap_or_else(|_| EnvFilter::new("procwarden=debug"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init()
            .ok();
    });
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}
