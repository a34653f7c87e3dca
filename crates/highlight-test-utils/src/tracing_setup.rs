//! Tracing initialisation for tests that are not wrapped in `test_log`.

use tracing_subscriber::EnvFilter;

/// Initialise a subscriber writing to the test harness, filtered by
/// `RUST_LOG` (default `info`). Later calls are ignored.
///
/// ```ignore
/// #[tokio::test]
/// async fn my_test() {
///     highlight_test_utils::tracing_setup::init_test_tracing();
/// }
/// ```
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
