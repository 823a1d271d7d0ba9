//! Log output for tests.

use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is not set.
///
/// The workspace crates log at all levels. Dependencies only report errors, except for the HTTP
/// client stack whose warnings explain failed benchmark requests.
const DEFAULT_DIRECTIVES: &str = "error,hyper_util=warn,reqwest=warn,\
    faasbench_cli=trace,faasbench_core=trace,faasbench_cloud=trace,faasbench_test=trace";

/// Installs a subscriber that writes to the output captured by the test harness.
///
/// `RUST_LOG` replaces the default directives, for example to silence a noisy test run with
/// `RUST_LOG=off`. Only the first call in a test binary takes effect.
///
/// # Example
///
/// ```
/// faasbench_test::tracing::init();
/// ```
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_test_writer()
        .with_target(true)
        .without_time()
        .compact()
        .try_init()
        .ok();
}

/// The filter from `RUST_LOG`, or the default directives if it is unset or invalid.
pub fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}
