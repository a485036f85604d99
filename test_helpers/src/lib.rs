//! Shared helpers for the workspace's unit and integration tests.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing;
use std::{
    sync::Once,
    time::{Duration, Instant},
};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

#[cfg(feature = "future_timeout")]
mod timeout;
#[cfg(feature = "future_timeout")]
pub use timeout::*;

/// How often the condition-polling helpers re-check their condition.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the RUST_LOG environment variable is
/// set. Does nothing if `RUST_LOG` is not set. If enable_logging has
/// been set previously, does nothing.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Enables debug logging regardless of the value of RUST_LOG
/// environment variable. If RUST_LOG isn't specified, defaults to
/// "debug".
pub fn start_logging() {
    // ensure the global has been initialized
    LOG_SETUP.call_once(|| {
        // honor any existing RUST_LOG level
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "debug")
        }
        // Configure the logger to write to stderr and install it
        let subscriber = fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");

        // send log events to the tracing subscriber as well
        LogTracer::init().expect("tracing log init failed");
    })
}

/// Poll `condition` until it holds, panicking with `description` once
/// `timeout` passes.
///
/// This blocks the calling thread between polls; from inside an async
/// runtime use the `wait_for_condition_async` variant of the
/// `future_timeout` feature instead, so runtime workers keep making
/// progress.
pub fn wait_for_condition(
    description: &str,
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < timeout,
            "condition not reached within {:?}: {}",
            timeout,
            description
        );
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Asserts that the value of `actual`, converted to a string, contains the
/// string representation of `expected`.
#[macro_export]
macro_rules! assert_contains {
    ($actual:expr, $expected:expr) => {
        let actual_value: String = $actual.to_string();
        let expected_value: String = $expected.to_string();
        assert!(
            actual_value.contains(&expected_value),
            "Can not find expected value in actual.\n\nExpected:\n{}\n\nActual:\n{}",
            expected_value,
            actual_value,
        )
    };
}
