//! Helpers for bounding how long a test future may run.

use async_trait::async_trait;
use std::{future::Future, time::Duration};
use tokio::time::error::Elapsed;

/// Extension trait attaching a timeout to any future.
#[async_trait]
pub trait FutureTimeout: Future + Send + Sized {
    /// Resolve the future, erroring if `timeout` passes first.
    async fn with_timeout(self, timeout: Duration) -> Result<Self::Output, Elapsed>;

    /// Resolve the future, panicking if `timeout` passes first.
    async fn with_timeout_panic(self, timeout: Duration) -> Self::Output;
}

#[async_trait]
impl<F> FutureTimeout for F
where
    F: Future + Send,
{
    async fn with_timeout(self, timeout: Duration) -> Result<Self::Output, Elapsed> {
        tokio::time::timeout(timeout, self).await
    }

    async fn with_timeout_panic(self, timeout: Duration) -> Self::Output {
        tokio::time::timeout(timeout, self)
            .await
            .expect("future did not complete within the timeout")
    }
}

/// Async variant of [`crate::wait_for_condition`]: polls `condition` without
/// blocking runtime workers, panicking with `description` once `timeout`
/// passes.
pub async fn wait_for_condition_async(
    description: &str,
    timeout: Duration,
    mut condition: impl FnMut() -> bool + Send,
) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(crate::POLL_INTERVAL).await;
        }
    };
    if poll.with_timeout(timeout).await.is_err() {
        panic!("condition not reached within {:?}: {}", timeout, description);
    }
}
