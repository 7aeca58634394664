use std::future::Future;
use std::time::Duration;

use tokio::time;
use tracing::warn;

use common::{Error, Result};

use crate::config::RetryPolicy;

/// Run one scheduler call under `rpc_timeout`, retrying transient failures
/// with backoff until the policy's attempts run out.
pub async fn with_retry<T, F, Fut>(
    op: &str,
    policy: &RetryPolicy,
    rpc_timeout: Duration,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let err = match time::timeout(rpc_timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_transient() => e,
            Ok(Err(e)) => return Err(e),
            Err(_) => Error::TransientScheduler(format!("{op} timed out after {rpc_timeout:?}")),
        };

        attempt += 1;
        if attempt >= attempts {
            return Err(err);
        }
        let delay = policy.backoff(attempt - 1);
        warn!("{op} failed ({err}), retry {attempt}/{} in {delay:?}", attempts - 1);
        time::sleep(delay).await;
    }
}
