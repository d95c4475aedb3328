//! Readiness polling against a node's HTTP health endpoint.

use std::future::Future;
use std::time::Duration;

use crate::error::{HarnessError, Result};

/// Per-request timeout for health and metrics calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the HTTP client used for `/healthz` and `/metrics`.
pub fn http_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_REQUEST_TIMEOUT)
        .build()?;
    Ok(client)
}

/// Poll `condition` until it returns true or `timeout` elapses.
///
/// The condition is always evaluated at least once, even with a zero timeout.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if condition().await {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Whether `GET url` answers 200. Any transport error counts as "not yet".
pub async fn probe(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) => resp.status() == reqwest::StatusCode::OK,
        Err(e) => {
            tracing::trace!(url = %url, error = %e, "Health probe failed");
            false
        }
    }
}

/// Wait until `url` answers 200, failing with [`HarnessError::NotReady`].
///
/// Each probe is cut off at the end of the window, so a hanging endpoint
/// cannot stretch the wait past `timeout`.
pub async fn wait_until_healthy(
    client: &reqwest::Client,
    node_id: &str,
    url: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let start = tokio::time::Instant::now();
    let healthy = wait_for(
        || {
            let remaining = timeout.saturating_sub(start.elapsed());
            async move {
                tokio::time::timeout(remaining, probe(client, url))
                    .await
                    .unwrap_or(false)
            }
        },
        timeout,
        poll_interval,
    )
    .await;

    if healthy {
        tracing::debug!(node_id = %node_id, url = %url, "Node is healthy");
        Ok(())
    } else {
        Err(HarnessError::NotReady {
            node_id: node_id.to_string(),
            url: url.to_string(),
            timeout,
        })
    }
}
