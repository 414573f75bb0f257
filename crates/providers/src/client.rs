use reqwest::Client;
use std::time::Duration;
use tracing::warn;

/// Builds the shared HTTP client used for provider calls.
///
/// Proxy settings come from `HTTPS_PROXY`/`HTTP_PROXY` through reqwest's own
/// environment handling.
pub fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to build HTTP client, using default");
            Client::new()
        })
}
