//! One outgoing HTTP POST per payload.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{Connector, ServiceOutcome};

/// Sends each payload as its own JSON POST request.
///
/// Exactly one [`ServiceOutcome`] is produced per [`Connector::call`].
/// Any network failure, timeout, or non-2xx status is converted to
/// [`ServiceOutcome::Err`] rather than propagated.
pub struct DirectHttpConnector {
    client: reqwest::Client,
    url: String,
}

impl DirectHttpConnector {
    /// Build a connector posting to `url` with a total request timeout
    /// of `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is always valid here");
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Connector for DirectHttpConnector {
    async fn call(&self, payload: Value) -> ServiceOutcome {
        let resp = self.client.post(&self.url).json(&payload).send().await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %self.url, error = %e, "direct http connector request failed");
                return ServiceOutcome::Err(e.to_string());
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(url = %self.url, %status, "direct http connector received non-2xx");
            return ServiceOutcome::Err(format!("http {status}: {body}"));
        }

        match resp.json::<Value>().await {
            Ok(v) => ServiceOutcome::Ok(v),
            Err(e) => {
                warn!(url = %self.url, error = %e, "direct http connector response was not JSON");
                ServiceOutcome::Err(e.to_string())
            }
        }
    }
}
