//! Pull transport: periodic requests for the latest sample

use crate::config::LiveConfig;
use crate::transport::traits::{PullConnector, TransportError};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use treadmill_shared::live;

/// Connector for the latest-sample endpoint
pub struct PollingConnector {
    client: Client,
    url: String,
}

impl PollingConnector {
    /// Create a connector for the given endpoint URL
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Create a connector for the latest-sample endpoint of `config`
    pub fn from_config(config: &LiveConfig) -> Result<Self, TransportError> {
        Self::new(config.latest_url(), config.request_timeout)
    }
}

#[async_trait]
impl PullConnector for PollingConnector {
    async fn fetch_latest(&self, credential: Option<&str>) -> Result<String, TransportError> {
        let mut request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "application/json");

        if let Some(key) = credential {
            request = request.header(live::API_KEY_HEADER, key);
        }

        let response = request.send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(TransportError::NotFound),
            status if !status.is_success() => Err(TransportError::Status {
                code: status.as_u16(),
            }),
            _ => Ok(response.text().await?),
        }
    }

    fn name(&self) -> &'static str {
        "Polling"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polling_connector_from_config() {
        let config = LiveConfig {
            base_url: "http://127.0.0.1:3000".into(),
            ..Default::default()
        };
        let connector = PollingConnector::from_config(&config).expect("client");
        assert_eq!(connector.url, "http://127.0.0.1:3000/api/live/latest");
        assert_eq!(connector.name(), "Polling");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_request_error() {
        // Port 9 (discard) is not expected to run an HTTP server locally
        let connector = PollingConnector::new("http://127.0.0.1:9/api/live/latest", Duration::from_secs(2))
            .expect("client");

        let result = connector.fetch_latest(None).await;
        assert!(matches!(result, Err(TransportError::Request(_))));
    }
}
