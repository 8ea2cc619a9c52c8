use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use beacon_core::cluster::Announcement;
use beacon_core::error::{BeaconError, Result};

/// Path prefix of the inbound connector endpoint.
pub const CONNECTOR_PATH: &str = "/beacon/connector";

/// Delivery of an announcement to a peer's connector endpoint.
#[async_trait]
pub trait ConnectorTransport: Send + Sync {
    /// Post `announcement` to `url` and return the peer's answer, if any.
    async fn ping(&self, url: &str, announcement: &Announcement) -> Result<Option<Announcement>>;
}

/// HTTP transport posting JSON to `<url>/<ownerSlingId>`.
pub struct HttpConnectorTransport {
    client: reqwest::Client,
}

impl HttpConnectorTransport {
    /// Create a transport with its own HTTP client.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BeaconError::Connector(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Create a transport on an existing HTTP client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(url: &str, owner_id: &str) -> String {
        format!("{}/{}", url.trim_end_matches('/'), owner_id)
    }
}

#[async_trait]
impl ConnectorTransport for HttpConnectorTransport {
    async fn ping(&self, url: &str, announcement: &Announcement) -> Result<Option<Announcement>> {
        let response = self
            .client
            .post(Self::endpoint(url, &announcement.owner_id))
            .json(announcement)
            .send()
            .await
            .map_err(|e| BeaconError::Connector(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| BeaconError::Connector(e.to_string()))?;
                Announcement::from_json(&body).map(Some)
            }
            StatusCode::NO_CONTENT => Ok(None),
            status => Err(BeaconError::Connector(format!(
                "connector answered with status {}",
                status
            ))),
        }
    }
}
