//! Carrier delivery-status lookup.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::CarrierConfig;
use crate::error::CarrierError;

/// Carrier answer for one tracking number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatus {
    pub is_delivered: bool,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl DeliveryStatus {
    pub fn in_transit() -> Self {
        Self {
            is_delivered: false,
            delivered_at: None,
        }
    }

    pub fn delivered(at: Option<DateTime<Utc>>) -> Self {
        Self {
            is_delivered: true,
            delivered_at: at,
        }
    }
}

#[async_trait]
pub trait CarrierTracker: Send + Sync {
    async fn lookup(&self, tracking_number: &str) -> Result<DeliveryStatus, CarrierError>;
}

/// HTTP client for the carrier tracking service.
///
/// `GET {base_url}/v1/tracking?trackingNumber=…` with an optional bearer
/// token. The request timeout is the configured lookup timeout.
#[derive(Debug, Clone)]
pub struct HttpCarrierTracker {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    timeout: Duration,
}

impl HttpCarrierTracker {
    pub fn new(config: &CarrierConfig) -> Result<Self, CarrierError> {
        let client = reqwest::Client::builder()
            .timeout(config.lookup_timeout)
            .build()
            .map_err(|e| CarrierError::Transport(format!("client setup failed: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_token: config.api_token.clone(),
            timeout: config.lookup_timeout,
        })
    }

    fn map_transport(&self, err: reqwest::Error) -> CarrierError {
        if err.is_timeout() {
            CarrierError::Timeout(self.timeout.as_millis() as u64)
        } else {
            CarrierError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl CarrierTracker for HttpCarrierTracker {
    async fn lookup(&self, tracking_number: &str) -> Result<DeliveryStatus, CarrierError> {
        let url = format!("{}/v1/tracking", self.base_url);
        let mut req = self
            .client
            .get(&url)
            .query(&[("trackingNumber", tracking_number)]);
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| self.map_transport(e))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(CarrierError::Rejected {
                status,
                message: resp.text().await.unwrap_or_default(),
            });
        }

        resp.json::<DeliveryStatus>()
            .await
            .map_err(|e| CarrierError::Decode(e.to_string()))
    }
}
