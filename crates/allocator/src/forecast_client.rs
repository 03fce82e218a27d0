//! HTTP client for the prediction service

use allocator_lib::error::ForecastError;
use allocator_lib::forecast::ForecastProvider;
use allocator_lib::models::{ForecastKey, ForecastResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Prediction service response body
#[derive(Debug, Deserialize)]
struct ForecastResponse {
    predicted_demand: f64,
    confidence: f64,
    #[serde(default)]
    generated_at: Option<DateTime<Utc>>,
}

/// Queries `GET {endpoint}/v1/forecast?instance_type=..&region=..&horizon_secs=..`
pub struct HttpForecastProvider {
    client: Client,
    base_url: Url,
}

impl HttpForecastProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let mut base_url = Url::parse(endpoint).context("Invalid forecast endpoint URL")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self { client, base_url })
    }

    fn forecast_url(&self, key: &ForecastKey, horizon: Duration) -> Result<Url, ForecastError> {
        let mut url = self
            .base_url
            .join("v1/forecast")
            .map_err(|e| ForecastError::Collaborator(format!("invalid forecast path: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("instance_type", &key.instance_type)
            .append_pair("region", &key.region)
            .append_pair("horizon_secs", &horizon.as_secs().to_string());
        Ok(url)
    }
}

#[async_trait]
impl ForecastProvider for HttpForecastProvider {
    async fn forecast(&self, key: &ForecastKey, horizon: Duration) -> Result<ForecastResult, ForecastError> {
        let url = self.forecast_url(key, horizon)?;
        debug!(key = %key, url = %url, "Requesting forecast");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ForecastError::Collaborator(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ForecastError::Collaborator(format!(
                "prediction service error ({}): {}",
                status, body
            )));
        }

        let body: ForecastResponse = response
            .json()
            .await
            .map_err(|e| ForecastError::Collaborator(format!("invalid response: {}", e)))?;

        Ok(ForecastResult {
            key: key.clone(),
            predicted_demand: body.predicted_demand,
            horizon_secs: horizon.as_secs(),
            confidence: body.confidence,
            generated_at: body.generated_at.unwrap_or_else(Utc::now),
            degraded: false,
        })
    }
}
