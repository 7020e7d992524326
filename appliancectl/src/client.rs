//! HTTP client for the operator API.

use anyhow::{Context, Result};
use appliance_operator::appliance::{Appliance, ApplianceKey, ApplianceSpec};
use reqwest::StatusCode;
use serde::Deserialize;

/// Errors returned by the operator API
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("appliance {0} not found")]
    NotFound(String),

    #[error("operator rejected the request ({status}): {message}")]
    Api { status: StatusCode, message: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn appliance_url(&self, key: &ApplianceKey) -> String {
        format!("{}/api/appliances/{}/{}", self.base_url, key.namespace, key.name)
    }

    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<Appliance>, ClientError> {
        let mut request = self.client.get(format!("{}/api/appliances", self.base_url));
        if let Some(namespace) = namespace {
            request = request.query(&[("namespace", namespace)]);
        }
        let response = request.send().await?;
        handle_response(response, "").await
    }

    pub async fn get(&self, key: &ApplianceKey) -> Result<Appliance, ClientError> {
        let response = self.client.get(self.appliance_url(key)).send().await?;
        handle_response(response, &key.to_string()).await
    }

    pub async fn set_power(&self, key: &ApplianceKey, power: bool) -> Result<Appliance, ClientError> {
        let response = self
            .client
            .put(self.appliance_url(key))
            .json(&ApplianceSpec { power })
            .send()
            .await?;
        handle_response(response, &key.to_string()).await
    }

    pub async fn delete(&self, key: &ApplianceKey) -> Result<(), ClientError> {
        let response = self.client.delete(self.appliance_url(key)).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(error_from(response, &key.to_string()).await)
    }

    /// Raw health document and whether the operator reported itself healthy
    pub async fn health(&self) -> Result<(bool, serde_json::Value), ClientError> {
        let response = self
            .client
            .get(format!("{}/api/health", self.base_url))
            .send()
            .await?;
        let healthy = response.status().is_success();
        Ok((healthy, response.json().await?))
    }
}

async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    subject: &str,
) -> Result<T, ClientError> {
    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        Err(error_from(response, subject).await)
    }
}

async fn error_from(response: reqwest::Response, subject: &str) -> ClientError {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return ClientError::NotFound(subject.to_string());
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    ClientError::Api { status, message }
}
