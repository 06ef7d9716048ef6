//! HTTP client for the model server's REST API.

use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{ClientConfig, ClientError, Result};

/// Outcome of a status or metadata query. Non-2xx answers land here, not in `Err`.
#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub status: u16,
    /// Parsed JSON, or the raw text as a JSON string when the body is not JSON.
    pub body: Value,
}

impl StatusReport {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    instances: &'a [Vec<f32>],
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Vec<Vec<f32>>,
}

pub struct ServingClient {
    client: Client,
    endpoint: String,
    config: ClientConfig,
}

impl ServingClient {
    pub fn new(endpoint: &str, config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(format!("bundleport/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::transport(endpoint, e))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn model_url(&self, model: &str, version: Option<u64>) -> String {
        match version {
            Some(v) => format!("{}/v1/models/{model}/versions/{v}", self.endpoint),
            None => format!("{}/v1/models/{model}", self.endpoint),
        }
    }

    /// Sends the request built by `build`, retrying timeouts and connection
    /// failures with exponential backoff.
    async fn send(&self, url: &str, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let err = match build().send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => ClientError::transport(url, e),
            };
            if !err.is_retryable() || attempt >= self.config.max_retries {
                return Err(err);
            }
            let delay = self.config.backoff(attempt);
            warn!(%url, attempt, ?delay, error = %err, "request failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn report(&self, url: String) -> Result<StatusReport> {
        let resp = self.send(&url, || self.client.get(&url)).await?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| ClientError::transport(&url, e))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        debug!(%url, status, "status query answered");
        Ok(StatusReport { status, body })
    }

    /// `GET /v1/models/{model}[/versions/{v}]`
    pub async fn status(&self, model: &str, version: Option<u64>) -> Result<StatusReport> {
        self.report(self.model_url(model, version)).await
    }

    /// `GET /v1/models/{model}[/versions/{v}]/metadata`
    pub async fn metadata(&self, model: &str, version: Option<u64>) -> Result<StatusReport> {
        self.report(format!("{}/metadata", self.model_url(model, version)))
            .await
    }

    /// `POST /v1/models/{model}:predict`, one output row per instance.
    pub async fn predict(&self, model: &str, instances: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        check_rows(instances, None)?;
        let url = format!("{}:predict", self.model_url(model, None));
        let body = PredictRequest { instances };

        let resp = self
            .send(&url, || self.client.post(&url).json(&body))
            .await?;
        let decoded: PredictResponse = decode(&url, resp).await?;

        if decoded.predictions.len() != instances.len() {
            return Err(ClientError::Shape(format!(
                "sent {} instances, got {} predictions",
                instances.len(),
                decoded.predictions.len()
            )));
        }
        debug!(%url, rows = instances.len(), "prediction received");
        Ok(decoded.predictions)
    }

    /// Like [`predict`](Self::predict) but also requires every row to have `input_dim` values.
    pub async fn predict_checked(
        &self,
        model: &str,
        instances: &[Vec<f32>],
        input_dim: usize,
    ) -> Result<Vec<Vec<f32>>> {
        check_rows(instances, Some(input_dim))?;
        self.predict(model, instances).await
    }
}

fn check_rows(instances: &[Vec<f32>], input_dim: Option<usize>) -> Result<()> {
    let Some(first) = instances.first() else {
        return Err(ClientError::Shape("no instances to send".to_string()));
    };
    let width = input_dim.unwrap_or(first.len());
    if width == 0 {
        return Err(ClientError::Shape("instances must not be empty".to_string()));
    }
    if let Some((i, row)) = instances.iter().enumerate().find(|(_, r)| r.len() != width) {
        return Err(ClientError::Shape(format!(
            "instance {i} has {} values, expected {width}",
            row.len()
        )));
    }
    Ok(())
}

async fn decode<T: DeserializeOwned>(url: &str, resp: Response) -> Result<T> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| ClientError::transport(url, e))?;
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            body: text,
        });
    }
    serde_json::from_str(&text).map_err(|e| ClientError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ragged_rows() {
        let rows = vec![vec![0.0; 4], vec![0.0; 3]];
        let err = check_rows(&rows, None).unwrap_err();
        assert!(err.to_string().contains("instance 1"));
    }

    #[test]
    fn enforces_expected_width() {
        let rows = vec![vec![0.0; 4]];
        assert!(check_rows(&rows, Some(4)).is_ok());
        assert!(check_rows(&rows, Some(784)).is_err());
        assert!(check_rows(&[], None).is_err());
        assert!(check_rows(&[Vec::new()], None).is_err());
    }
}
