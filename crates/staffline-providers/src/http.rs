use std::collections::HashMap;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use staffline_core::config::ProviderConfig;
use staffline_core::error::{Result, StafflineError};
use staffline_core::traits::IntegrationProvider;
use staffline_core::types::*;

/// Generic JSON-over-HTTP provider.
///
/// POSTs the request envelope to the configured endpoint. Any 2xx answer is
/// a success; the correlation id is read from `correlation_id`, `id` or
/// `reference` in the response body, falling back to the attempt id.
pub struct HttpProvider {
    http: Client,
    name: String,
    endpoint: String,
    api_key: Option<String>,
    headers: HashMap<String, String>,
    timeout_secs: u64,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, config: &ProviderConfig) -> Self {
        Self {
            http: Client::new(),
            name: name.into(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            headers: config.headers.clone(),
            timeout_secs: config.timeout_secs,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn provider_error(&self, message: impl Into<String>) -> StafflineError {
        StafflineError::Provider {
            provider: self.name.clone(),
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    kind: IntegrationKind,
    attempt_id: &'a AttemptId,
    attempt: u32,
    payload: &'a serde_json::Value,
}

#[derive(Deserialize, Default)]
struct Acknowledgement {
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    reference: Option<String>,
}

fn correlation_from(body: &serde_json::Value, fallback: &AttemptId) -> String {
    let ack: Acknowledgement = serde_json::from_value(body.clone()).unwrap_or_default();
    ack.correlation_id
        .or(ack.id)
        .or(ack.reference)
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

impl IntegrationProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, request: ProviderRequest) -> BoxFuture<'_, Result<ProviderResponse>> {
        Box::pin(async move {
            let envelope = Envelope {
                kind: request.kind,
                attempt_id: &request.attempt_id,
                attempt: request.attempt,
                payload: &request.payload,
            };

            let mut req = self
                .http
                .post(&self.endpoint)
                // Stable across every try of one attempt
                .header("Idempotency-Key", request.attempt_id.as_str())
                .json(&envelope);
            if let Some(api_key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            for (k, v) in &self.headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .send()
                .await
                .map_err(|e| self.provider_error(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(self.provider_error(format!("HTTP {}: {}", status, body)));
            }

            let text = response
                .text()
                .await
                .map_err(|e| self.provider_error(e.to_string()))?;
            let payload = if text.trim().is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(&text)
                    .unwrap_or_else(|_| serde_json::Value::String(text.clone()))
            };
            let correlation_id = correlation_from(&payload, &request.attempt_id);
            debug!(provider = %self.name, correlation_id = %correlation_id, "Provider accepted request");

            Ok(ProviderResponse {
                correlation_id,
                payload,
            })
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}
