//! HTTP client for the registry gateway
//!
//! Sends every operation to the single configured endpoint with the fixed
//! authentication headers and classifies failures. No retries happen here.

use super::{GatewayError, GatewayRequest, Operation, RegistryGateway};
use crate::config::{AppConfig, ConfigError, HttpVerb};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Gateway client configuration
#[derive(Debug, Clone)]
pub struct GatewayClientConfig {
    pub endpoint_url: String,
    pub verb: HttpVerb,
    pub timeout: Duration,
    pub origin: String,
    pub referer: String,
    pub api_key: String,
}

impl GatewayClientConfig {
    /// Build from the service configuration, resolving the API key from the environment
    pub fn from_app_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint_url: config.gateway.endpoint_url()?.to_string(),
            verb: config.gateway.verb()?,
            timeout: Duration::from_secs(config.gateway.timeout_secs),
            origin: config.gateway.origin.clone(),
            referer: config.gateway.referer.clone(),
            api_key: config.get_gateway_api_key()?,
        })
    }
}

/// reqwest-backed gateway client; cheap to share behind an `Arc`
pub struct GatewayClient {
    config: GatewayClientConfig,
    client: Client,
    base_headers: HeaderMap,
}

impl GatewayClient {
    /// Create a new gateway client
    pub fn new(config: GatewayClientConfig) -> Result<Self, ConfigError> {
        if config.api_key.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "Gateway API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::InvalidConfig(format!("HTTP client: {e}")))?;

        let base_headers = Self::base_headers(&config)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            config,
            client,
            base_headers,
        })
    }

    /// Fixed header set attached to every call (pure)
    fn base_headers(config: &GatewayClientConfig) -> Result<HeaderMap, GatewayError> {
        let fixed = [
            ("origin", config.origin.as_str()),
            ("referer", config.referer.as_str()),
            ("x-requested-with", "XMLHttpRequest"),
            ("x-api-key", config.api_key.as_str()),
        ];

        let mut headers = HeaderMap::new();
        for (name, value) in fixed {
            if value.is_empty() {
                continue;
            }
            Self::insert_header(&mut headers, name, value)?;
        }
        Ok(headers)
    }

    /// Base headers merged with the caller's; caller values replace base values (pure)
    fn merged_headers(&self, request: &GatewayRequest) -> Result<HeaderMap, GatewayError> {
        let mut headers = self.base_headers.clone();
        for (name, value) in &request.headers {
            Self::insert_header(&mut headers, name, value)?;
        }
        Ok(headers)
    }

    fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), GatewayError> {
        let header_name =
            HeaderName::from_bytes(name.to_lowercase().as_bytes()).map_err(|_| {
                GatewayError::InvalidHeader {
                    name: name.to_string(),
                }
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|_| GatewayError::InvalidHeader {
            name: name.to_string(),
        })?;
        headers.insert(header_name, header_value);
        Ok(())
    }

    /// Decode a successful body; empty bodies become an empty object (pure)
    fn decode_body(operation: Operation, bytes: &[u8]) -> Result<Value, GatewayError> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_slice(bytes).map_err(|e| GatewayError::InvalidBody {
            operation,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl RegistryGateway for GatewayClient {
    async fn call(&self, request: &GatewayRequest) -> Result<Value, GatewayError> {
        let operation = request.operation;
        let headers = self.merged_headers(request)?;

        debug!(
            "Gateway call: operation={}, verb={}",
            operation, self.config.verb
        );

        let response = self
            .client
            .request(self.config.verb.as_method(), &self.config.endpoint_url)
            .headers(headers)
            .json(&request.body())
            .send()
            .await
            .map_err(|e| {
                let message = format!(
                    "{} (is_connect: {}, is_timeout: {})",
                    e,
                    e.is_connect(),
                    e.is_timeout()
                );
                error!("Gateway connection failure during {}: {}", operation, message);
                GatewayError::Network { operation, message }
            })?;

        let status = response.status();

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Gateway rejected {} request - Status: {}, Response: {}",
                operation, status, body
            );
            return Err(GatewayError::Rejected {
                operation,
                status: status.as_u16(),
                body,
            });
        }

        if !status.is_success() {
            error!("Gateway server error during {}: {}", operation, status);
            return Err(GatewayError::Unavailable {
                operation,
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| GatewayError::Network {
            operation,
            message: e.to_string(),
        })?;

        Self::decode_body(operation, &bytes)
    }
}
