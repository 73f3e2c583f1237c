//! HTTP client for the BACnet/IP gateway service.
//!
//! The gateway owns the BACnet stack; this client only speaks its REST API:
//!
//! - `POST {base}/devices/resolve` locates a device and reads its identifying
//!   properties
//! - `POST {base}/devices/{mac}/{instance}/read-multiple` reads present values
//!   of many points in one request

use crate::encoding::{decode_read_response, encode_mac_segment, ReadRequest};
use async_trait::async_trait;
use devpoll_core::{
    DeviceResolver, FetchResults, GatewayError, PointId, PropertyFetchGateway, RemoteDevice,
    ResolveError, ResolveRequest,
};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct GatewayClientConfig {
    /// Base URL of the gateway (e.g., <http://localhost:8090/api>)
    pub base_url: String,
    /// Request timeout; also bounds how long one poll tick can block
    pub timeout: Duration,
    /// Optional bearer token for authentication
    pub bearer_token: Option<String>,
    /// Custom CA certificate path for self-signed server certs (PEM format)
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate path for mTLS authentication (PEM format)
    pub client_cert_path: Option<PathBuf>,
    /// Client private key path for mTLS authentication (PEM format)
    pub client_key_path: Option<PathBuf>,
}

impl Default for GatewayClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090/api".to_string(),
            timeout: Duration::from_secs(10),
            bearer_token: None,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
        }
    }
}

/// HTTP client implementing [`PropertyFetchGateway`] and [`DeviceResolver`].
pub struct GatewayClient {
    client: Client,
    config: GatewayClientConfig,
}

#[derive(Debug, Serialize)]
struct ResolveBody<'a> {
    mac: &'a str,
    instance_number: u32,
    poll_interval_ms: u64,
    cov_mode: &'static str,
    cov_lease_minutes: u32,
}

impl GatewayClient {
    /// Create a new gateway client.
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is invalid, the HTTP client cannot be
    /// created, or TLS certificate files cannot be read or parsed.
    pub fn new(mut config: GatewayClientConfig) -> Result<Self, ClientError> {
        let url = Url::parse(&config.base_url)
            .map_err(|e| ClientError::Init(format!("invalid base URL {}: {e}", config.base_url)))?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(ClientError::Init(format!(
                    "unsupported scheme '{scheme}' in {}",
                    config.base_url
                )))
            }
        }
        config.base_url = config.base_url.trim_end_matches('/').to_string();

        let mut builder = Client::builder().timeout(config.timeout);

        if url.scheme() == "https" {
            builder = builder.use_rustls_tls();

            if let Some(ca_path) = &config.ca_cert_path {
                let ca_cert = fs::read(ca_path).map_err(|e| {
                    ClientError::Init(format!(
                        "failed to read CA certificate {}: {e}",
                        ca_path.display()
                    ))
                })?;
                let cert = reqwest::Certificate::from_pem(&ca_cert).map_err(|e| {
                    ClientError::Init(format!("failed to parse CA certificate: {e}"))
                })?;
                builder = builder.add_root_certificate(cert);
                tracing::debug!(ca_path = %ca_path.display(), "Loaded custom CA certificate");
            }

            if let (Some(cert_path), Some(key_path)) =
                (&config.client_cert_path, &config.client_key_path)
            {
                let cert_pem = fs::read(cert_path).map_err(|e| {
                    ClientError::Init(format!(
                        "failed to read client certificate {}: {e}",
                        cert_path.display()
                    ))
                })?;
                let key_pem = fs::read(key_path).map_err(|e| {
                    ClientError::Init(format!(
                        "failed to read client key {}: {e}",
                        key_path.display()
                    ))
                })?;

                let mut identity_pem = cert_pem;
                identity_pem.extend_from_slice(&key_pem);

                let identity = reqwest::Identity::from_pem(&identity_pem).map_err(|e| {
                    ClientError::Init(format!("failed to create client identity: {e}"))
                })?;
                builder = builder.identity(identity);
                tracing::debug!(
                    cert_path = %cert_path.display(),
                    key_path = %key_path.display(),
                    "Loaded client certificate for mTLS"
                );
            }
        }

        let client = builder
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Base URL without trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn with_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// URL of the read-multiple endpoint for a device.
    #[must_use]
    pub fn read_url(&self, device: &RemoteDevice) -> String {
        format!(
            "{}/devices/{}/{}/read-multiple",
            self.config.base_url,
            encode_mac_segment(&device.identity.mac),
            device.identity.instance_number
        )
    }

    /// Locate a device.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotFound`] on 404, other variants on network or
    /// API errors.
    pub async fn resolve_device(&self, request: &ResolveRequest) -> Result<RemoteDevice, ClientError> {
        let url = format!("{}/devices/resolve", self.config.base_url);
        let body = ResolveBody {
            mac: &request.identity.mac,
            instance_number: request.identity.instance_number,
            poll_interval_ms: u64::try_from(request.poll_interval.as_millis()).unwrap_or(u64::MAX),
            cov_mode: request.cov_mode.as_str(),
            cov_lease_minutes: request.cov_lease_minutes,
        };

        tracing::debug!(url, identity = %request.identity, "POST resolve");

        let response = self
            .with_auth(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound);
        }
        if !response.status().is_success() {
            return Err(ClientError::ApiError {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))
    }

    /// Read present values of `points` in a single request.
    ///
    /// # Errors
    ///
    /// Returns error on network or API errors, or if the response cannot be
    /// parsed.
    pub async fn read_multiple(
        &self,
        device: &RemoteDevice,
        points: &[PointId],
    ) -> Result<Value, ClientError> {
        let url = self.read_url(device);

        tracing::debug!(url, points = points.len(), "POST read-multiple");

        let response = self
            .with_auth(self.client.post(&url).json(&ReadRequest { points }))
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::ApiError {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))
    }
}

#[async_trait]
impl PropertyFetchGateway for GatewayClient {
    async fn fetch(
        &self,
        device: &RemoteDevice,
        points: &[PointId],
    ) -> Result<FetchResults, GatewayError> {
        let body = self.read_multiple(device, points).await.map_err(|e| match e {
            ClientError::Parse(msg) => GatewayError::InvalidResponse(msg),
            other => GatewayError::Transport(other.to_string()),
        })?;
        decode_read_response(body, points)
    }
}

#[async_trait]
impl DeviceResolver for GatewayClient {
    async fn resolve(&self, request: &ResolveRequest) -> Result<RemoteDevice, ResolveError> {
        self.resolve_device(request).await.map_err(|e| match e {
            ClientError::NotFound => ResolveError::NotFound(request.identity.clone()),
            other => ResolveError::Transport(other.to_string()),
        })
    }
}

/// Errors that can occur with the gateway client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Client initialization failed
    #[error("client init error: {0}")]
    Init(String),
    /// HTTP request failed
    #[error("request error: {0}")]
    Request(String),
    /// Gateway reports no such device
    #[error("device not found")]
    NotFound,
    /// API returned an error status
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from API
        message: String,
    },
    /// Response parsing failed
    #[error("parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpoll_core::{CovMode, NetworkIdentity};
    use tokio_test::assert_err;

    #[test]
    fn config_default() {
        let config = GatewayClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:8090/api");
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.bearer_token.is_none());
        assert!(config.ca_cert_path.is_none());
    }

    #[test]
    fn trailing_slash_trimmed() {
        let client = GatewayClient::new(GatewayClientConfig {
            base_url: "http://gw.local:8090/api/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://gw.local:8090/api");
    }

    #[test]
    fn read_url_encodes_mac() {
        let client = GatewayClient::new(GatewayClientConfig::default()).unwrap();
        let device = RemoteDevice::bare(NetworkIdentity::new("10.0.1.50:47808", 1001));
        assert_eq!(
            client.read_url(&device),
            "http://localhost:8090/api/devices/10.0.1.50%3A47808/1001/read-multiple"
        );
    }

    #[test]
    fn unsupported_scheme_rejected() {
        let result = GatewayClient::new(GatewayClientConfig {
            base_url: "ftp://gw.local".to_string(),
            ..Default::default()
        });
        let err_msg = format!("{}", result.err().unwrap());
        assert!(err_msg.contains("unsupported scheme"));
    }

    #[test]
    fn client_creation_with_invalid_ca_fails() {
        let config = GatewayClientConfig {
            base_url: "https://localhost:8443".to_string(),
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };

        let result = GatewayClient::new(config);
        let err_msg = format!("{}", result.err().unwrap());
        assert!(err_msg.contains("client init error"));
    }

    #[tokio::test]
    async fn unreachable_gateway_is_transport_error() {
        let client = GatewayClient::new(GatewayClientConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap();
        let request = ResolveRequest {
            identity: NetworkIdentity::new("10.0.1.50:47808", 1001),
            poll_interval: Duration::from_secs(5),
            cov_mode: CovMode::None,
            cov_lease_minutes: 0,
        };

        let err = assert_err!(DeviceResolver::resolve(&client, &request).await);
        assert!(matches!(err, ResolveError::Transport(_)));
    }
}
