//! Health verifier

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use url::Url;

use crate::errors::DeployError;

/// Where the running service answers requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `http://host:port/...`
    Http(Url),

    /// `unix:/path/to.sock`
    UnixSocket(PathBuf),
}

impl FromStr for Endpoint {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(DeployError::ConfigError("empty unix socket path".to_string()));
            }
            return Ok(Endpoint::UnixSocket(PathBuf::from(path)));
        }

        let url = Url::parse(s)
            .map_err(|e| DeployError::ConfigError(format!("invalid health endpoint '{s}': {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(Endpoint::Http(url)),
            other => Err(DeployError::ConfigError(format!(
                "unsupported health endpoint scheme '{other}'"
            ))),
        }
    }
}

/// Result of a health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Issues a minimal request against the running service
#[derive(Debug, Clone)]
pub struct HealthVerifier {
    path: String,
    timeout: Duration,
}

impl HealthVerifier {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    /// Any non-error response is healthy; connection failures, timeouts and
    /// 4xx/5xx statuses are not.
    pub async fn check(&self, endpoint: &Endpoint) -> HealthStatus {
        let result = tokio::time::timeout(self.timeout, self.request(endpoint)).await;
        let status = match result {
            Ok(Ok(code)) if code < 400 => HealthStatus::Healthy,
            Ok(Ok(code)) => HealthStatus::Unhealthy(format!("HTTP status {code}")),
            Ok(Err(reason)) => HealthStatus::Unhealthy(reason),
            Err(_) => HealthStatus::Unhealthy(format!("no response within {:?}", self.timeout)),
        };

        match &status {
            HealthStatus::Healthy => info!("Health check passed"),
            HealthStatus::Unhealthy(reason) => warn!("Health check failed: {}", reason),
        }
        status
    }

    async fn request(&self, endpoint: &Endpoint) -> Result<u16, String> {
        match endpoint {
            Endpoint::Http(base) => {
                let url = base.join(&self.path).map_err(|e| e.to_string())?;
                let client = reqwest::Client::builder()
                    .timeout(self.timeout)
                    .build()
                    .map_err(|e| e.to_string())?;
                let response = client.get(url).send().await.map_err(|e| e.to_string())?;
                Ok(response.status().as_u16())
            }
            Endpoint::UnixSocket(path) => self.request_unix(path).await,
        }
    }

    #[cfg(unix)]
    async fn request_unix(&self, path: &std::path::Path) -> Result<u16, String> {
        let mut stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| format!("connect {}: {}", path.display(), e))?;

        let request = format!(
            "GET {} HTTP/1.0\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            self.path
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| e.to_string())?;

        let mut head = Vec::with_capacity(256);
        let mut buf = [0u8; 256];
        while !head.contains(&b'\n') {
            let n = stream.read(&mut buf).await.map_err(|e| e.to_string())?;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }

        parse_status_line(&head).ok_or_else(|| "malformed HTTP response".to_string())
    }

    #[cfg(not(unix))]
    async fn request_unix(&self, path: &std::path::Path) -> Result<u16, String> {
        Err(format!("unix sockets unsupported: {}", path.display()))
    }
}

/// Status code from `HTTP/1.x NNN ...`
fn parse_status_line(head: &[u8]) -> Option<u16> {
    let line = head.split(|b| *b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
