//! The capability the sync engine needs from the network: send bytes, get
//! bytes and a status code back.
//!
//! Token issuance and the login flow live outside this crate. Callers hand
//! a [`Session`] to every call and own its lifecycle; nothing here caches
//! credentials.

use async_trait::async_trait;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bearer credentials for one logged-in user.
#[derive(Clone)]
pub struct Session {
    token: Zeroizing<String>,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Session(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request never produced an HTTP status (DNS, TLS, reset, timeout).
#[derive(Debug, Error)]
#[error("network error: {message}")]
pub struct NetworkError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl NetworkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Issue one authenticated request. Any HTTP status, including errors,
    /// comes back as `Ok`; only failures to get a status at all are `Err`.
    async fn send(
        &self,
        method: Method,
        path: &str,
        session: &Session,
        body: Option<&[u8]>,
    ) -> Result<TransportResponse, NetworkError>;
}

/// [`TransportClient`] over HTTPS using reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NetworkError::with_source("failed to build HTTP client", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TransportClient for HttpTransport {
    async fn send(
        &self,
        method: Method,
        path: &str,
        session: &Session,
        body: Option<&[u8]>,
    ) -> Result<TransportResponse, NetworkError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = match method {
            Method::Get => self.client.get(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        }
        .bearer_auth(session.token());
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_vec());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| NetworkError::with_source(format!("{} {} failed", method, path), e))?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(|e| {
            NetworkError::with_source(format!("failed to read response to {} {}", method, path), e)
        })?;
        debug!(%method, path, status, "http exchange");

        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_debug_hides_token() {
        let session = Session::new("eyJhbGciOi.secret");
        assert_eq!(session.token(), "eyJhbGciOi.secret");
        assert_eq!(format!("{:?}", session), "Session(..)");
    }

    #[test]
    fn test_response_success_range() {
        assert!(TransportResponse::new(200, b"".to_vec()).is_success());
        assert!(TransportResponse::new(204, Vec::new()).is_success());
        assert!(!TransportResponse::new(199, Vec::new()).is_success());
        assert!(!TransportResponse::new(409, Vec::new()).is_success());
    }

    #[test]
    fn test_http_transport_trims_base_url() {
        let transport =
            HttpTransport::new("https://notes.example.com/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(transport.base_url, "https://notes.example.com/api");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        // Port 9 on localhost: connection refused without touching the network.
        let transport = HttpTransport::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let result = transport
            .send(Method::Get, "/notes/", &Session::new("t"), None)
            .await;
        assert!(result.is_err());
    }
}
