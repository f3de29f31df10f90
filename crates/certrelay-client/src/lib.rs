//! Client for the certificate relay server
//!
//! Authenticates with the challenge-response handshake, caches the bearer
//! token until it expires and fetches certificate resources by domain.

use std::time::Duration;

use certrelay_auth::{compute_response_hash, generate_nonce};
use certrelay_proto::{
    AuthChallenge, AuthToken, CertResponse, CertificateResource, ChallengeResponse,
    TokenResponse, AUTH_REQUEST_PATH, AUTH_TOKEN_PATH, CERT_PATH, DOMAIN_QUERY_PARAM,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid client configuration: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned status {0}")]
    ServerStatus(u16),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Remote(String),

    #[error("Authentication failed: {0}")]
    Auth(String),
}

/// Connection settings
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Base URL, e.g. `https://relay.example.com`
    pub server: String,
    pub secret: String,
    /// Accept any server certificate
    pub skip_verify: bool,
    /// Per-request timeout; none by default
    pub request_timeout: Option<Duration>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server)
            .field("secret", &"[REDACTED]")
            .field("skip_verify", &self.skip_verify)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Fetches certificate resources from a relay server
pub struct RemoteCertClient {
    base_url: String,
    secret: String,
    http: reqwest::Client,
    token: Mutex<Option<AuthToken>>,
}

impl RemoteCertClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        if config.secret.is_empty() {
            return Err(ClientError::Config("secret is required".to_string()));
        }
        if config.server.is_empty() {
            return Err(ClientError::Config("server is required".to_string()));
        }

        let mut builder = reqwest::Client::builder();
        if config.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            base_url: config.server.trim_end_matches('/').to_string(),
            secret: config.secret,
            http: builder.build()?,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetch the current certificate resource for `domain`
    pub async fn fetch_certificate(&self, domain: &str) -> Result<CertificateResource, ClientError> {
        let token = self.bearer_token().await?;

        debug!("Fetching certificate for {}", domain);
        let response: CertResponse = read_json(
            self.http
                .get(self.url(CERT_PATH))
                .query(&[(DOMAIN_QUERY_PARAM, domain)])
                .bearer_auth(token)
                .send()
                .await?,
        )
        .await?;

        if response.is_auth_failure() {
            self.invalidate_token().await;
            return Err(ClientError::Auth(
                response
                    .error
                    .unwrap_or_else(|| "token rejected".to_string()),
            ));
        }

        if let Some(error) = response.error {
            return Err(ClientError::Remote(error));
        }

        response
            .cr
            .ok_or_else(|| ClientError::Protocol("No certificate resource in response".to_string()))
    }

    /// Forget the cached token so the next call re-authenticates
    pub async fn invalidate_token(&self) {
        debug!("Dropping cached bearer token");
        *self.token.lock().await = None;
    }

    /// A valid token, reusing the cached one until it expires
    async fn bearer_token(&self) -> Result<String, ClientError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.is_expired() {
                return Ok(token.token.clone());
            }
            debug!("Cached bearer token expired");
        }

        let token = self.acquire_token().await?;
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn acquire_token(&self) -> Result<AuthToken, ClientError> {
        debug!("Requesting auth challenge from {}", self.base_url);
        let challenge: AuthChallenge =
            read_json(self.http.get(self.url(AUTH_REQUEST_PATH)).send().await?).await?;

        let client_nonce = generate_nonce();
        let answer = ChallengeResponse {
            hash: compute_response_hash(&self.secret, &challenge.nonce, &client_nonce),
            nonce: challenge.nonce,
            client_nonce,
        };

        let response: TokenResponse = read_json(
            self.http
                .post(self.url(AUTH_TOKEN_PATH))
                .json(&answer)
                .send()
                .await?,
        )
        .await?;

        if let Some(error) = response.error {
            return Err(ClientError::Auth(error));
        }

        let (Some(token), Some(exp)) = (response.token, response.exp) else {
            return Err(ClientError::Protocol(
                "Token missing from response".to_string(),
            ));
        };

        let token = AuthToken { token, exp };
        if token.is_expired_at(Utc::now().timestamp()) {
            return Err(ClientError::Auth("token already expired".to_string()));
        }

        debug!("Acquired bearer token expiring at {}", token.exp);
        Ok(token)
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::ServerStatus(status.as_u16()));
    }

    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| ClientError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let err = RemoteCertClient::new(ClientConfig {
            server: "https://relay.example.com".to_string(),
            ..Default::default()
        });
        assert!(matches!(err, Err(ClientError::Config(_))));

        let err = RemoteCertClient::new(ClientConfig {
            secret: "s".to_string(),
            ..Default::default()
        });
        assert!(matches!(err, Err(ClientError::Config(_))));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = RemoteCertClient::new(ClientConfig {
            server: "https://relay.example.com/".to_string(),
            secret: "s".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            client.url(CERT_PATH),
            "https://relay.example.com/getcert"
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = ClientConfig {
            server: "https://relay.example.com".to_string(),
            secret: "hunter2".to_string(),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
