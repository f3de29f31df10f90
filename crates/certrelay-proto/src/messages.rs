//! Request and response bodies

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::CertificateResource;

/// Server-issued challenge, consumed by exactly one token exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallenge {
    pub nonce: String,
    /// Expiry (unix seconds)
    pub exp: i64,
}

/// Client answer to an [`AuthChallenge`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub nonce: String,
    pub client_nonce: String,
    pub hash: String,
}

/// Short-lived bearer credential
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
    /// Expiry (unix seconds); the token is valid while `now < exp`
    pub exp: i64,
}

impl AuthToken {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.exp
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }
}

/// Body of the token exchange route
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TokenResponse {
    pub fn issued(token: AuthToken) -> Self {
        Self {
            token: Some(token.token),
            exp: Some(token.exp),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Body of the certificate fetch route
///
/// Application failures travel in `error` with HTTP 200 so the wire contract
/// stays uniform. `cr` and `error` may both be set when a renewal failed but
/// the previous resource is still served.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cr: Option<CertificateResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error code, e.g. [`crate::AUTH_FAILED_CODE`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl CertResponse {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn auth_failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            code: Some(crate::AUTH_FAILED_CODE.to_string()),
            ..Default::default()
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        self.code.as_deref() == Some(crate::AUTH_FAILED_CODE)
    }
}

/// Free-form message, used for the usage text on unknown routes
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimpleMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry_boundary() {
        let token = AuthToken {
            token: "t".to_string(),
            exp: 100,
        };
        assert!(!token.is_expired_at(99));
        assert!(token.is_expired_at(100));
        assert!(token.is_expired_at(101));
    }

    #[test]
    fn test_token_response_shapes() {
        let ok = TokenResponse::issued(AuthToken {
            token: "abc".to_string(),
            exp: 42,
        });
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"token":"abc","exp":42}"#
        );

        let failed = TokenResponse::failed("nope");
        assert_eq!(
            serde_json::to_string(&failed).unwrap(),
            r#"{"error":"nope"}"#
        );
    }

    #[test]
    fn test_challenge_response_camel_case() {
        let response = ChallengeResponse {
            nonce: "n".to_string(),
            client_nonce: "c".to_string(),
            hash: "h".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["clientNonce"], "c");
    }

    #[test]
    fn test_cert_response_auth_failure_code() {
        let response = CertResponse::auth_failed("Token expired");
        assert!(response.is_auth_failure());

        let json = serde_json::to_string(&response).unwrap();
        let parsed: CertResponse = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_auth_failure());
        assert!(!CertResponse::failed("domain not found").is_auth_failure());
    }
}
