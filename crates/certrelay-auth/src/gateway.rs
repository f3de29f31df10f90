//! Challenge-response gateway
//!
//! A client proves knowledge of the shared secret by answering a one-time
//! nonce; a correct answer is exchanged for a short-lived bearer token.

use std::collections::HashMap;
use std::sync::Mutex;

use certrelay_proto::{AuthChallenge, AuthToken, ChallengeResponse};
use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::debug;

use crate::hash::{generate_nonce, verify_response_hash};
use crate::token::TokenSigner;

/// Authentication errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Unknown or already used challenge")]
    UnknownChallenge,

    #[error("Challenge expired")]
    ChallengeExpired,

    #[error("Missing client nonce")]
    MissingClientNonce,

    #[error("Challenge response hash mismatch")]
    HashMismatch,

    #[error("Malformed token")]
    MalformedToken,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token expired")]
    TokenExpired,
}

/// Gateway configuration
#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub challenge_ttl: Duration,
    pub token_ttl: Duration,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"[REDACTED]")
            .field("challenge_ttl", &self.challenge_ttl)
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

impl AuthConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            challenge_ttl: Duration::seconds(60),
            token_ttl: Duration::minutes(10),
        }
    }
}

/// Issues challenges, exchanges answers for tokens and validates tokens
pub struct AuthGateway {
    config: AuthConfig,
    signer: TokenSigner,
    /// nonce -> expiry (unix seconds)
    pending: Mutex<HashMap<String, i64>>,
}

impl AuthGateway {
    pub fn new(config: AuthConfig) -> Self {
        let signer = TokenSigner::new(config.secret.as_bytes());
        Self {
            config,
            signer,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self::new(AuthConfig::new(secret))
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        // A poisoned map only ever holds nonces; keep serving
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a fresh single-use challenge
    pub fn issue_challenge(&self) -> AuthChallenge {
        self.issue_challenge_at(Utc::now().timestamp())
    }

    pub fn issue_challenge_at(&self, now: i64) -> AuthChallenge {
        let nonce = generate_nonce();
        let exp = now + self.config.challenge_ttl.num_seconds();

        let mut pending = self.pending();
        pending.retain(|_, expiry| *expiry > now);
        pending.insert(nonce.clone(), exp);
        debug!("Issued auth challenge ({} pending)", pending.len());

        AuthChallenge { nonce, exp }
    }

    /// Exchange a challenge answer for a bearer token
    pub fn exchange_for_token(&self, response: &ChallengeResponse) -> Result<AuthToken, AuthError> {
        self.exchange_for_token_at(response, Utc::now().timestamp())
    }

    pub fn exchange_for_token_at(
        &self,
        response: &ChallengeResponse,
        now: i64,
    ) -> Result<AuthToken, AuthError> {
        // The nonce is consumed whatever the outcome
        let exp = self
            .pending()
            .remove(&response.nonce)
            .ok_or(AuthError::UnknownChallenge)?;

        if now >= exp {
            return Err(AuthError::ChallengeExpired);
        }
        if response.client_nonce.is_empty() {
            return Err(AuthError::MissingClientNonce);
        }
        if !verify_response_hash(
            &self.config.secret,
            &response.nonce,
            &response.client_nonce,
            &response.hash,
        ) {
            return Err(AuthError::HashMismatch);
        }

        let exp = now + self.config.token_ttl.num_seconds();
        debug!("Issued bearer token expiring at {}", exp);

        Ok(AuthToken {
            token: self.signer.mint(exp),
            exp,
        })
    }

    /// Check a bearer token
    pub fn validate_token(&self, token: &str) -> Result<(), AuthError> {
        self.validate_token_at(token, Utc::now().timestamp())
    }

    pub fn validate_token_at(&self, token: &str, now: i64) -> Result<(), AuthError> {
        self.signer.verify(token, now).map(|_| ())
    }

    /// Number of outstanding challenges
    pub fn pending_challenges(&self) -> usize {
        self.pending().len()
    }

    /// Drop every outstanding challenge
    pub fn shutdown(&self) {
        let mut pending = self.pending();
        debug!("Dropping {} pending auth challenges", pending.len());
        pending.clear();
    }
}
