//! Self-validating bearer tokens
//!
//! Format: `<exp>.<id>.<mac>` where `id` is 16 random bytes and `mac` is
//! `HMAC-SHA256(secret, "certrelay-token:" exp "." id)`, both hex encoded.
//! The server keeps no per-token state.

use hmac::Mac;
use rand::RngCore;

use crate::gateway::AuthError;
use crate::hash::HmacSha256;

const TOKEN_CONTEXT: &[u8] = b"certrelay-token:";

/// Mints and verifies bearer tokens under one shared secret
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    fn mac(&self, exp: &str, id: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(TOKEN_CONTEXT);
        mac.update(exp.as_bytes());
        mac.update(b".");
        mac.update(id.as_bytes());
        mac
    }

    /// Mint a token expiring at `exp` (unix seconds)
    pub fn mint(&self, exp: i64) -> String {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);

        let exp = exp.to_string();
        let id = hex::encode(id);
        let mac = hex::encode(self.mac(&exp, &id).finalize().into_bytes());

        format!("{}.{}.{}", exp, id, mac)
    }

    /// Verify a token at time `now`, returning its expiry
    pub fn verify(&self, token: &str, now: i64) -> Result<i64, AuthError> {
        let mut parts = token.split('.');
        let (Some(exp_part), Some(id), Some(mac_hex), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::MalformedToken);
        };

        let exp: i64 = exp_part.parse().map_err(|_| AuthError::MalformedToken)?;
        let mac = hex::decode(mac_hex).map_err(|_| AuthError::MalformedToken)?;

        self.mac(exp_part, id)
            .verify_slice(&mac)
            .map_err(|_| AuthError::InvalidSignature)?;

        if now >= exp {
            return Err(AuthError::TokenExpired);
        }

        Ok(exp)
    }
}
