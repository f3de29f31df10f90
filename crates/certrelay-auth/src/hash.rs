//! Response hash and nonce primitives shared by server and client

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// Generate a random 32-byte nonce, hex encoded
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn response_mac(secret: &str, nonce: &str, client_nonce: &str) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(nonce.as_bytes());
    mac.update(b":");
    mac.update(client_nonce.as_bytes());
    mac
}

/// Compute the answer to a challenge
///
/// `hex(HMAC-SHA256(secret, nonce ":" client_nonce))`
pub fn compute_response_hash(secret: &str, nonce: &str, client_nonce: &str) -> String {
    hex::encode(response_mac(secret, nonce, client_nonce).finalize().into_bytes())
}

/// Constant-time check of a submitted answer
pub(crate) fn verify_response_hash(
    secret: &str,
    nonce: &str,
    client_nonce: &str,
    submitted: &str,
) -> bool {
    let Ok(submitted) = hex::decode(submitted) else {
        return false;
    };
    response_mac(secret, nonce, client_nonce)
        .verify_slice(&submitted)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_is_random_hex() {
        let a = generate_nonce();
        let b = generate_nonce();

        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let first = compute_response_hash("secret", "server", "client");
        let second = compute_response_hash("secret", "server", "client");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_hash_depends_on_every_input() {
        let base = compute_response_hash("secret", "server", "client");
        assert_ne!(base, compute_response_hash("other", "server", "client"));
        assert_ne!(base, compute_response_hash("secret", "server2", "client"));
        assert_ne!(base, compute_response_hash("secret", "server", "client2"));
    }

    #[test]
    fn test_field_boundary_is_unambiguous() {
        assert_ne!(
            compute_response_hash("secret", "ab", "c"),
            compute_response_hash("secret", "a", "bc")
        );
    }

    #[test]
    fn test_verify() {
        let hash = compute_response_hash("secret", "n", "c");
        assert!(verify_response_hash("secret", "n", "c", &hash));
        assert!(!verify_response_hash("wrong", "n", "c", &hash));
        assert!(!verify_response_hash("secret", "n", "c", "not-hex"));
    }
}
