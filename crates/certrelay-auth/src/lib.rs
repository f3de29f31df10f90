//! Challenge-response authentication for certificate retrieval
//!
//! A client proves knowledge of the shared secret by hashing a server nonce
//! together with a nonce of its own. A correct answer is exchanged for a
//! short-lived bearer token that gates certificate fetches.

pub mod gateway;
pub mod hash;
pub mod token;

pub use gateway::{AuthConfig, AuthError, AuthGateway};
pub use hash::{compute_response_hash, generate_nonce};
pub use token::TokenSigner;
