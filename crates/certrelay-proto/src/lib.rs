//! Certificate relay wire protocol
//!
//! Types exchanged between the certificate server and its remote clients.
//! Everything here is plain serde data; behavior lives in the server and
//! client crates.

pub mod messages;
pub mod resource;

pub use messages::*;
pub use resource::CertificateResource;

/// Route issuing a fresh authentication challenge
pub const AUTH_REQUEST_PATH: &str = "/getauthrequest";

/// Route exchanging a challenge response for a bearer token
pub const AUTH_TOKEN_PATH: &str = "/getauthtoken";

/// Route returning a domain's certificate resource
pub const CERT_PATH: &str = "/getcert";

/// Query parameter naming the requested domain on [`CERT_PATH`]
pub const DOMAIN_QUERY_PARAM: &str = "domain";

/// Prefix of the `Authorization` header value carrying a token
pub const BEARER_PREFIX: &str = "Bearer ";

/// Error code set on a [`CertResponse`] when the bearer token was rejected
pub const AUTH_FAILED_CODE: &str = "AUTH_FAILED";
