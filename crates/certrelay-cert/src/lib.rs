//! Certificate acquisition, caching and renewal
//!
//! [`DomainSupervisor`] owns one domain's certificate lifecycle on top of a
//! [`CertificateIssuer`] and the on-disk [`CertCache`]. [`AcmeIssuer`] is the
//! production issuer.

pub mod acme;
pub mod cache;
pub mod expiry;
pub mod issuer;
pub mod supervisor;

pub use acme::{AcmeConfig, AcmeIssuer};
pub use cache::{CacheError, CertCache};
pub use expiry::{is_expired, leaf_not_after, needs_renewal};
pub use issuer::{CertificateIssuer, IssueRequest, IssuerError};
pub use supervisor::{
    DomainPhase, DomainSnapshot, DomainSupervisor, RenewalError, RenewalEvent, RenewalEventKind,
    RenewalPolicy,
};
