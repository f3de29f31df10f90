//! Certificate relay server
//!
//! Keeps certificates for a set of domains current through
//! [`certrelay_cert::DomainSupervisor`]s and hands them to authenticated
//! clients over a shared HTTPS listener secured with the primary domain's
//! certificate.

pub mod config;
pub mod listener;
pub mod routes;
pub mod server;

pub use config::{ConfigError, DomainConfig, ServerConfig};
pub use listener::{ListenerConfig, ListenerController, ListenerError, ListenerStatus};
pub use routes::{build_router, AppState};
pub use server::{CertificateServer, ServerError};
