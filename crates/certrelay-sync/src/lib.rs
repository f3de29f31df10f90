//! Client-side certificate reconciliation
//!
//! Keeps certificate files on a host in step with what the relay serves.

pub mod artifact;
pub mod command;
pub mod config;
pub mod engine;
pub mod keystore;
pub mod profile;

pub use artifact::{ArtifactError, ArtifactKind};
pub use command::{CommandError, CommandOutput, CommandRunner, SystemCommandRunner};
pub use config::{ConfigError, DomainTarget, HookCommand, KeystoreTarget, SyncConfig};
pub use engine::{
    CertificateSource, DomainFailure, DomainOutcome, ReconcileErrors, ReconciliationEngine,
    RunReport, SyncError,
};
pub use profile::{FsHostProbe, HostProbe, HostProfile};
