//! Client-side configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profile::HostProfile;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Secret is required")]
    MissingSecret,

    #[error("Server is required")]
    MissingServer,

    #[error("At least one domain is required")]
    NoDomains,

    #[error("Domain at index {0} has no name")]
    MissingDomainName(usize),

    #[error("Domain {0} must have at least one of certFile, fullChainFile or keystore")]
    NoOutputs(String),

    #[error("Domain {0} keystore needs both file and passphrase")]
    IncompleteKeystore(String),

    #[error("The {profile} host profile requires exactly one domain, found {count}")]
    ProfileDomainCount { profile: HostProfile, count: usize },

    #[error("Host profile error: {0}")]
    HostProfile(String),
}

/// PKCS12 keystore output
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreTarget {
    pub file: PathBuf,
    pub passphrase: String,
}

impl std::fmt::Debug for KeystoreTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreTarget")
            .field("file", &self.file)
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

/// Command run after a domain's files changed
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HookCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl HookCommand {
    pub fn new(name: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Command line for logs
    pub fn display(&self) -> String {
        std::iter::once(self.name.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Where one domain's material is installed
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DomainTarget {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_chain_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore: Option<KeystoreTarget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookCommand>,
}

impl DomainTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self, index: usize) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingDomainName(index));
        }
        if self.cert_file.is_none() && self.full_chain_file.is_none() && self.keystore.is_none() {
            return Err(ConfigError::NoOutputs(self.name.clone()));
        }
        if let Some(keystore) = &self.keystore {
            if keystore.file.as_os_str().is_empty() || keystore.passphrase.is_empty() {
                return Err(ConfigError::IncompleteKeystore(self.name.clone()));
            }
        }
        Ok(())
    }
}

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Reconciliation engine configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub secret: String,

    /// Relay server base URL
    pub server: String,

    #[serde(default)]
    pub skip_verify: bool,

    #[serde(default)]
    pub domains: Vec<DomainTarget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval_seconds: Option<u64>,

    /// Keep running and refresh on an interval
    #[serde(default)]
    pub daemon: bool,

    /// Always use the generic profile
    #[serde(default)]
    pub ignore_host_profile: bool,

    /// Skip detection and use this profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_profile: Option<HostProfile>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_seconds: Option<u64>,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("secret", &"[REDACTED]")
            .field("server", &self.server)
            .field("skip_verify", &self.skip_verify)
            .field("domains", &self.domains)
            .field("refresh_interval_seconds", &self.refresh_interval_seconds)
            .field("daemon", &self.daemon)
            .field("ignore_host_profile", &self.ignore_host_profile)
            .field("host_profile", &self.host_profile)
            .finish()
    }
}

impl SyncConfig {
    /// Refresh interval, falling back to the daily default
    pub fn refresh_interval(&self) -> Duration {
        match self.refresh_interval_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_REFRESH_INTERVAL,
        }
    }

    pub(crate) fn validate_connection(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if self.server.is_empty() {
            return Err(ConfigError::MissingServer);
        }
        Ok(())
    }
}
