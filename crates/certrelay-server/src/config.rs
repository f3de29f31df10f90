//! Server configuration

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use certrelay_cert::{AcmeConfig, RenewalPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Server secret is required")]
    MissingSecret,

    #[error("Primary domain name is required")]
    MissingPrimaryDomain,

    #[error("Contact email is required")]
    MissingEmail,

    #[error("Domain at index {0} has no name")]
    MissingDomainName(usize),

    #[error("Domain {0} is configured more than once")]
    DuplicateDomain(String),

    #[error("Check interval must be at least one second")]
    ZeroCheckInterval,
}

/// A certificate's primary name and its alternative names
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl DomainConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("letsencrypt")
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 443))
}

fn default_http_challenge_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

fn default_renew_before_days() -> i64 {
    30
}

fn default_check_interval_seconds() -> u64 {
    2 * 24 * 60 * 60
}

/// Certificate server configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Served by the shared TLS listener; must load before the listener starts
    pub primary_domain: DomainConfig,

    /// Additional domains handed out to clients
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<DomainConfig>,

    /// ACME account contact
    pub email: String,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Shared secret for the challenge-response handshake
    pub secret: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    #[serde(default = "default_http_challenge_addr")]
    pub http_challenge_addr: SocketAddr,

    /// Custom ACME directory, overrides `staging`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_url: Option<String>,

    #[serde(default)]
    pub staging: bool,

    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,

    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: i64,

    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("primary_domain", &self.primary_domain)
            .field("domains", &self.domains)
            .field("email", &self.email)
            .field("cache_dir", &self.cache_dir)
            .field("secret", &"[REDACTED]")
            .field("listen_addr", &self.listen_addr)
            .field("http_challenge_addr", &self.http_challenge_addr)
            .field("directory_url", &self.directory_url)
            .field("staging", &self.staging)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            primary_domain: DomainConfig::default(),
            domains: Vec::new(),
            email: String::new(),
            cache_dir: default_cache_dir(),
            secret: String::new(),
            listen_addr: default_listen_addr(),
            http_challenge_addr: default_http_challenge_addr(),
            directory_url: None,
            staging: false,
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            renew_before_days: default_renew_before_days(),
            check_interval_seconds: default_check_interval_seconds(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if self.primary_domain.name.is_empty() {
            return Err(ConfigError::MissingPrimaryDomain);
        }
        if self.email.is_empty() {
            return Err(ConfigError::MissingEmail);
        }
        if self.check_interval_seconds == 0 {
            return Err(ConfigError::ZeroCheckInterval);
        }

        let mut seen = HashSet::new();
        seen.insert(self.primary_domain.name.as_str());
        for (index, domain) in self.domains.iter().enumerate() {
            if domain.name.is_empty() {
                return Err(ConfigError::MissingDomainName(index));
            }
            if !seen.insert(domain.name.as_str()) {
                return Err(ConfigError::DuplicateDomain(domain.name.clone()));
            }
        }

        Ok(())
    }

    /// Primary domain first, then the additional domains
    pub fn all_domains(&self) -> impl Iterator<Item = &DomainConfig> {
        std::iter::once(&self.primary_domain).chain(self.domains.iter())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn renewal_policy(&self) -> RenewalPolicy {
        RenewalPolicy {
            check_interval: Duration::from_secs(self.check_interval_seconds),
            renew_before: chrono::Duration::days(self.renew_before_days),
        }
    }

    pub fn acme_config(&self) -> AcmeConfig {
        let mut acme = AcmeConfig::new(&self.email, &self.cache_dir);
        if self.staging {
            acme = acme.staging();
        }
        if let Some(url) = &self.directory_url {
            acme.directory_url = url.clone();
        }
        acme.http_challenge_addr = self.http_challenge_addr;
        acme
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ServerConfig {
        ServerConfig {
            primary_domain: DomainConfig::new("relay.example.com"),
            domains: vec![DomainConfig::new("nas.example.com")],
            email: "admin@example.com".to_string(),
            secret: "s3cret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert_eq!(valid().validate(), Ok(()));
    }

    #[test]
    fn test_required_fields() {
        let mut config = valid();
        config.secret.clear();
        assert_eq!(config.validate(), Err(ConfigError::MissingSecret));

        let mut config = valid();
        config.primary_domain.name.clear();
        assert_eq!(config.validate(), Err(ConfigError::MissingPrimaryDomain));

        let mut config = valid();
        config.email.clear();
        assert_eq!(config.validate(), Err(ConfigError::MissingEmail));

        let mut config = valid();
        config.domains.push(DomainConfig::default());
        assert_eq!(config.validate(), Err(ConfigError::MissingDomainName(1)));
    }

    #[test]
    fn test_zero_check_interval_rejected() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "primaryDomain": {"name": "relay.example.com"},
                "email": "admin@example.com",
                "secret": "s3cret",
                "checkIntervalSeconds": 0
            }"#,
        )
        .unwrap();

        assert_eq!(config.validate(), Err(ConfigError::ZeroCheckInterval));
    }

    #[test]
    fn test_all_domains_primary_first() {
        let names: Vec<_> = valid().all_domains().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["relay.example.com", "nas.example.com"]);
    }

    #[test]
    fn test_duplicate_domains() {
        let mut config = valid();
        config.domains.push(DomainConfig::new("relay.example.com"));
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateDomain("relay.example.com".to_string()))
        );
    }

    #[test]
    fn test_defaults_from_json() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "primaryDomain": {"name": "relay.example.com", "aliases": ["www.relay.example.com"]},
                "email": "admin@example.com",
                "secret": "s3cret"
            }"#,
        )
        .unwrap();

        assert_eq!(config.cache_dir, PathBuf::from("letsencrypt"));
        assert_eq!(config.listen_addr.port(), 443);
        assert_eq!(config.http_challenge_addr.port(), 80);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(config.primary_domain.aliases, vec!["www.relay.example.com"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_acme_directory_selection() {
        let mut config = valid();
        config.staging = true;
        assert!(config.acme_config().directory_url.contains("staging"));

        config.directory_url = Some("https://localhost:14000/dir".to_string());
        assert_eq!(
            config.acme_config().directory_url,
            "https://localhost:14000/dir"
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        assert!(!format!("{:?}", valid()).contains("s3cret"));
    }
}
