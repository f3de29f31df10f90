//! Configuration file handling
//!
//! One file drives both roles: `server` runs the certificate relay and
//! `client` runs the reconciliation engine. Either or both may be present.

use anyhow::{bail, Context, Result};
use certrelay_server::{DomainConfig, ServerConfig};
use certrelay_sync::{DomainTarget, HookCommand, KeystoreTarget, SyncConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "CERTRELAY_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "/etc/certrelay.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// trace, debug, info, warn or error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<SyncConfig>,
}

/// Output formats of `certrelay config`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExampleFormat {
    Json,
    Yaml,
    PrettyJson,
}

/// Config path from the flag, then the environment, then the default
pub fn resolve_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| {
        std::env::var(CONFIG_ENV_VAR)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
    .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load the configuration, refusing files others can read
pub fn load(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        bail!("Config file {} does not exist", path.display());
    }
    check_permissions(path)?;

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse(&content).with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// JSON first, then YAML
pub fn parse(content: &str) -> Result<AppConfig> {
    let json_err = match serde_json::from_str(content) {
        Ok(config) => return Ok(config),
        Err(e) => e,
    };
    serde_yaml::from_str(content)
        .with_context(|| format!("not valid JSON ({}) or YAML", json_err))
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)
        .with_context(|| format!("Failed to stat config file {}", path.display()))?
        .permissions()
        .mode();
    if mode & 0o077 != 0 {
        bail!(
            "Config file {} has overly permissive mode {:o}; expected 600",
            path.display(),
            mode & 0o777
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

pub fn example() -> AppConfig {
    AppConfig {
        notes: Some(
            "Remove the server or client section for a host that only plays one role".to_string(),
        ),
        log_level: Some("info".to_string()),
        server: Some(ServerConfig {
            primary_domain: DomainConfig::new("relay.example.com"),
            domains: vec![
                DomainConfig::new("nas.example.com"),
                DomainConfig {
                    name: "www.example.com".to_string(),
                    aliases: vec!["example.com".to_string()],
                },
            ],
            email: "admin@example.com".to_string(),
            secret: "change-me".to_string(),
            ..Default::default()
        }),
        client: Some(SyncConfig {
            secret: "change-me".to_string(),
            server: "https://relay.example.com".to_string(),
            refresh_interval_seconds: Some(24 * 60 * 60),
            daemon: true,
            domains: vec![DomainTarget {
                cert_file: Some(PathBuf::from("/etc/ssl/www.example.com/cert.pem")),
                key_file: Some(PathBuf::from("/etc/ssl/www.example.com/key.pem")),
                full_chain_file: Some(PathBuf::from("/etc/ssl/www.example.com/fullchain.pem")),
                keystore: Some(KeystoreTarget {
                    file: PathBuf::from("/etc/ssl/www.example.com/keystore.p12"),
                    passphrase: "change-me".to_string(),
                }),
                hook: Some(HookCommand::new("systemctl", &["reload", "nginx.service"])),
                ..DomainTarget::new("www.example.com")
            }],
            ..Default::default()
        }),
    }
}

pub fn render_example(format: ExampleFormat) -> Result<String> {
    let config = example();
    let rendered = match format {
        ExampleFormat::Json => serde_json::to_string(&config)?,
        ExampleFormat::PrettyJson => serde_json::to_string_pretty(&config)?,
        ExampleFormat::Yaml => serde_yaml::to_string(&config)?,
    };
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_private(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        }
        path
    }

    #[test]
    fn test_examples_parse_back() {
        for format in [ExampleFormat::Json, ExampleFormat::Yaml, ExampleFormat::PrettyJson] {
            let parsed = parse(&render_example(format).unwrap()).unwrap();
            let server = parsed.server.unwrap();
            assert_eq!(server.primary_domain.name, "relay.example.com");
            assert!(server.validate().is_ok());
            assert_eq!(parsed.client.unwrap().domains[0].name, "www.example.com");
        }
    }

    #[test]
    fn test_load_yaml_client_only() {
        let dir = TempDir::new().unwrap();
        let path = write_private(
            &dir,
            "certrelay.yaml",
            "logLevel: debug\nclient:\n  secret: s\n  server: https://relay.test\n  domains:\n    - name: a.test\n      certFile: /tmp/a.pem\n",
        );

        let config = load(&path).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert!(config.server.is_none());
        assert_eq!(config.client.unwrap().server, "https://relay.test");
    }

    #[test]
    fn test_missing_file() {
        let err = load(Path::new("/nonexistent/certrelay.yaml")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse("client: [unterminated").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = write_private(&dir, "certrelay.json", "{}");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("overly permissive"));
    }

    #[test]
    fn test_path_resolution_prefers_flag() {
        assert_eq!(
            resolve_path(Some(PathBuf::from("/tmp/x.yaml"))),
            PathBuf::from("/tmp/x.yaml")
        );
    }
}
