//! Host profiles
//!
//! Appliances such as Synology DSM and Unifi consoles keep their web
//! certificate in fixed locations and need a service restart to pick up a
//! new one. A matching profile replaces whatever output paths and hook the
//! user configured for the single domain it allows.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ConfigError, DomainTarget, HookCommand, SyncConfig};

pub const SYNOLOGY_MARKER: &str = "/proc/syno_platform";
pub const SYNOLOGY_ARCHIVE_DIR: &str = "/usr/syno/etc/certificate/_archive";
pub const SYNOLOGY_DEFAULT_FILE: &str = "/usr/syno/etc/certificate/_archive/DEFAULT";
pub const UNIFI_MARKER: &str = "/sys/fs/cgroup/system.slice/unifi.service/cgroup.type";
pub const UNIFI_CERT_FILE: &str = "/data/unifi-core/config/unifi-core.crt";
pub const UNIFI_KEY_FILE: &str = "/data/unifi-core/config/unifi-core.key";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostProfile {
    #[default]
    Generic,
    Synology,
    Unifi,
}

impl fmt::Display for HostProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostProfile::Generic => write!(f, "generic"),
            HostProfile::Synology => write!(f, "synology"),
            HostProfile::Unifi => write!(f, "unifi"),
        }
    }
}

/// Inspects the host the engine runs on
pub trait HostProbe: Send + Sync {
    /// Profile implied by the host, `Generic` when nothing matches
    fn detect(&self) -> HostProfile;

    /// Name of the certificate directory DSM currently serves
    fn synology_default_archive(&self) -> std::io::Result<String>;
}

/// Probe reading marker files, optionally under a different root
#[derive(Debug, Clone)]
pub struct FsHostProbe {
    root: PathBuf,
}

impl Default for FsHostProbe {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }
}

impl FsHostProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, absolute: &str) -> PathBuf {
        self.root.join(absolute.trim_start_matches('/'))
    }
}

impl HostProbe for FsHostProbe {
    fn detect(&self) -> HostProfile {
        if self.resolve(SYNOLOGY_MARKER).exists() {
            HostProfile::Synology
        } else if self.resolve(UNIFI_MARKER).exists() {
            HostProfile::Unifi
        } else {
            HostProfile::Generic
        }
    }

    fn synology_default_archive(&self) -> std::io::Result<String> {
        let raw = std::fs::read_to_string(self.resolve(SYNOLOGY_DEFAULT_FILE))?;
        Ok(raw.trim().to_string())
    }
}

/// Decide which profile applies
pub fn resolve_profile(config: &SyncConfig, probe: &dyn HostProbe) -> HostProfile {
    if config.ignore_host_profile {
        debug!("Host profile detection disabled");
        return HostProfile::Generic;
    }
    if let Some(profile) = config.host_profile {
        debug!("Host profile {} set in configuration", profile);
        return profile;
    }
    let profile = probe.detect();
    debug!("Detected host profile {}", profile);
    profile
}

/// Resolve the final targets for `profile` and validate them
pub fn apply_profile(
    domains: &[DomainTarget],
    profile: HostProfile,
    probe: &dyn HostProbe,
) -> Result<Vec<DomainTarget>, ConfigError> {
    let target = match profile {
        HostProfile::Generic => {
            if domains.is_empty() {
                return Err(ConfigError::NoDomains);
            }
            for (index, domain) in domains.iter().enumerate() {
                domain.validate(index)?;
            }
            return Ok(domains.to_vec());
        }
        HostProfile::Synology => {
            let name = single_domain(domains, profile)?;
            let archive = probe.synology_default_archive().map_err(|e| {
                ConfigError::HostProfile(format!(
                    "cannot read {}: {}",
                    SYNOLOGY_DEFAULT_FILE, e
                ))
            })?;
            if archive.is_empty() {
                return Err(ConfigError::HostProfile(format!(
                    "{} is empty",
                    SYNOLOGY_DEFAULT_FILE
                )));
            }
            let dir = Path::new(SYNOLOGY_ARCHIVE_DIR).join(archive);
            DomainTarget {
                name,
                cert_file: Some(dir.join("cert.pem")),
                key_file: Some(dir.join("privkey.pem")),
                full_chain_file: Some(dir.join("fullchain.pem")),
                keystore: None,
                hook: Some(HookCommand::new("systemctl", &["restart", "nginx.service"])),
            }
        }
        HostProfile::Unifi => DomainTarget {
            name: single_domain(domains, profile)?,
            cert_file: None,
            key_file: Some(PathBuf::from(UNIFI_KEY_FILE)),
            full_chain_file: Some(PathBuf::from(UNIFI_CERT_FILE)),
            keystore: None,
            hook: Some(HookCommand::new(
                "systemctl",
                &["restart", "unifi-core.service"],
            )),
        },
    };

    Ok(vec![target])
}

/// Name of the only configured domain; its other fields are dropped
fn single_domain(domains: &[DomainTarget], profile: HostProfile) -> Result<String, ConfigError> {
    let [domain] = domains else {
        return Err(ConfigError::ProfileDomainCount {
            profile,
            count: domains.len(),
        });
    };
    if domain.name.is_empty() {
        return Err(ConfigError::MissingDomainName(0));
    }
    log_discarded(domain, profile);
    Ok(domain.name.clone())
}

fn log_discarded(domain: &DomainTarget, profile: HostProfile) {
    let fields = [
        ("certFile", domain.cert_file.is_some()),
        ("keyFile", domain.key_file.is_some()),
        ("fullChainFile", domain.full_chain_file.is_some()),
        ("keystore", domain.keystore.is_some()),
        ("hook", domain.hook.is_some()),
    ];
    for (field, set) in fields {
        if set {
            debug!(
                "Domain {} has {} set; ignored under the {} profile",
                domain.name, field, profile
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_detect_from_markers() {
        let dir = TempDir::new().unwrap();
        let probe = FsHostProbe::with_root(dir.path());
        assert_eq!(probe.detect(), HostProfile::Generic);

        let unifi = dir.path().join(UNIFI_MARKER.trim_start_matches('/'));
        std::fs::create_dir_all(unifi.parent().unwrap()).unwrap();
        std::fs::write(&unifi, "domain").unwrap();
        assert_eq!(probe.detect(), HostProfile::Unifi);

        let syno = dir.path().join(SYNOLOGY_MARKER.trim_start_matches('/'));
        std::fs::create_dir_all(syno.parent().unwrap()).unwrap();
        std::fs::write(&syno, "").unwrap();
        assert_eq!(probe.detect(), HostProfile::Synology);
    }

    #[test]
    fn test_synology_default_archive_trimmed() {
        let dir = TempDir::new().unwrap();
        let default = dir.path().join(SYNOLOGY_DEFAULT_FILE.trim_start_matches('/'));
        std::fs::create_dir_all(default.parent().unwrap()).unwrap();
        std::fs::write(&default, "AbCdEf\n").unwrap();

        let probe = FsHostProbe::with_root(dir.path());
        assert_eq!(probe.synology_default_archive().unwrap(), "AbCdEf");
    }

    #[test]
    fn test_profile_resolution_order() {
        struct Unifi;
        impl HostProbe for Unifi {
            fn detect(&self) -> HostProfile {
                HostProfile::Unifi
            }
            fn synology_default_archive(&self) -> std::io::Result<String> {
                Ok(String::new())
            }
        }

        let mut config = SyncConfig::default();
        assert_eq!(resolve_profile(&config, &Unifi), HostProfile::Unifi);

        config.host_profile = Some(HostProfile::Synology);
        assert_eq!(resolve_profile(&config, &Unifi), HostProfile::Synology);

        config.ignore_host_profile = true;
        assert_eq!(resolve_profile(&config, &Unifi), HostProfile::Generic);
    }

    #[test]
    fn test_profile_requires_single_domain() {
        let probe = FsHostProbe::with_root("/nonexistent");
        let domains = vec![DomainTarget::new("a.test"), DomainTarget::new("b.test")];

        assert_eq!(
            apply_profile(&domains, HostProfile::Unifi, &probe),
            Err(ConfigError::ProfileDomainCount {
                profile: HostProfile::Unifi,
                count: 2
            })
        );
        assert!(matches!(
            apply_profile(&[], HostProfile::Synology, &probe),
            Err(ConfigError::ProfileDomainCount { count: 0, .. })
        ));
    }

    #[test]
    fn test_unifi_targets() {
        let probe = FsHostProbe::with_root("/nonexistent");
        let targets = apply_profile(
            &[DomainTarget::new("unifi.example.com")],
            HostProfile::Unifi,
            &probe,
        )
        .unwrap();

        assert_eq!(
            targets[0].full_chain_file,
            Some(PathBuf::from(UNIFI_CERT_FILE))
        );
        assert_eq!(targets[0].key_file, Some(PathBuf::from(UNIFI_KEY_FILE)));
        assert_eq!(
            targets[0].hook.as_ref().unwrap().display(),
            "systemctl restart unifi-core.service"
        );
    }

    #[test]
    fn test_synology_missing_default_file() {
        let probe = FsHostProbe::with_root("/nonexistent");
        assert!(matches!(
            apply_profile(
                &[DomainTarget::new("nas.example.com")],
                HostProfile::Synology,
                &probe
            ),
            Err(ConfigError::HostProfile(_))
        ));
    }

    #[test]
    fn test_generic_validates_every_domain() {
        let probe = FsHostProbe::with_root("/nonexistent");
        assert_eq!(
            apply_profile(&[], HostProfile::Generic, &probe),
            Err(ConfigError::NoDomains)
        );
        assert_eq!(
            apply_profile(&[DomainTarget::new("a.test")], HostProfile::Generic, &probe),
            Err(ConfigError::NoOutputs("a.test".to_string()))
        );
    }

    #[test]
    fn test_profile_serde_names() {
        let profile: HostProfile = serde_json::from_str("\"synology\"").unwrap();
        assert_eq!(profile, HostProfile::Synology);
        assert_eq!(serde_json::to_string(&HostProfile::Unifi).unwrap(), "\"unifi\"");
    }
}
