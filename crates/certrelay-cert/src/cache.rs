//! On-disk certificate cache
//!
//! Layout per domain:
//!
//! ```text
//! <root>/<domain>/CertResource.json
//! <root>/<domain>/cert.pem     (full chain)
//! <root>/<domain>/key.pem
//! ```
//!
//! The JSON resource is authoritative; the PEM files are written alongside it
//! for the TLS listener.

use std::path::{Path, PathBuf};

use certrelay_proto::CertificateResource;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const RESOURCE_FILE: &str = "CertResource.json";
pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt cached resource {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid domain for cache path: {0}")]
    InvalidDomain(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Certificate cache rooted at a directory
#[derive(Debug, Clone)]
pub struct CertCache {
    root: PathBuf,
}

impl CertCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn domain_dir(&self, domain: &str) -> Result<PathBuf, CacheError> {
        if domain.is_empty()
            || domain.contains('/')
            || domain.contains('\\')
            || domain.starts_with('.')
        {
            return Err(CacheError::InvalidDomain(domain.to_string()));
        }
        Ok(self.root.join(domain))
    }

    pub fn resource_path(&self, domain: &str) -> Result<PathBuf, CacheError> {
        Ok(self.domain_dir(domain)?.join(RESOURCE_FILE))
    }

    pub fn cert_path(&self, domain: &str) -> Result<PathBuf, CacheError> {
        Ok(self.domain_dir(domain)?.join(CERT_FILE))
    }

    pub fn key_path(&self, domain: &str) -> Result<PathBuf, CacheError> {
        Ok(self.domain_dir(domain)?.join(KEY_FILE))
    }

    /// Load a domain's cached resource, `None` when nothing is cached
    pub async fn load(&self, domain: &str) -> Result<Option<CertificateResource>, CacheError> {
        let path = self.resource_path(domain)?;

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No cached certificate for {}", domain);
                return Ok(None);
            }
            Err(e) => return Err(io_err(&path)(e)),
        };

        let resource = serde_json::from_slice(&data).map_err(|source| CacheError::Corrupt {
            path: path.clone(),
            source,
        })?;

        debug!("Loaded cached certificate for {} from {}", domain, path.display());
        Ok(Some(resource))
    }

    /// Persist a resource and its PEM files
    pub async fn store(&self, resource: &CertificateResource) -> Result<(), CacheError> {
        let dir = self.domain_dir(&resource.domain)?;
        create_private_dir(&self.root).await?;
        create_private_dir(&dir).await?;

        let json = serde_json::to_vec_pretty(resource).map_err(|source| CacheError::Corrupt {
            path: dir.join(RESOURCE_FILE),
            source,
        })?;

        write_private(&dir.join(RESOURCE_FILE), &json).await?;
        write_private(&dir.join(CERT_FILE), &resource.full_chain_pem()).await?;
        write_private(&dir.join(KEY_FILE), resource.key_pem()).await?;

        debug!("Stored certificate for {} in {}", resource.domain, dir.display());
        Ok(())
    }
}

async fn create_private_dir(dir: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(dir).await.map_err(io_err(dir))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(io_err(dir))?;
    }

    Ok(())
}

async fn write_private(path: &Path, data: &[u8]) -> Result<(), CacheError> {
    write_private_file(path, data).await.map_err(io_err(path))
}

/// Write through a temp file and rename so readers never see partial data
///
/// The temp file is created with mode 0600, so the data is never readable by
/// others, not even before the rename.
pub async fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    // A leftover from a crash may carry looser permissions
    match fs::remove_file(&tmp).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await
}
