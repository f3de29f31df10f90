//! Change-detected installation of certificate material

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::command::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Key,
    Cert,
    FullChain,
    Keystore,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Key => write!(f, "key"),
            ArtifactKind::Cert => write!(f, "cert"),
            ArtifactKind::FullChain => write!(f, "full chain"),
            ArtifactKind::Keystore => write!(f, "keystore"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Failed to write {kind} file {}: {source}", path.display())]
    Write {
        kind: ArtifactKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build keystore {}: {source}", path.display())]
    Keystore {
        path: PathBuf,
        #[source]
        source: CommandError,
    },
}

impl ArtifactError {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactError::Write { kind, .. } => *kind,
            ArtifactError::Keystore { .. } => ArtifactKind::Keystore,
        }
    }
}

/// Whether `path` already holds exactly `data`
///
/// A missing or unreadable file counts as different.
pub async fn matches_disk(path: &Path, data: &[u8]) -> bool {
    match fs::read(path).await {
        Ok(existing) => existing == data,
        Err(e) => {
            debug!("Cannot read {}: {}", path.display(), e);
            false
        }
    }
}

/// Write `data` to `path` unless it is already there
///
/// Returns whether the file was written.
pub async fn sync_artifact(
    kind: ArtifactKind,
    path: &Path,
    data: &[u8],
) -> Result<bool, ArtifactError> {
    if matches_disk(path, data).await {
        debug!("{} file {} unchanged", kind, path.display());
        return Ok(false);
    }

    write_atomic(path, data)
        .await
        .map_err(|source| ArtifactError::Write {
            kind,
            path: path.to_path_buf(),
            source,
        })?;
    debug!("{} file {} written", kind, path.display());
    Ok(true)
}

/// Temp file created owner-only, then renamed over `path`
async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

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
