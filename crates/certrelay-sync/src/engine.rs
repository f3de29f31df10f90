//! Reconciliation engine
//!
//! Pulls each configured domain from the relay, installs whatever material
//! differs from what is on disk and runs the domain's hook when something
//! changed. Domains are processed one after another and fail independently.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certrelay_client::{ClientConfig, ClientError, RemoteCertClient};
use certrelay_proto::CertificateResource;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::artifact::{sync_artifact, ArtifactError, ArtifactKind};
use crate::command::{CommandError, CommandRunner, SystemCommandRunner};
use crate::config::{ConfigError, DomainTarget, SyncConfig};
use crate::keystore::build_keystore;
use crate::profile::{apply_profile, resolve_profile, FsHostProbe, HostProbe, HostProfile};

/// Where certificate resources come from
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn fetch(&self, domain: &str) -> Result<CertificateResource, ClientError>;
}

#[async_trait]
impl CertificateSource for RemoteCertClient {
    async fn fetch(&self, domain: &str) -> Result<CertificateResource, ClientError> {
        self.fetch_certificate(domain).await
    }
}

/// Something that went wrong for a single domain
#[derive(Debug, Error)]
pub enum DomainFailure {
    #[error("fetch failed: {0}")]
    Fetch(#[source] ClientError),

    #[error(transparent)]
    Artifact(ArtifactError),

    #[error("hook failed: {0}")]
    Hook(#[source] CommandError),
}

/// Every failure of a run, keyed by domain
#[derive(Debug, Default)]
pub struct ReconcileErrors {
    failures: Vec<(String, DomainFailure)>,
}

impl ReconcileErrors {
    pub fn failures(&self) -> &[(String, DomainFailure)] {
        &self.failures
    }

    /// Names of the failed domains, each once, in processing order
    pub fn domains(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (domain, _) in &self.failures {
            if !names.contains(&domain.as_str()) {
                names.push(domain);
            }
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }
}

impl fmt::Display for ReconcileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.failures.len())?;
        for (domain, failure) in &self.failures {
            write!(f, "\n\t* Domain {}: {}", domain, failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for ReconcileErrors {}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileErrors),
}

/// Result of reconciling one domain
#[derive(Debug)]
pub struct DomainOutcome {
    pub domain: String,
    pub written: Vec<ArtifactKind>,
    pub hook_ran: bool,
    pub failures: Vec<DomainFailure>,
}

impl DomainOutcome {
    fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            written: Vec::new(),
            hook_ran: false,
            failures: Vec::new(),
        }
    }

    pub fn changed(&self) -> bool {
        !self.written.is_empty()
    }
}

/// Result of one pass over all domains
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<DomainOutcome>,
}

impl RunReport {
    pub fn outcome(&self, domain: &str) -> Option<&DomainOutcome> {
        self.outcomes.iter().find(|o| o.domain == domain)
    }

    /// Collapse into the aggregate error, if any domain failed
    pub fn into_result(self) -> Result<(), ReconcileErrors> {
        let failures: Vec<_> = self
            .outcomes
            .into_iter()
            .flat_map(|outcome| {
                let domain = outcome.domain;
                outcome
                    .failures
                    .into_iter()
                    .map(move |failure| (domain.clone(), failure))
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReconcileErrors { failures })
        }
    }
}

pub struct ReconciliationEngine {
    source: Arc<dyn CertificateSource>,
    runner: Arc<dyn CommandRunner>,
    profile: HostProfile,
    targets: Vec<DomainTarget>,
    refresh_interval: Duration,
    daemon: bool,
}

impl ReconciliationEngine {
    /// Validate the configuration and resolve the host profile
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn CertificateSource>,
        runner: Arc<dyn CommandRunner>,
        probe: &dyn HostProbe,
    ) -> Result<Self, ConfigError> {
        config.validate_connection()?;
        let profile = resolve_profile(&config, probe);
        let targets = apply_profile(&config.domains, profile, probe)?;

        Ok(Self {
            source,
            runner,
            profile,
            targets,
            refresh_interval: config.refresh_interval(),
            daemon: config.daemon,
        })
    }

    /// Engine talking to a real relay, running real commands on this host
    pub fn from_config(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate_connection()?;
        let client = RemoteCertClient::new(ClientConfig {
            server: config.server.clone(),
            secret: config.secret.clone(),
            skip_verify: config.skip_verify,
            request_timeout: config.request_timeout_seconds.map(Duration::from_secs),
        })?;

        Ok(Self::new(
            config,
            Arc::new(client),
            Arc::new(SystemCommandRunner),
            &FsHostProbe::new(),
        )?)
    }

    pub fn profile(&self) -> HostProfile {
        self.profile
    }

    pub fn targets(&self) -> &[DomainTarget] {
        &self.targets
    }

    /// Reconcile every domain once
    pub async fn run_once(&self) -> RunReport {
        debug!("Processing {} domain(s)", self.targets.len());

        let mut report = RunReport::default();
        for target in &self.targets {
            report.outcomes.push(self.reconcile(target).await);
        }

        debug!("Processing domains completed");
        report
    }

    async fn reconcile(&self, target: &DomainTarget) -> DomainOutcome {
        let mut outcome = DomainOutcome::new(&target.name);

        let cr = match self.source.fetch(&target.name).await {
            Ok(cr) => cr,
            Err(e) => {
                outcome.failures.push(DomainFailure::Fetch(e));
                return outcome;
            }
        };

        let mut planned: Vec<(ArtifactKind, &Path, Vec<u8>)> = Vec::new();
        if let Some(path) = &target.key_file {
            planned.push((ArtifactKind::Key, path.as_path(), cr.key_pem().to_vec()));
        }
        if let Some(path) = &target.cert_file {
            planned.push((ArtifactKind::Cert, path.as_path(), cr.cert_pem().to_vec()));
        }
        if let Some(path) = &target.full_chain_file {
            planned.push((ArtifactKind::FullChain, path.as_path(), cr.full_chain_pem()));
        }

        for (kind, path, data) in planned {
            match sync_artifact(kind, path, &data).await {
                Ok(true) => outcome.written.push(kind),
                Ok(false) => {}
                Err(e) => outcome.failures.push(DomainFailure::Artifact(e)),
            }
        }

        if let Some(keystore) = &target.keystore {
            let written = match build_keystore(self.runner.as_ref(), &cr, &keystore.passphrase)
                .await
            {
                Ok(bytes) => sync_artifact(ArtifactKind::Keystore, &keystore.file, &bytes).await,
                Err(source) => Err(ArtifactError::Keystore {
                    path: keystore.file.clone(),
                    source,
                }),
            };
            match written {
                Ok(true) => outcome.written.push(ArtifactKind::Keystore),
                Ok(false) => {}
                Err(e) => outcome.failures.push(DomainFailure::Artifact(e)),
            }
        }

        if !outcome.changed() {
            debug!("Domain {} unchanged", target.name);
            return outcome;
        }
        info!(
            "Domain {} updated ({})",
            target.name,
            outcome
                .written
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let Some(hook) = &target.hook else {
            debug!("No hook configured for domain {}", target.name);
            return outcome;
        };

        debug!("Running hook '{}' for domain {}", hook.display(), target.name);
        match self.runner.run(&hook.name, &hook.args, &[], None).await {
            Ok(output) => {
                outcome.hook_ran = true;
                debug!(
                    "Hook '{}' for domain {} returned output {}",
                    hook.display(),
                    target.name,
                    output.combined().trim()
                );
            }
            Err(e) => {
                outcome.hook_ran = true;
                outcome.failures.push(DomainFailure::Hook(e));
            }
        }

        outcome
    }

    /// Reconcile now and then on every refresh interval until cancelled
    pub async fn run_daemon(&self, cancel: CancellationToken) {
        info!("Reconciling every {}s", self.refresh_interval.as_secs());

        loop {
            if let Err(e) = self.run_once().await.into_result() {
                error!("{}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconciliation loop stopped");
                    return;
                }
                _ = tokio::time::sleep(self.refresh_interval) => {}
            }
        }
    }

    /// Daemon or single pass, depending on configuration
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        if self.daemon {
            self.run_daemon(cancel).await;
            return Ok(());
        }
        self.run_once().await.into_result()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_errors_display() {
        let errors = ReconcileErrors {
            failures: vec![
                (
                    "a.test".to_string(),
                    DomainFailure::Fetch(ClientError::Remote("Domain not found".to_string())),
                ),
                (
                    "a.test".to_string(),
                    DomainFailure::Fetch(ClientError::ServerStatus(500)),
                ),
                (
                    "b.test".to_string(),
                    DomainFailure::Fetch(ClientError::Auth("nope".to_string())),
                ),
            ],
        };

        assert_eq!(errors.domains(), vec!["a.test", "b.test"]);
        assert_eq!(errors.len(), 3);
        let text = errors.to_string();
        assert!(text.starts_with("3 error(s) occurred:"));
        assert!(text.contains("Domain b.test: fetch failed"));
    }

    #[test]
    fn test_empty_report_is_ok() {
        assert!(RunReport::default().into_result().is_ok());
    }
}
