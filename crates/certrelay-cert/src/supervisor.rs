//! Per-domain certificate lifecycle
//!
//! Each configured domain gets one [`DomainSupervisor`]. It owns the domain's
//! current certificate resource and last error behind a read/write lock, so
//! HTTP handlers can read a consistent snapshot without ever waiting on the
//! CA. Renewal runs on a background task and reports progress through
//! [`RenewalEvent`]s.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use certrelay_proto::CertificateResource;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheError, CertCache};
use crate::expiry::{is_expired, needs_renewal};
use crate::issuer::{CertificateIssuer, IssueRequest, IssuerError};

#[derive(Debug, Error)]
pub enum RenewalError {
    #[error("Certificate issuance failed for {domain}: {source}")]
    Issuer {
        domain: String,
        #[source]
        source: IssuerError,
    },

    #[error("Certificate cache error for {domain}: {source}")]
    Cache {
        domain: String,
        #[source]
        source: CacheError,
    },

    #[error("Certificate for {0} missing from cache after store")]
    MissingAfterStore(String),
}

/// Lifecycle phase of a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainPhase {
    Uninitialized,
    Acquiring,
    Ready,
    Renewing,
    Failed,
}

/// Owned, consistent view of a domain's state
#[derive(Debug, Clone)]
pub struct DomainSnapshot {
    pub phase: DomainPhase,
    pub resource: Option<CertificateResource>,
    pub last_error: Option<String>,
}

/// When to check and how early to renew
#[derive(Debug, Clone)]
pub struct RenewalPolicy {
    pub check_interval: Duration,
    pub renew_before: chrono::Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(2 * 24 * 60 * 60),
            renew_before: chrono::Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalEventKind {
    WillRenew,
    DidRenew,
    Failed(String),
}

/// Renewal progress for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalEvent {
    pub domain: String,
    pub kind: RenewalEventKind,
}

/// Drives acquisition and renewal for one domain
pub struct DomainSupervisor {
    request: IssueRequest,
    issuer: Arc<dyn CertificateIssuer>,
    cache: CertCache,
    policy: RenewalPolicy,
    state: RwLock<DomainSnapshot>,
}

impl DomainSupervisor {
    pub fn new(
        domain: impl Into<String>,
        aliases: Vec<String>,
        issuer: Arc<dyn CertificateIssuer>,
        cache: CertCache,
        policy: RenewalPolicy,
    ) -> Self {
        Self {
            request: IssueRequest::new(domain, aliases),
            issuer,
            cache,
            policy,
            state: RwLock::new(DomainSnapshot {
                phase: DomainPhase::Uninitialized,
                resource: None,
                last_error: None,
            }),
        }
    }

    pub fn domain(&self) -> &str {
        &self.request.domain
    }

    /// Current state; never blocks on issuance
    pub fn get(&self) -> DomainSnapshot {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update(&self, f: impl FnOnce(&mut DomainSnapshot)) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut state);
    }

    fn set_phase(&self, phase: DomainPhase) {
        self.update(|state| state.phase = phase);
    }

    fn set_ready(&self, resource: CertificateResource) {
        self.update(|state| {
            state.phase = DomainPhase::Ready;
            state.resource = Some(resource);
            state.last_error = None;
        });
    }

    /// Serving a certificate whose renewal failed
    fn set_stale(&self, resource: CertificateResource, error: &RenewalError) {
        let message = error.to_string();
        self.update(|state| {
            state.phase = DomainPhase::Ready;
            state.resource = Some(resource);
            state.last_error = Some(message);
        });
    }

    /// The previous resource, if any, stays in place
    fn set_failed(&self, error: &RenewalError) {
        let message = error.to_string();
        self.update(|state| {
            state.phase = DomainPhase::Failed;
            state.last_error = Some(message);
        });
    }

    /// Load the cached certificate or obtain a new one
    ///
    /// A cached certificate that is due for renewal but not yet expired is
    /// still served when issuance fails; the renewal loop retries later.
    pub async fn initialize(&self) -> Result<(), RenewalError> {
        self.set_phase(DomainPhase::Acquiring);
        info!("Initializing certificate for {}", self.domain());

        let cached = match self.load_cached().await {
            Ok(cached) => cached,
            Err(e) => return Err(self.fail_initialize(e)),
        };

        if let Some(cached) = &cached {
            if !needs_renewal(&cached.certificate, self.policy.renew_before, Utc::now()) {
                debug!("Using cached certificate for {}", self.domain());
                self.set_ready(cached.clone());
                return Ok(());
            }
            info!("Cached certificate for {} is due for renewal", self.domain());
        }

        match self.issue().await {
            Ok(resource) => {
                self.set_ready(resource);
                info!("Certificate for {} is ready", self.domain());
                Ok(())
            }
            Err(e) => match cached.filter(|c| !is_expired(&c.certificate, Utc::now())) {
                Some(cached) => {
                    warn!(
                        "Renewal of {} failed, serving cached certificate until it expires: {}",
                        self.domain(),
                        e
                    );
                    self.set_stale(cached, &e);
                    Ok(())
                }
                None => Err(self.fail_initialize(e)),
            },
        }
    }

    fn fail_initialize(&self, e: RenewalError) -> RenewalError {
        error!("Failed to initialize certificate for {}: {}", self.domain(), e);
        self.set_failed(&e);
        e
    }

    async fn load_cached(&self) -> Result<Option<CertificateResource>, RenewalError> {
        self.cache
            .load(self.domain())
            .await
            .map_err(|source| RenewalError::Cache {
                domain: self.domain().to_string(),
                source,
            })
    }

    /// Obtain, persist, then re-read from disk
    async fn issue(&self) -> Result<CertificateResource, RenewalError> {
        let issued = self
            .issuer
            .obtain(&self.request)
            .await
            .map_err(|source| RenewalError::Issuer {
                domain: self.domain().to_string(),
                source,
            })?;

        self.cache
            .store(&issued)
            .await
            .map_err(|source| RenewalError::Cache {
                domain: self.domain().to_string(),
                source,
            })?;

        self.load_cached()
            .await?
            .ok_or_else(|| RenewalError::MissingAfterStore(self.domain().to_string()))
    }

    fn is_due(&self) -> bool {
        match self.get().resource {
            Some(resource) => {
                needs_renewal(&resource.certificate, self.policy.renew_before, Utc::now())
            }
            None => true,
        }
    }

    /// Renew now if the current certificate is missing or close to expiry
    ///
    /// Returns whether a renewal was attempted.
    pub async fn check(&self, events: &mpsc::Sender<RenewalEvent>) -> bool {
        if !self.is_due() {
            debug!("Certificate for {} is not due for renewal", self.domain());
            return false;
        }

        self.renew(events).await;
        true
    }

    async fn renew(&self, events: &mpsc::Sender<RenewalEvent>) {
        info!("Renewing certificate for {}", self.domain());
        self.emit(events, RenewalEventKind::WillRenew).await;
        self.set_phase(DomainPhase::Renewing);

        match self.issue().await {
            Ok(resource) => {
                self.set_ready(resource);
                info!("Renewed certificate for {}", self.domain());
                self.emit(events, RenewalEventKind::DidRenew).await;
            }
            Err(e) => {
                error!("Renewal failed for {}: {}", self.domain(), e);
                self.set_failed(&e);
                self.emit(events, RenewalEventKind::Failed(e.to_string()))
                    .await;
            }
        }
    }

    async fn emit(&self, events: &mpsc::Sender<RenewalEvent>, kind: RenewalEventKind) {
        let event = RenewalEvent {
            domain: self.domain().to_string(),
            kind,
        };
        if events.send(event).await.is_err() {
            warn!("Renewal event receiver dropped for {}", self.domain());
        }
    }

    /// Start the periodic renewal loop on `tracker`
    pub fn spawn_renewal(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        cancel: CancellationToken,
        events: mpsc::Sender<RenewalEvent>,
    ) {
        let supervisor = Arc::clone(self);
        let period = if supervisor.policy.check_interval.is_zero() {
            warn!(
                "Zero check interval for {}, using the default",
                supervisor.domain()
            );
            RenewalPolicy::default().check_interval
        } else {
            supervisor.policy.check_interval
        };

        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Renewal loop for {} stopped", supervisor.domain());
                        break;
                    }
                    _ = ticker.tick() => {
                        supervisor.check(&events).await;
                    }
                }
            }
        });
    }
}
