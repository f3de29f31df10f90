//! Certificate server orchestration

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use certrelay_auth::AuthGateway;
use certrelay_cert::{
    AcmeIssuer, CacheError, CertCache, CertificateIssuer, DomainSupervisor, RenewalError,
    RenewalEvent, RenewalEventKind,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::listener::{ListenerConfig, ListenerController, ListenerError};
use crate::routes::{build_router, AppState};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Primary domain provisioning failed: {0}")]
    Primary(#[source] RenewalError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Serves certificate material for all configured domains over HTTPS
pub struct CertificateServer {
    config: ServerConfig,
    auth: Arc<AuthGateway>,
    primary: Arc<DomainSupervisor>,
    others: Vec<Arc<DomainSupervisor>>,
    listener: Arc<ListenerController>,
    fatal_tx: mpsc::UnboundedSender<ListenerError>,
    fatal_rx: mpsc::UnboundedReceiver<ListenerError>,
}

impl CertificateServer {
    /// Build a server backed by the ACME issuer
    pub fn from_config(config: ServerConfig) -> Result<Self, ServerError> {
        let issuer = Arc::new(AcmeIssuer::new(config.acme_config()));
        Self::new(config, issuer)
    }

    pub fn new(
        config: ServerConfig,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let cache = CertCache::new(&config.cache_dir);
        let policy = config.renewal_policy();
        let supervisor = |domain: &crate::config::DomainConfig| {
            Arc::new(DomainSupervisor::new(
                domain.name.clone(),
                domain.aliases.clone(),
                Arc::clone(&issuer),
                cache.clone(),
                policy.clone(),
            ))
        };

        let domains: HashMap<String, Arc<DomainSupervisor>> = config
            .all_domains()
            .map(|domain| (domain.name.clone(), supervisor(domain)))
            .collect();
        let primary = domains
            .get(&config.primary_domain.name)
            .cloned()
            .ok_or(ConfigError::MissingPrimaryDomain)?;
        let others: Vec<_> = config
            .domains
            .iter()
            .filter_map(|domain| domains.get(&domain.name).cloned())
            .collect();

        let auth = Arc::new(AuthGateway::with_secret(config.secret.clone()));
        let router = build_router(AppState {
            auth: Arc::clone(&auth),
            domains: Arc::new(domains),
        });

        let listener_config = ListenerConfig {
            listen_addr: config.listen_addr,
            cert_path: cache.cert_path(&config.primary_domain.name)?,
            key_path: cache.key_path(&config.primary_domain.name)?,
            shutdown_grace: config.shutdown_grace(),
        };
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let listener = Arc::new(ListenerController::new(
            listener_config,
            router,
            fatal_tx.clone(),
        ));

        Ok(Self {
            config,
            auth,
            primary,
            others,
            listener,
            fatal_tx,
            fatal_rx,
        })
    }

    pub fn listener(&self) -> Arc<ListenerController> {
        Arc::clone(&self.listener)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().await
    }

    /// Run until `cancel` fires or the listener fails
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ServerError> {
        info!(
            "Starting certificate server for {} (+{} domains)",
            self.config.primary_domain.name,
            self.others.len()
        );

        // The listener stays embargoed if this fails
        self.primary.initialize().await.map_err(ServerError::Primary)?;

        for supervisor in &self.others {
            if let Err(e) = supervisor.initialize().await {
                warn!(
                    "Domain {} unavailable until a later renewal succeeds: {}",
                    supervisor.domain(),
                    e
                );
            }
        }

        let tracker = TaskTracker::new();
        let internal = cancel.child_token();
        let (events_tx, events_rx) = mpsc::channel(16);

        for supervisor in std::iter::once(&self.primary).chain(self.others.iter()) {
            supervisor.spawn_renewal(&tracker, internal.clone(), events_tx.clone());
        }
        drop(events_tx);

        tracker.spawn(consume_renewal_events(
            Arc::clone(&self.listener),
            events_rx,
            self.fatal_tx.clone(),
            internal.clone(),
        ));

        self.listener.lift_embargo().await;
        let started = self.listener.start().await;

        let result = match started {
            Err(e) => Err(ServerError::Listener(e)),
            Ok(()) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Certificate server shutting down");
                        Ok(())
                    }
                    Some(e) = self.fatal_rx.recv() => {
                        error!("Fatal listener error: {}", e);
                        Err(ServerError::Listener(e))
                    }
                }
            }
        };

        internal.cancel();
        self.listener.shutdown().await;
        self.auth.shutdown();
        tracker.close();
        tracker.wait().await;

        info!("Certificate server stopped");
        result
    }
}

/// Stop the shared listener for the duration of any domain's renewal
async fn consume_renewal_events(
    listener: Arc<ListenerController>,
    mut events: mpsc::Receiver<RenewalEvent>,
    fatal: mpsc::UnboundedSender<ListenerError>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event.kind {
            RenewalEventKind::WillRenew => {
                info!("Renewal starting for {}, stopping listener", event.domain);
                listener.stop().await;
            }
            RenewalEventKind::DidRenew | RenewalEventKind::Failed(_) => {
                if let RenewalEventKind::Failed(msg) = &event.kind {
                    warn!("Renewal failed for {}: {}", event.domain, msg);
                }
                if let Err(e) = listener.start().await {
                    error!("Failed to restart listener after renewal: {}", e);
                    let _ = fatal.send(e);
                }
            }
        }
    }
}
