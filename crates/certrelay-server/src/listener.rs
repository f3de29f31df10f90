//! Shared TLS listener lifecycle
//!
//! The listener starts embargoed: nothing can bind until the primary domain's
//! certificate has loaded and [`ListenerController::lift_embargo`] is called.
//! All transitions go through one async mutex so a renewal-driven stop can
//! never interleave with a start.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Listener failed: {0}")]
    Serve(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    /// Not allowed to start until the embargo is lifted
    Embargoed,
    Stopped,
    Running,
}

struct ListenerState {
    status: ListenerStatus,
    handle: Option<Handle>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub listen_addr: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub shutdown_grace: Duration,
}

/// Starts and stops the HTTPS listener serving the API router
pub struct ListenerController {
    config: ListenerConfig,
    router: Router,
    fatal: mpsc::UnboundedSender<ListenerError>,
    state: Mutex<ListenerState>,
}

impl ListenerController {
    /// Serve failures after a successful start are sent to `fatal`
    pub fn new(
        config: ListenerConfig,
        router: Router,
        fatal: mpsc::UnboundedSender<ListenerError>,
    ) -> Self {
        Self {
            config,
            router,
            fatal,
            state: Mutex::new(ListenerState {
                status: ListenerStatus::Embargoed,
                handle: None,
                task: None,
                local_addr: None,
            }),
        }
    }

    pub async fn status(&self) -> ListenerStatus {
        self.state.lock().await.status
    }

    /// Bound address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.local_addr
    }

    pub async fn lift_embargo(&self) {
        let mut state = self.state.lock().await;
        if state.status == ListenerStatus::Embargoed {
            debug!("Listener embargo lifted");
            state.status = ListenerStatus::Stopped;
        }
    }

    /// Bind and serve; a no-op while embargoed or already running
    pub async fn start(&self) -> Result<(), ListenerError> {
        let mut state = self.state.lock().await;
        match state.status {
            ListenerStatus::Embargoed => {
                debug!("Listener start ignored, still embargoed");
                return Ok(());
            }
            ListenerStatus::Running => {
                debug!("Listener already running");
                return Ok(());
            }
            ListenerStatus::Stopped => {}
        }

        info!("Loading TLS certificate from: {}", self.config.cert_path.display());
        let tls = load_tls_config(&self.config.cert_path, &self.config.key_path)?;

        let handle = Handle::new();
        let addr = self.config.listen_addr;
        let server = axum_server::bind_rustls(addr, tls)
            .handle(handle.clone())
            .serve(self.router.clone().into_make_service());

        let fatal = self.fatal.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("HTTPS listener on {} failed: {}", addr, e);
                let _ = fatal.send(ListenerError::Serve(e.to_string()));
            }
        });

        let Some(local_addr) = handle.listening().await else {
            let reason = match task.await {
                Err(e) => e.to_string(),
                Ok(()) => "listener exited before binding".to_string(),
            };
            return Err(ListenerError::Bind {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason,
            });
        };

        info!("HTTPS listener running on {}", local_addr);
        state.status = ListenerStatus::Running;
        state.handle = Some(handle);
        state.task = Some(task);
        state.local_addr = Some(local_addr);
        Ok(())
    }

    /// Graceful stop bounded by the shutdown grace; a no-op unless running
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.status != ListenerStatus::Running {
            debug!("Listener stop ignored, not running");
            return;
        }

        info!("Stopping HTTPS listener");
        if let Some(handle) = state.handle.take() {
            handle.graceful_shutdown(Some(self.config.shutdown_grace));
        }
        if let Some(task) = state.task.take() {
            if let Err(e) = task.await {
                error!("HTTPS listener task failed: {}", e);
            }
        }

        state.status = ListenerStatus::Stopped;
        state.local_addr = None;
        info!("HTTPS listener stopped");
    }

    /// Stop and re-embargo so late renewal events cannot restart it
    pub async fn shutdown(&self) {
        self.stop().await;
        self.state.lock().await.status = ListenerStatus::Embargoed;
    }
}

fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, ListenerError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ListenerError::Tls(format!("Invalid TLS settings: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ListenerError::Tls(format!("Invalid cert/key: {}", e)))?;

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ListenerError> {
    let file = File::open(path)
        .map_err(|e| ListenerError::Tls(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ListenerError::Tls(format!("Failed to parse certs: {}", e)))?;
    if certs.is_empty() {
        return Err(ListenerError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ListenerError> {
    let file = File::open(path)
        .map_err(|e| ListenerError::Tls(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ListenerError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| ListenerError::Tls("No private key found".to_string()))
}
