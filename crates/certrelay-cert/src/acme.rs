//! ACME issuer answering HTTP-01 challenges

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use certrelay_proto::CertificateResource;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus, RetryPolicy,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::write_private_file;
use crate::issuer::{validate_domain, CertificateIssuer, IssueRequest, IssuerError};

pub const ACCOUNT_FILE: &str = "acme_account.json";

/// ACME configuration
#[derive(Clone)]
pub struct AcmeConfig {
    /// Contact email for the CA account
    pub contact_email: String,
    pub directory_url: String,
    /// Account credentials are persisted here
    pub cache_dir: PathBuf,
    /// Where the HTTP-01 responder listens during issuance
    pub http_challenge_addr: SocketAddr,
    pub order_timeout: Duration,
}

impl std::fmt::Debug for AcmeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeConfig")
            .field("contact_email", &self.contact_email)
            .field("directory_url", &self.directory_url)
            .field("cache_dir", &self.cache_dir)
            .field("http_challenge_addr", &self.http_challenge_addr)
            .finish()
    }
}

impl AcmeConfig {
    pub fn new(contact_email: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            contact_email: contact_email.into(),
            directory_url: LetsEncrypt::Production.url().to_string(),
            cache_dir: cache_dir.into(),
            http_challenge_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            order_timeout: Duration::from_secs(120),
        }
    }

    pub fn staging(mut self) -> Self {
        self.directory_url = LetsEncrypt::Staging.url().to_string();
        self
    }
}

/// Pending HTTP-01 key authorizations by token
#[derive(Clone, Default)]
pub struct ChallengeStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeStore {
    pub fn insert(&self, token: String, key_authorization: String) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token, key_authorization);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .cloned()
    }
}

/// Router serving `/.well-known/acme-challenge/{token}`
pub fn challenge_router(store: ChallengeStore) -> Router {
    Router::new()
        .route(
            "/.well-known/acme-challenge/{token}",
            get(serve_challenge),
        )
        .with_state(store)
}

async fn serve_challenge(
    State(store): State<ChallengeStore>,
    Path(token): Path<String>,
) -> Result<String, StatusCode> {
    match store.get(&token) {
        Some(key_authorization) => {
            debug!("Answered HTTP-01 challenge {}", token);
            Ok(key_authorization)
        }
        None => {
            warn!("Unknown HTTP-01 challenge token {}", token);
            Err(StatusCode::NOT_FOUND)
        }
    }
}

/// Issues certificates from an ACME CA
pub struct AcmeIssuer {
    config: AcmeConfig,
    account: Mutex<Option<Account>>,
    /// One order at a time; the responder owns the challenge port
    issuing: Mutex<()>,
}

impl AcmeIssuer {
    pub fn new(config: AcmeConfig) -> Self {
        Self {
            config,
            account: Mutex::new(None),
            issuing: Mutex::new(()),
        }
    }

    fn account_path(&self) -> PathBuf {
        self.config.cache_dir.join(ACCOUNT_FILE)
    }

    /// Restore the persisted account or register a new one
    async fn account(&self) -> Result<Account, IssuerError> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }

        let account = match tokio::fs::read(self.account_path()).await {
            Ok(data) => {
                let credentials: AccountCredentials = serde_json::from_slice(&data)
                    .map_err(|e| {
                        IssuerError::AccountCreationFailed(format!(
                            "Invalid saved credentials: {}",
                            e
                        ))
                    })?;
                debug!("Restoring ACME account from {}", self.account_path().display());
                Account::builder()
                    .map_err(|e| IssuerError::AccountCreationFailed(e.to_string()))?
                    .from_credentials(credentials)
                    .await
                    .map_err(|e| IssuerError::AccountCreationFailed(e.to_string()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.register().await?
            }
            Err(e) => return Err(e.into()),
        };

        *guard = Some(account.clone());
        Ok(account)
    }

    async fn register(&self) -> Result<Account, IssuerError> {
        info!(
            "Registering ACME account for {} at {}",
            self.config.contact_email, self.config.directory_url
        );

        let contact = format!("mailto:{}", self.config.contact_email);
        let (account, credentials) = Account::builder()
            .map_err(|e| IssuerError::AccountCreationFailed(e.to_string()))?
            .create(
                &NewAccount {
                    contact: &[contact.as_str()],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.config.directory_url.clone(),
                None,
            )
            .await
            .map_err(|e| IssuerError::AccountCreationFailed(e.to_string()))?;

        let json = serde_json::to_vec_pretty(&credentials)
            .map_err(|e| IssuerError::AccountCreationFailed(e.to_string()))?;
        tokio::fs::create_dir_all(&self.config.cache_dir).await?;
        write_private_file(&self.account_path(), &json).await?;

        Ok(account)
    }

    async fn run_order(
        &self,
        account: &Account,
        names: &[String],
        store: &ChallengeStore,
    ) -> Result<CertificateResource, IssuerError> {
        let identifiers: Vec<Identifier> =
            names.iter().map(|n| Identifier::Dns(n.clone())).collect();

        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| IssuerError::OrderCreationFailed(e.to_string()))?;

        let mut authorizations = order.authorizations();
        while let Some(authz) = authorizations.next().await {
            let mut authz = authz.map_err(|e| IssuerError::ChallengeFailed(e.to_string()))?;
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let mut challenge = authz.challenge(ChallengeType::Http01).ok_or_else(|| {
                IssuerError::ChallengeFailed("No HTTP-01 challenge offered".to_string())
            })?;

            store.insert(
                challenge.token.clone(),
                challenge.key_authorization().as_str().to_string(),
            );
            challenge
                .set_ready()
                .await
                .map_err(|e| IssuerError::ChallengeFailed(e.to_string()))?;
        }

        let retry = RetryPolicy::new().timeout(self.config.order_timeout);
        let status = order
            .poll_ready(&retry)
            .await
            .map_err(|e| IssuerError::ChallengeFailed(e.to_string()))?;
        if status != OrderStatus::Ready {
            return Err(IssuerError::ChallengeFailed(format!(
                "Order not ready: {:?}",
                status
            )));
        }

        let private_key_pem = order
            .finalize()
            .await
            .map_err(|e| IssuerError::FinalizationFailed(e.to_string()))?;
        let chain_pem = order
            .poll_certificate(&retry)
            .await
            .map_err(|e| IssuerError::FinalizationFailed(e.to_string()))?;

        let (leaf, issuer) = split_chain(&chain_pem);
        let cert_url = order.url().to_string();

        Ok(CertificateResource {
            domain: names[0].clone(),
            cert_url: cert_url.clone(),
            cert_stable_url: cert_url,
            private_key: private_key_pem.into_bytes(),
            certificate: leaf.into_bytes(),
            issuer_certificate: issuer.into_bytes(),
            certificate_signing_request: Vec::new(),
        })
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn obtain(&self, request: &IssueRequest) -> Result<CertificateResource, IssuerError> {
        let names = request.names();
        for name in &names {
            validate_domain(name)?;
        }

        let _issuing = self.issuing.lock().await;
        let account = self.account().await?;

        let store = ChallengeStore::default();
        let listener = tokio::net::TcpListener::bind(self.config.http_challenge_addr).await?;
        info!(
            "HTTP-01 responder listening on {} for {}",
            self.config.http_challenge_addr,
            names.join(", ")
        );

        let stop = CancellationToken::new();
        let responder = {
            let stop = stop.clone();
            let router = challenge_router(store.clone());
            tokio::spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { stop.cancelled().await })
                    .await
            })
        };

        let result = self.run_order(&account, &names, &store).await;

        stop.cancel();
        match responder.await {
            Ok(Err(e)) => warn!("HTTP-01 responder error: {}", e),
            Err(e) => warn!("HTTP-01 responder task failed: {}", e),
            Ok(Ok(())) => {}
        }

        if result.is_ok() {
            info!("Obtained certificate for {}", names.join(", "));
        }
        result
    }
}

/// Split a PEM chain into the leaf and the remaining issuer certificates
pub fn split_chain(chain_pem: &str) -> (String, String) {
    const END: &str = "-----END CERTIFICATE-----";

    match chain_pem.find(END) {
        Some(idx) => {
            let split = idx + END.len();
            let leaf = format!("{}\n", &chain_pem[..split]);
            let issuer = chain_pem[split..].trim_start().to_string();
            (leaf, issuer)
        }
        None => (chain_pem.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_acme_config_defaults() {
        let config = AcmeConfig::new("admin@example.com", "/tmp/certs");
        assert_eq!(config.directory_url, LetsEncrypt::Production.url());
        assert_eq!(config.http_challenge_addr.port(), 80);

        let staging = config.staging();
        assert_eq!(staging.directory_url, LetsEncrypt::Staging.url());
    }

    #[test]
    fn test_split_chain() {
        let chain = "-----BEGIN CERTIFICATE-----\nleaf\n-----END CERTIFICATE-----\n\
                     -----BEGIN CERTIFICATE-----\nca1\n-----END CERTIFICATE-----\n\
                     -----BEGIN CERTIFICATE-----\nca2\n-----END CERTIFICATE-----\n";

        let (leaf, issuer) = split_chain(chain);
        assert_eq!(
            leaf,
            "-----BEGIN CERTIFICATE-----\nleaf\n-----END CERTIFICATE-----\n"
        );
        assert!(issuer.starts_with("-----BEGIN CERTIFICATE-----\nca1"));
        assert!(issuer.contains("ca2"));
    }

    #[test]
    fn test_split_chain_single_cert() {
        let (leaf, issuer) =
            split_chain("-----BEGIN CERTIFICATE-----\nleaf\n-----END CERTIFICATE-----\n");
        assert!(leaf.contains("leaf"));
        assert!(issuer.is_empty());
    }

    #[tokio::test]
    async fn test_challenge_router_serves_known_token() {
        let store = ChallengeStore::default();
        store.insert("tok".to_string(), "tok.thumbprint".to_string());
        let app = challenge_router(store);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/.well-known/acme-challenge/tok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"tok.thumbprint");
    }

    #[tokio::test]
    async fn test_challenge_router_unknown_token() {
        let app = challenge_router(ChallengeStore::default());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/.well-known/acme-challenge/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_obtain_rejects_invalid_names() {
        let issuer = AcmeIssuer::new(AcmeConfig::new("admin@example.com", "/tmp/unused"));
        let result = issuer
            .obtain(&IssueRequest::new("bad name.com", Vec::new()))
            .await;

        assert!(matches!(result, Err(IssuerError::InvalidDomain(_))));
    }
}
