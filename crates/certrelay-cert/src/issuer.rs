//! Certificate issuance capability

use async_trait::async_trait;
use certrelay_proto::CertificateResource;
use thiserror::Error;

/// Issuance errors
#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("ACME error: {0}")]
    Acme(String),

    #[error("Account creation failed: {0}")]
    AccountCreationFailed(String),

    #[error("Order creation failed: {0}")]
    OrderCreationFailed(String),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Certificate finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Names a certificate must cover
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub domain: String,
    pub aliases: Vec<String>,
}

impl IssueRequest {
    pub fn new(domain: impl Into<String>, aliases: Vec<String>) -> Self {
        Self {
            domain: domain.into(),
            aliases,
        }
    }

    /// Primary name followed by aliases, without duplicates
    pub fn names(&self) -> Vec<String> {
        let mut names = vec![self.domain.clone()];
        for alias in &self.aliases {
            if !names.contains(alias) {
                names.push(alias.clone());
            }
        }
        names
    }
}

/// Obtains certificate resources from a certificate authority
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn obtain(&self, request: &IssueRequest) -> Result<CertificateResource, IssuerError>;
}

/// Validate a domain name before sending it to a CA
pub fn validate_domain(domain: &str) -> Result<(), IssuerError> {
    if domain.is_empty() {
        return Err(IssuerError::InvalidDomain(
            "Domain cannot be empty".to_string(),
        ));
    }

    if domain.contains(' ') || domain.contains('/') {
        return Err(IssuerError::InvalidDomain(format!(
            "Domain contains invalid characters: {}",
            domain
        )));
    }

    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(IssuerError::InvalidDomain(
            "Domain cannot start or end with a dot".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_deduplicates_aliases() {
        let request = IssueRequest::new(
            "example.com",
            vec![
                "www.example.com".to_string(),
                "example.com".to_string(),
                "www.example.com".to_string(),
            ],
        );
        assert_eq!(request.names(), vec!["example.com", "www.example.com"]);
    }

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("sub.example.com").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("invalid domain.com").is_err());
        assert!(validate_domain("../etc").is_err());
        assert!(validate_domain(".example.com").is_err());
        assert!(validate_domain("example.com.").is_err());
    }
}
