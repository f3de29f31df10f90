//! HTTP routes
//!
//! Every application-level outcome, including auth failures, is a JSON body
//! with status 200.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::routing::get;
use axum::{Json, Router};
use certrelay_auth::AuthGateway;
use certrelay_cert::DomainSupervisor;
use certrelay_proto::{
    AuthChallenge, CertResponse, ChallengeResponse, SimpleMessage, TokenResponse,
    AUTH_REQUEST_PATH, AUTH_TOKEN_PATH, BEARER_PREFIX, CERT_PATH, DOMAIN_QUERY_PARAM,
};
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthGateway>,
    pub domains: Arc<HashMap<String, Arc<DomainSupervisor>>>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(AUTH_REQUEST_PATH, get(auth_request))
        .route(AUTH_TOKEN_PATH, get(auth_token).post(auth_token))
        .route(CERT_PATH, get(get_cert))
        .fallback(usage)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn auth_request(State(state): State<AppState>) -> Json<AuthChallenge> {
    Json(state.auth.issue_challenge())
}

async fn auth_token(State(state): State<AppState>, body: Bytes) -> Json<TokenResponse> {
    let response: ChallengeResponse = match serde_json::from_slice(&body) {
        Ok(response) => response,
        Err(e) => {
            debug!("Invalid token request body: {}", e);
            return Json(TokenResponse::failed(format!("Invalid request body: {}", e)));
        }
    };

    match state.auth.exchange_for_token(&response) {
        Ok(token) => Json(TokenResponse::issued(token)),
        Err(e) => {
            debug!("Token exchange rejected: {}", e);
            Json(TokenResponse::failed(e.to_string()))
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn get_cert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Json<CertResponse> {
    let Some(token) = bearer_token(&headers) else {
        debug!("Bearer token not found");
        return Json(CertResponse::auth_failed("Bearer token not found"));
    };

    let domain = params
        .get(DOMAIN_QUERY_PARAM)
        .map(String::as_str)
        .unwrap_or_default();
    if domain.is_empty() {
        debug!("Domain missing from request");
        return Json(CertResponse::failed("Domain is required"));
    }

    let Some(supervisor) = state.domains.get(domain) else {
        debug!("Request for unknown domain {}", domain);
        return Json(CertResponse::failed("Domain not found"));
    };

    if let Err(e) = state.auth.validate_token(token) {
        debug!("Rejected token for {}: {}", domain, e);
        return Json(CertResponse::auth_failed(e.to_string()));
    }

    let snapshot = supervisor.get();
    let error = match (&snapshot.resource, snapshot.last_error) {
        (None, None) => Some("Certificate not yet available".to_string()),
        (_, error) => error,
    };

    Json(CertResponse {
        cr: snapshot.resource,
        error,
        code: None,
    })
}

async fn usage(headers: HeaderMap) -> Json<SimpleMessage> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");

    let mut message = String::from("Valid calls are\n");
    message.push_str(&format!("GET https://{}{}\n", host, AUTH_REQUEST_PATH));
    message.push_str(&format!("POST https://{}{}\n", host, AUTH_TOKEN_PATH));
    message.push_str(&format!(
        "GET https://{}{}?{}=example.com\n",
        host, CERT_PATH, DOMAIN_QUERY_PARAM
    ));

    Json(SimpleMessage {
        message: Some(message),
        error: None,
    })
}
