// src/gate.rs
use crate::auth::{IdentityClient, Session, SESSION_COOKIE};
use crate::error::AppError;
use log::warn;
use std::sync::Arc;
use warp::filters::path::FullPath;
use warp::reject::Reject;
use warp::{Filter, Rejection};

/// Routing convention the gate enforces.
#[derive(Debug, Clone)]
pub struct GatePaths {
    /// Everything starting with this requires a session.
    pub protected_prefix: String,
    pub login: String,
    pub root: String,
    /// Where signed-in users land when they hit a public-only page.
    pub landing: String,
}

impl Default for GatePaths {
    fn default() -> Self {
        GatePaths {
            protected_prefix: "/portfolio".to_string(),
            login: "/auth/login".to_string(),
            root: "/".to_string(),
            landing: "/portfolio".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    PassThrough,
    RedirectToLogin,
    RedirectToLanding,
}

pub fn decide(paths: &GatePaths, path: &str, session: Option<&Session>) -> GateDecision {
    // `/auth/login/` is the same page as `/auth/login`
    let path = match path.strip_suffix('/') {
        Some(trimmed) if !trimmed.is_empty() => trimmed,
        _ => path,
    };
    match session {
        None if path.starts_with(&paths.protected_prefix) => GateDecision::RedirectToLogin,
        Some(_) if path == paths.root || path == paths.login => GateDecision::RedirectToLanding,
        _ => GateDecision::PassThrough,
    }
}

/// Rejection turned into a `307` by the recover handler.
#[derive(Debug)]
pub struct Redirect {
    pub location: String,
}

impl Reject for Redirect {}

/// Candidate access tokens in lookup order: the session cookie first, then a
/// bearer header.
pub fn session_tokens() -> impl Filter<Extract = (Vec<String>,), Error = Rejection> + Clone {
    warp::cookie::optional(SESSION_COOKIE)
        .and(warp::header::optional::<String>("authorization"))
        .map(|cookie: Option<String>, header: Option<String>| {
            let bearer = header.and_then(|h| h.strip_prefix("Bearer ").map(|t| t.trim().to_string()));
            let mut tokens: Vec<String> = Vec::with_capacity(2);
            for token in cookie.into_iter().chain(bearer) {
                if !token.is_empty() && !tokens.contains(&token) {
                    tokens.push(token);
                }
            }
            tokens
        })
}

/// Resolves the caller's session and applies [`decide`]. Extracts the
/// session when the request may pass.
pub fn gate(
    identity: Arc<IdentityClient>,
    paths: Arc<GatePaths>,
) -> impl Filter<Extract = (Option<Session>,), Error = Rejection> + Clone {
    warp::path::full()
        .and(session_tokens())
        .and(warp::any().map(move || identity.clone()))
        .and(warp::any().map(move || paths.clone()))
        .and_then(check)
}

/// Like [`gate`] but requires the session to be present.
pub fn require_session(
    identity: Arc<IdentityClient>,
    paths: Arc<GatePaths>,
) -> impl Filter<Extract = (Session,), Error = Rejection> + Clone {
    gate(identity, paths).and_then(|session: Option<Session>| async move {
        session.ok_or_else(|| warp::reject::custom(AppError::Unauthenticated))
    })
}

async fn check(
    path: FullPath,
    tokens: Vec<String>,
    identity: Arc<IdentityClient>,
    paths: Arc<GatePaths>,
) -> Result<Option<Session>, Rejection> {
    let mut session = None;
    for token in &tokens {
        match identity.lookup_session(token).await {
            Ok(found) => {
                session = Some(found);
                break;
            }
            // fail closed
            Err(e) => warn!("Session lookup failed for {}: {}", path.as_str(), e),
        }
    }

    match decide(&paths, path.as_str(), session.as_ref()) {
        GateDecision::PassThrough => Ok(session),
        GateDecision::RedirectToLogin => Err(warp::reject::custom(Redirect {
            location: paths.login.clone(),
        })),
        GateDecision::RedirectToLanding => Err(warp::reject::custom(Redirect {
            location: paths.landing.clone(),
        })),
    }
}
