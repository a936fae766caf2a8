// src/api.rs
use crate::auth::{IdentityClient, Session, SESSION_COOKIE};
use crate::db::HoldingStore;
use crate::error::AppError;
use crate::gate::{self, GatePaths, Redirect};
use crate::market::SnapshotCache;
use crate::models::{HoldingDraft, HoldingPatch};
use crate::reconcile;
use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::{header, HeaderValue, StatusCode};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Handles shared by every route, built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn HoldingStore>,
    pub identity: Arc<IdentityClient>,
    pub market: Arc<SnapshotCache>,
    pub paths: Arc<GatePaths>,
    pub reset_redirect: Arc<String>,
}

const REFRESH_COOKIE: &str = "sb-refresh-token";

#[derive(Deserialize)]
struct LoginForm {
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct ResetForm {
    email: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let gate = gate::gate(state.identity.clone(), state.paths.clone());
    let user = gate::require_session(state.identity.clone(), state.paths.clone());

    let home = warp::path::end()
        .and(warp::get())
        .and(gate.clone())
        .map(|_: Option<Session>| {
            warp::reply::json(&json!({ "app": "coin_tracker", "login": "/auth/login" }))
        });

    let login_page = warp::path!("auth" / "login")
        .and(warp::get())
        .and(gate)
        .map(|_: Option<Session>| {
            warp::reply::json(&json!({ "fields": ["email", "password"], "method": "POST" }))
        });

    let login = warp::path!("auth" / "login")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_identity(state.identity.clone()))
        .and(with_paths(state.paths.clone()))
        .and_then(login_handler);

    let logout = warp::path!("auth" / "logout")
        .and(warp::post())
        .and(gate::session_tokens())
        .and(with_identity(state.identity.clone()))
        .and(with_paths(state.paths.clone()))
        .and_then(logout_handler);

    let forgot = warp::path!("auth" / "forgot-password")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_identity(state.identity.clone()))
        .and(with_redirect(state.reset_redirect.clone()))
        .and_then(forgot_password_handler);

    let coins = warp::path!("api" / "coins")
        .and(warp::get())
        .and(with_market(state.market.clone()))
        .and_then(coins_handler);

    let portfolio = warp::path!("portfolio")
        .and(warp::get())
        .and(user.clone())
        .and(with_store(state.store.clone()))
        .and(with_market(state.market.clone()))
        .and_then(portfolio_handler);

    let list = warp::path!("portfolio" / "holdings")
        .and(warp::get())
        .and(user.clone())
        .and(with_store(state.store.clone()))
        .and_then(list_holdings_handler);

    let add = warp::path!("portfolio" / "holdings")
        .and(warp::post())
        .and(user.clone())
        .and(warp::body::json())
        .and(with_store(state.store.clone()))
        .and_then(add_holding_handler);

    let update = warp::path!("portfolio" / "holdings" / String)
        .and(warp::put())
        .and(user.clone())
        .and(warp::body::json())
        .and(with_store(state.store.clone()))
        .and_then(update_holding_handler);

    let delete = warp::path!("portfolio" / "holdings" / String)
        .and(warp::delete())
        .and(user.clone())
        .and(with_store(state.store.clone()))
        .and_then(delete_holding_handler);

    // Unknown pages under the protected prefix still go through the gate.
    let protected_fallback = warp::path("portfolio")
        .and(user)
        .and_then(|_: Session| async { Err::<StatusCode, Rejection>(warp::reject::not_found()) });

    home.or(login_page)
        .or(login)
        .or(logout)
        .or(forgot)
        .or(coins)
        .or(portfolio)
        .or(list)
        .or(add)
        .or(update)
        .or(delete)
        .or(protected_fallback)
        .recover(handle_rejection)
        .with(warp::log("coin_tracker"))
}

fn with_store(
    store: Arc<dyn HoldingStore>,
) -> impl Filter<Extract = (Arc<dyn HoldingStore>,), Error = Infallible> + Clone {
    warp::any().map(move || store.clone())
}

fn with_identity(
    identity: Arc<IdentityClient>,
) -> impl Filter<Extract = (Arc<IdentityClient>,), Error = Infallible> + Clone {
    warp::any().map(move || identity.clone())
}

fn with_market(
    market: Arc<SnapshotCache>,
) -> impl Filter<Extract = (Arc<SnapshotCache>,), Error = Infallible> + Clone {
    warp::any().map(move || market.clone())
}

fn with_paths(
    paths: Arc<GatePaths>,
) -> impl Filter<Extract = (Arc<GatePaths>,), Error = Infallible> + Clone {
    warp::any().map(move || paths.clone())
}

fn with_redirect(
    redirect: Arc<String>,
) -> impl Filter<Extract = (Arc<String>,), Error = Infallible> + Clone {
    warp::any().map(move || redirect.clone())
}

/// Appends one `Set-Cookie` header per cookie.
fn with_cookies(reply: impl Reply, cookies: &[String]) -> Response {
    let mut res = reply.into_response();
    for cookie in cookies {
        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                res.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => error!("Dropping malformed cookie: {}", e),
        }
    }
    res
}

fn reject(context: &str, err: AppError) -> Rejection {
    error!("{}: {}", context, err);
    warp::reject::custom(err)
}

async fn login_handler(
    form: LoginForm,
    identity: Arc<IdentityClient>,
    paths: Arc<GatePaths>,
) -> Result<Response, Rejection> {
    match identity.sign_in(&form.email, &form.password).await {
        Ok(signed_in) => {
            let cookie = format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
                SESSION_COOKIE, signed_in.access_token, signed_in.expires_in
            );
            let refresh = format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax",
                REFRESH_COOKIE, signed_in.refresh_token
            );
            let body = json!({ "user_id": signed_in.user_id, "redirect_to": paths.landing });
            Ok(with_cookies(warp::reply::json(&body), &[cookie, refresh]))
        }
        Err(e) => Err(reject("Sign in failed", e)),
    }
}

async fn logout_handler(
    tokens: Vec<String>,
    identity: Arc<IdentityClient>,
    paths: Arc<GatePaths>,
) -> Result<Response, Rejection> {
    if let Some(token) = tokens.first() {
        if let Err(e) = identity.sign_out(token).await {
            warn!("Provider sign out failed, clearing cookie anyway: {}", e);
        }
    }
    let clear = |name: &str| format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", name);
    let body = json!({ "redirect_to": paths.login });
    Ok(with_cookies(
        warp::reply::json(&body),
        &[clear(SESSION_COOKIE), clear(REFRESH_COOKIE)],
    ))
}

async fn forgot_password_handler(
    form: ResetForm,
    identity: Arc<IdentityClient>,
    redirect: Arc<String>,
) -> Result<impl Reply, Rejection> {
    match identity.request_password_reset(&form.email, &redirect).await {
        Ok(()) => Ok(warp::reply::json(
            &json!({ "message": "Check your email for the reset link" }),
        )),
        Err(e) => Err(reject("Password reset request failed", e)),
    }
}

async fn coins_handler(market: Arc<SnapshotCache>) -> Result<impl Reply, Rejection> {
    match market.get().await {
        Ok(quotes) => Ok(warp::reply::json(&*quotes)),
        Err(e) => Err(reject("Failed to fetch coins", e)),
    }
}

async fn portfolio_handler(
    session: Session,
    store: Arc<dyn HoldingStore>,
    market: Arc<SnapshotCache>,
) -> Result<impl Reply, Rejection> {
    let holdings = store
        .list(&session)
        .await
        .map_err(|e| reject("Failed to load holdings", e))?;
    let quotes = match market.get().await {
        Ok(quotes) => Some(quotes),
        Err(e) => {
            warn!("Market snapshot unavailable, showing purchase prices: {}", e);
            None
        }
    };
    let view = reconcile::portfolio(&holdings, quotes.as_ref().map(|q| q.as_slice()), Utc::now());
    info!(
        "Portfolio for {} valued at {} across {} holdings",
        session.user_id,
        view.total_value,
        view.holdings.len()
    );
    Ok(warp::reply::json(&view))
}

async fn list_holdings_handler(
    session: Session,
    store: Arc<dyn HoldingStore>,
) -> Result<impl Reply, Rejection> {
    match store.list(&session).await {
        Ok(holdings) => Ok(warp::reply::json(&holdings)),
        Err(e) => Err(reject("Failed to list holdings", e)),
    }
}

async fn add_holding_handler(
    session: Session,
    draft: HoldingDraft,
    store: Arc<dyn HoldingStore>,
) -> Result<impl Reply, Rejection> {
    let holding = draft.validate().map_err(warp::reject::custom)?;
    match store.insert(&session, holding).await {
        Ok(created) => {
            info!("Holding {} added for {}", created.id, session.user_id);
            Ok(warp::reply::with_status(
                warp::reply::json(&created),
                StatusCode::CREATED,
            ))
        }
        Err(e) => Err(reject("Failed to add holding", e)),
    }
}

async fn update_holding_handler(
    id: String,
    session: Session,
    patch: HoldingPatch,
    store: Arc<dyn HoldingStore>,
) -> Result<impl Reply, Rejection> {
    let changes = patch.validate().map_err(warp::reject::custom)?;
    match store.update(&session, &id, changes).await {
        Ok(updated) => {
            info!("Holding {} updated.", id);
            Ok(warp::reply::json(&updated))
        }
        Err(e) => Err(reject("Failed to update holding", e)),
    }
}

async fn delete_holding_handler(
    id: String,
    session: Session,
    store: Arc<dyn HoldingStore>,
) -> Result<impl Reply, Rejection> {
    match store.delete(&session, &id).await {
        Ok(()) => {
            info!("Holding {} deleted.", id);
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => Err(reject("Failed to delete holding", e)),
    }
}

pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    if let Some(redirect) = err.find::<Redirect>() {
        let reply = warp::reply::with_header(
            StatusCode::TEMPORARY_REDIRECT,
            "location",
            redirect.location.as_str(),
        );
        return Ok(reply.into_response());
    }

    let (status, message) = if let Some(e) = err.find::<AppError>() {
        (e.status(), e.public_message())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };

    let body = warp::reply::json(&ErrorBody { error: message });
    Ok(warp::reply::with_status(body, status).into_response())
}
