// src/error.rs
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;

/// Every failure a request can end in. Nothing is retried: the error is
/// terminal for the current user action.
#[derive(Error, Debug)]
pub enum AppError {
    /// Market data provider failed or answered with something unusable.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The holdings store rejected or failed an operation.
    #[error("data store error: {0}")]
    Store(String),

    /// Identity provider refused the credentials or the request.
    #[error("{0}")]
    Auth(String),

    #[error("not authenticated")]
    Unauthenticated,

    /// Input did not survive parsing at the boundary.
    #[error("{0}")]
    Validation(String),

    #[error("holding {0} not found")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(_) | AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream(_) | AppError::Store(_) | AppError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show to the user. Upstream and store details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Upstream(_) => "failed to fetch market data".to_string(),
            AppError::Store(_) => "failed to access holdings".to_string(),
            AppError::Config(_) => "server misconfigured".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl Reject for AppError {}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
