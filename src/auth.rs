// src/auth.rs
use crate::error::{AppError, Result};
use jsonwebtoken::{decode, DecodingKey, Validation};
use log::{info, warn};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Cookie carrying the provider's access token.
pub const SESSION_COOKIE: &str = "sb-access-token";

/// An authenticated caller as seen by the rest of the service.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
    user: UserResponse,
}

/// Error bodies differ between provider endpoints.
#[derive(Debug, Default, Deserialize)]
struct ProviderError {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignedIn {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub user_id: String,
}

/// Client for the hosted identity provider. Built once at startup from the
/// project url and anon key.
pub struct IdentityClient {
    http: Client,
    base_url: String,
    anon_key: String,
    jwt_secret: Option<Vec<u8>>,
}

impl IdentityClient {
    /// With a JWT secret, session tokens are verified locally instead of
    /// asking the provider on every request.
    pub fn new(http: Client, base_url: &str, anon_key: &str, jwt_secret: Option<String>) -> Self {
        IdentityClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            jwt_secret: jwt_secret.map(String::into_bytes),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignedIn> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AppError::Auth("email and password are required".to_string()));
        }
        let response = self
            .http
            .post(&self.endpoint("token"))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email.trim(), "password": password }))
            .send()
            .await?;
        if !response.status().is_success() {
            let message = provider_message(response, "invalid login credentials").await;
            return Err(AppError::Auth(message));
        }
        let token: TokenResponse = response.json().await?;
        info!("User {} signed in", token.user.id);
        Ok(SignedIn {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
            user_id: token.user.id,
        })
    }

    pub async fn sign_out(&self, access_token: &str) -> Result<()> {
        let response = self
            .http
            .post(&self.endpoint("logout"))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(AppError::Upstream(format!("sign out failed: HTTP {}", status)));
        }
        Ok(())
    }

    /// Resolves a token to a session. Any failure means "no session".
    pub async fn lookup_session(&self, access_token: &str) -> Result<Session> {
        let user_id = match &self.jwt_secret {
            Some(secret) => verify_token(secret, access_token)?,
            None => self.fetch_user(access_token).await?,
        };
        Ok(Session {
            user_id,
            access_token: access_token.to_string(),
        })
    }

    async fn fetch_user(&self, access_token: &str) -> Result<String> {
        let response = self
            .http
            .get(&self.endpoint("user"))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::Unauthenticated);
        }
        let user: UserResponse = response.json().await?;
        Ok(user.id)
    }

    pub async fn request_password_reset(&self, email: &str, redirect_to: &str) -> Result<()> {
        if email.trim().is_empty() {
            return Err(AppError::Validation("email is required".to_string()));
        }
        let response = self
            .http
            .post(&self.endpoint("recover"))
            .query(&[("redirect_to", redirect_to)])
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email.trim() }))
            .send()
            .await?;
        if !response.status().is_success() {
            let message = provider_message(response, "could not send reset email").await;
            return Err(AppError::Auth(message));
        }
        info!("Password reset requested");
        Ok(())
    }
}

fn verify_token(secret: &[u8], token: &str) -> Result<String> {
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &Validation::default())
        .map_err(|e| {
            warn!("Rejected session token: {}", e);
            AppError::Unauthenticated
        })?;
    Ok(data.claims.sub)
}

async fn provider_message(response: Response, fallback: &str) -> String {
    let body: ProviderError = response.json().await.unwrap_or_default();
    body.error_description
        .or(body.msg)
        .or(body.message)
        .unwrap_or_else(|| fallback.to_string())
}


#[cfg(test)]
mod tests {
    use super::test_support::{token_for, SECRET};
    use super::*;
    use crate::test_upstream::{Recorded, Upstream};
    use serde_json::Value;

    fn client() -> IdentityClient {
        IdentityClient::new(
            Client::new(),
            "http://127.0.0.1:9/",
            "anon",
            Some(SECRET.to_string()),
        )
    }

    #[tokio::test]
    async fn valid_token_resolves_to_its_subject() {
        let token = token_for("user-42", 3600);
        let session = client().lookup_session(&token).await.unwrap();
        assert_eq!(session.user_id, "user-42");
        assert_eq!(session.access_token, token);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let token = token_for("user-42", -3600);
        let err = client().lookup_session(&token).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated));
    }

    #[tokio::test]
    async fn token_signed_with_another_secret_is_rejected() {
        let other = IdentityClient::new(Client::new(), "http://127.0.0.1:9", "anon", Some("other".into()));
        let token = token_for("user-42", 3600);
        assert!(other.lookup_session(&token).await.is_err());
        assert!(client().lookup_session("not-a-jwt").await.is_err());
    }

    #[tokio::test]
    async fn sign_in_requires_credentials() {
        let err = client().sign_in("  ", "pw").await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        assert_eq!(client().endpoint("user"), "http://127.0.0.1:9/auth/v1/user");
    }

    /// Provider that knows one password and one access token.
    fn provider(req: &Recorded) -> (u16, Value) {
        match req.path.as_str() {
            "/auth/v1/token" if req.body["password"] == "hunter2" => (
                200,
                json!({ "access_token": "good", "refresh_token": "refresh",
                        "expires_in": 3600, "user": { "id": "user-7" } }),
            ),
            "/auth/v1/token" => (
                400,
                json!({ "error": "invalid_grant", "error_description": "Invalid login credentials" }),
            ),
            "/auth/v1/user" if req.header("authorization") == Some("Bearer good") => {
                (200, json!({ "id": "user-7" }))
            }
            "/auth/v1/user" => (401, json!({ "msg": "invalid JWT" })),
            "/auth/v1/recover" => (200, json!({})),
            _ => (404, json!({})),
        }
    }

    fn remote(upstream: &Upstream) -> IdentityClient {
        IdentityClient::new(Client::new(), &upstream.url, "anon", None)
    }

    #[tokio::test]
    async fn sign_in_exchanges_password_for_tokens() {
        let upstream = Upstream::start(provider);
        let signed_in = remote(&upstream)
            .sign_in(" ana@example.com ", "hunter2")
            .await
            .unwrap();
        assert_eq!(signed_in.user_id, "user-7");
        assert_eq!(signed_in.access_token, "good");
        assert_eq!(signed_in.refresh_token, "refresh");
        assert_eq!(signed_in.expires_in, 3600);

        let req = upstream.single();
        assert_eq!(req.method.as_str(), "POST");
        assert_eq!(req.query("grant_type"), Some("password"));
        assert_eq!(req.header("apikey"), Some("anon"));
        assert_eq!(req.body["email"], "ana@example.com");
    }

    #[tokio::test]
    async fn sign_in_reports_the_provider_message() {
        let upstream = Upstream::start(provider);
        let err = remote(&upstream)
            .sign_in("ana@example.com", "wrong")
            .await
            .unwrap_err();
        match err {
            AppError::Auth(message) => assert_eq!(message, "Invalid login credentials"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn without_a_secret_the_provider_resolves_sessions() {
        let upstream = Upstream::start(provider);
        let identity = remote(&upstream);

        let session = identity.lookup_session("good").await.unwrap();
        assert_eq!(session.user_id, "user-7");
        let err = identity.lookup_session("revoked").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated));

        let requests = upstream.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.path == "/auth/v1/user"));
        assert_eq!(requests[0].header("apikey"), Some("anon"));
        assert_eq!(requests[1].header("authorization"), Some("Bearer revoked"));
    }

    #[tokio::test]
    async fn password_reset_carries_the_redirect_target() {
        let upstream = Upstream::start(provider);
        remote(&upstream)
            .request_password_reset("ana@example.com", "https://app.example/auth/reset-password")
            .await
            .unwrap();

        let req = upstream.single();
        assert_eq!(req.method.as_str(), "POST");
        assert_eq!(req.path, "/auth/v1/recover");
        assert_eq!(
            req.query("redirect_to"),
            Some("https://app.example/auth/reset-password")
        );
        assert_eq!(req.body["email"], "ana@example.com");
    }
}
