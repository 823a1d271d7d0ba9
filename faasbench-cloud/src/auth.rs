//! Identity tokens for functions that require signed-in callers.
//!
//! GCP functions only accept requests carrying a Google-signed OIDC identity token for the
//! function URL. [`GcpIdentityTokens`] obtains one with the JWT bearer flow: it signs an assertion
//! with the service account key and exchanges it at the account's token endpoint. Tokens are valid
//! for about an hour.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode, get_current_timestamp};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Lifetime requested for signed assertions, in seconds.
const ASSERTION_LIFETIME: u64 = 3600;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Issues identity tokens accepted by a function URL.
#[async_trait]
pub trait IdentityTokenProvider: fmt::Debug + Send + Sync {
    /// Returns a raw identity token for calling `target_url`.
    async fn identity_token(&self, target_url: &str) -> Result<String, AuthError>;
}

/// The fields of a GCP service account key file used for signing.
#[derive(Deserialize)]
struct ServiceAccount {
    client_email: String,
    private_key: String,
    private_key_id: String,
    token_uri: String,
}

impl fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("client_email", &self.client_email)
            .field("private_key", &"[redacted]")
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    target_audience: String,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
}

/// Identity tokens signed with a GCP service account key file.
///
/// The key file is read on every request, so rotated keys are picked up without a restart.
#[derive(Debug)]
pub struct GcpIdentityTokens {
    credentials: PathBuf,
    client: reqwest::Client,
}

impl GcpIdentityTokens {
    /// Creates a provider for the service account JSON at `credentials`.
    pub fn new(credentials: impl Into<PathBuf>) -> Self {
        Self {
            credentials: credentials.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn credentials(&self) -> &Path {
        &self.credentials
    }

    fn read_account(&self) -> Result<ServiceAccount, AuthError> {
        let data = std::fs::read(&self.credentials).map_err(|source| AuthError::Read {
            path: self.credentials.clone(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(AuthError::Credentials)
    }
}

#[async_trait]
impl IdentityTokenProvider for GcpIdentityTokens {
    async fn identity_token(&self, target_url: &str) -> Result<String, AuthError> {
        let audience = audience(target_url)?;
        let account = self.read_account()?;
        let assertion = sign_assertion(&account, audience, get_current_timestamp())?;

        let response = self
            .client
            .post(&account.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| AuthError::Exchange {
                context: format!("request to {} failed", account.token_uri),
                source,
            })?;

        let token: TokenResponse = response.json().await.map_err(|source| AuthError::Exchange {
            context: "invalid token response".into(),
            source,
        })?;

        tracing::debug!(audience, "obtained identity token");
        token
            .id_token
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)
    }
}

/// Returns the token audience for a function URL: the URL without query and fragment.
fn audience(target_url: &str) -> Result<&str, AuthError> {
    reqwest::Url::parse(target_url).map_err(|err| AuthError::TargetUrl {
        url: target_url.to_owned(),
        reason: err.to_string(),
    })?;

    Ok(match target_url.find(['?', '#']) {
        Some(end) => &target_url[..end],
        None => target_url,
    })
}

fn sign_assertion(account: &ServiceAccount, audience: &str, now: u64) -> Result<String, AuthError> {
    let claims = AssertionClaims {
        iss: account.client_email.clone(),
        sub: account.client_email.clone(),
        aud: account.token_uri.clone(),
        target_audience: audience.to_owned(),
        iat: now,
        exp: now + ASSERTION_LIFETIME,
    };

    let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes()).map_err(AuthError::Sign)?;
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(account.private_key_id.clone());

    encode(&header, &claims, &key).map_err(AuthError::Sign)
}
