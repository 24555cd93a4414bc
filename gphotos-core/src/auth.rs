use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("token service url cannot carry path segments")]
    UnsupportedBaseUrl,
    #[error("token service returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("token service response has no token")]
    MissingToken,
}

/// Client for the credential service that mints bearer tokens per identity.
#[derive(Clone)]
pub struct TokenClient {
    http: Client,
    base_url: Url,
    identity: String,
}

impl TokenClient {
    pub fn new(identity: impl Into<String>) -> Result<Self, AuthError> {
        Self::with_base_url(DEFAULT_BASE_URL, identity)
    }

    pub fn with_base_url(base_url: &str, identity: impl Into<String>) -> Result<Self, AuthError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            identity: identity.into(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// `force` asks the service to mint a fresh token instead of a cached one.
    pub async fn fetch_token(&self, force: bool) -> Result<String, AuthError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AuthError::UnsupportedBaseUrl)?
            .pop_if_empty()
            .push("token")
            .push(&self.identity);
        if force {
            url.query_pairs_mut().append_pair("force", "true");
        }

        let response = self.http.post(url).send().await?;
        if response.status().is_success() {
            let payload: TokenResponse = response.json().await?;
            payload
                .token
                .filter(|token| !token.is_empty())
                .ok_or(AuthError::MissingToken)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AuthError::Api { status, body })
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
}
