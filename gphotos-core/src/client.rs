use std::future::{Future, ready};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use url::Url;

use crate::auth::{AuthError, TokenClient};
use crate::delta::{DeltaPage, decode_page};
use crate::media::{ContentHash, UploadProfile};
use crate::retry::{RetryDecision, RetryPolicy};

const DEFAULT_BASE_URL: &str = "https://photosdata-pa.googleapis.com";
const USER_AGENT: &str = "com.google.android.apps.photos/49029607 (Linux; U; Android 9; en_US; Pixel XL; Build/PQ2A.190205.001; Cronet/127.0.6510.5) (gzip)";
const UPLOAD_ID_HEADER: &str = "X-GUploader-UploadID";
const DEVICE_MAKE: &str = "Google";
/// Trash and restore requests accept at most this many dedup keys.
pub const DEDUP_BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum PhotosError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential error: {0}")]
    Auth(#[from] AuthError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("upload token missing from response headers")]
    MissingUploadId,
    #[error("upload rejected by api: {0}")]
    UploadRejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Transient,
    Permanent,
}

impl PhotosError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            PhotosError::Api { status, .. } => Some(classify_api_status(*status)),
            PhotosError::UploadRejected(_) => Some(ApiErrorClass::Permanent),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PhotosError::Request(_) => true,
            other => matches!(other.classification(), Some(ApiErrorClass::Transient)),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status.is_server_error() {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Opaque body returned by the byte upload, echoed back on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadReceipt(pub serde_json::Value);

#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub receipt: UploadReceipt,
    pub file_name: String,
    pub hash: ContentHash,
    /// Last-modified time of the source file, unix seconds.
    pub modified_at: i64,
    pub profile: UploadProfile,
}

/// Gateway to the remote photo library.
///
/// Every call runs through [`RetryPolicy`]; the bearer credential lives in a
/// cell shared by clones of the client and is only replaced on the call path.
#[derive(Clone)]
pub struct PhotosClient {
    http: Client,
    base_url: Url,
    tokens: TokenClient,
    credential: Arc<Mutex<Option<String>>>,
    retry: RetryPolicy,
}

impl PhotosClient {
    pub fn new(tokens: TokenClient) -> Result<Self, PhotosError> {
        Self::with_base_url(DEFAULT_BASE_URL, tokens)
    }

    pub fn with_base_url(base_url: &str, tokens: TokenClient) -> Result<Self, PhotosError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            tokens,
            credential: Arc::new(Mutex::new(None)),
            retry: RetryPolicy::default(),
        })
    }

    /// Seeds the credential cell so the first call skips token acquisition.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.credential = Arc::new(Mutex::new(Some(token.into())));
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn identity(&self) -> &str {
        self.tokens.identity()
    }

    pub async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<String>, PhotosError> {
        let url = self.endpoint("/v1/media:findByHash")?;
        let body = FindByHashRequest {
            sha1: hash.to_base64(),
        };
        let response = self
            .execute(|token| self.post_json(&url, token, &body))
            .await?;
        let payload: MediaKeyResponse = Self::handle_response(response).await?;
        Ok(payload.media_key.filter(|key| !key.is_empty()))
    }

    pub async fn get_upload_token(
        &self,
        hash: &ContentHash,
        size: u64,
    ) -> Result<String, PhotosError> {
        let url = self.endpoint("/v1/uploads")?;
        let body = UploadTokenRequest {
            sha1: hash.to_base64(),
            size,
        };
        let goog_hash = format!("sha1={}", hash.to_base64());
        let response = self
            .execute(|token| {
                self.post_json(&url, token, &body)
                    .header("X-Goog-Hash", &goog_hash)
                    .header("X-Upload-Content-Length", size.to_string())
            })
            .await?;
        let response = Self::check_status(response).await?;
        response
            .headers()
            .get(UPLOAD_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or(PhotosError::MissingUploadId)
    }

    /// Streams `source` under `upload_token`. The file is reopened for every
    /// attempt so an auth retry resends the full body.
    pub async fn upload_file(
        &self,
        upload_token: &str,
        source: &Path,
    ) -> Result<UploadReceipt, PhotosError> {
        let mut url = self.endpoint("/v1/uploads")?;
        url.query_pairs_mut().append_pair("upload_id", upload_token);
        let source: PathBuf = source.to_path_buf();
        let response = self
            .execute_with(|token| {
                let request = self.http.put(url.clone()).bearer_auth(token);
                let source = source.clone();
                async move {
                    let file = tokio::fs::File::open(&source).await?;
                    let length = file.metadata().await?.len();
                    Ok::<_, PhotosError>(
                        request
                            .header(reqwest::header::USER_AGENT, USER_AGENT)
                            .header(reqwest::header::CONTENT_LENGTH, length)
                            .body(reqwest::Body::wrap_stream(ReaderStream::new(file))),
                    )
                }
            })
            .await?;
        Self::handle_response(response).await
    }

    pub async fn commit_upload(&self, request: &CommitRequest) -> Result<String, PhotosError> {
        let url = self.endpoint("/v1/media:commit")?;
        let body = CommitBody {
            upload: &request.receipt,
            file_name: &request.file_name,
            sha1: request.hash.to_base64(),
            timestamp: CommitTimestamp {
                seconds: request.modified_at,
            },
            quality: request.profile.quality(),
            make: DEVICE_MAKE,
            model: request.profile.model(),
        };
        let response = self
            .execute(|token| self.post_json(&url, token, &body))
            .await?;
        let payload: MediaKeyResponse = Self::handle_response(response).await?;
        payload
            .media_key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| PhotosError::UploadRejected(request.file_name.clone()))
    }

    /// Top-level delta fetch. An empty `state_token` asks for the full library.
    pub async fn get_library_state(&self, state_token: &str) -> Result<DeltaPage, PhotosError> {
        let body = LibraryRequest {
            state_token: Some(state_token),
            page_token: None,
        };
        self.fetch_delta("/v1/library:state", &body).await
    }

    /// Continuation of the initial full download.
    pub async fn get_library_page_init(&self, page_token: &str) -> Result<DeltaPage, PhotosError> {
        let body = LibraryRequest {
            state_token: None,
            page_token: Some(page_token),
        };
        self.fetch_delta("/v1/library:pageInit", &body).await
    }

    /// Continuation of a delta fetch that was issued with `state_token`.
    pub async fn get_library_page(
        &self,
        page_token: &str,
        state_token: &str,
    ) -> Result<DeltaPage, PhotosError> {
        let body = LibraryRequest {
            state_token: Some(state_token),
            page_token: Some(page_token),
        };
        self.fetch_delta("/v1/library:page", &body).await
    }

    pub async fn move_to_trash(&self, dedup_keys: &[String]) -> Result<(), PhotosError> {
        self.batch_dedup_call("/v1/media:trash", dedup_keys).await
    }

    pub async fn restore_from_trash(&self, dedup_keys: &[String]) -> Result<(), PhotosError> {
        self.batch_dedup_call("/v1/media:restore", dedup_keys).await
    }

    async fn batch_dedup_call(&self, path: &str, dedup_keys: &[String]) -> Result<(), PhotosError> {
        let url = self.endpoint(path)?;
        for batch in dedup_keys.chunks(DEDUP_BATCH_SIZE) {
            let body = DedupKeysRequest { dedup_keys: batch };
            let response = self
                .execute(|token| self.post_json(&url, token, &body))
                .await?;
            Self::check_status(response).await?;
            debug!(path, count = batch.len(), "dedup key batch accepted");
        }
        Ok(())
    }

    async fn fetch_delta(
        &self,
        path: &str,
        body: &LibraryRequest<'_>,
    ) -> Result<DeltaPage, PhotosError> {
        let url = self.endpoint(path)?;
        let response = self
            .execute(|token| self.post_json(&url, token, body))
            .await?;
        let response = Self::check_status(response).await?;
        let bytes = response.bytes().await?;
        decode_page(&bytes)
    }

    fn post_json<T: Serialize + ?Sized>(&self, url: &Url, token: String, body: &T) -> RequestBuilder {
        self.http
            .post(url.clone())
            .bearer_auth(token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(body)
    }

    async fn execute<F>(&self, mut build: F) -> Result<Response, PhotosError>
    where
        F: FnMut(String) -> RequestBuilder,
    {
        self.execute_with(|token| ready(Ok(build(token)))).await
    }

    async fn execute_with<F, Fut>(&self, mut build: F) -> Result<Response, PhotosError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<RequestBuilder, PhotosError>>,
    {
        let mut attempt = 0u32;
        let mut refreshes = 0u32;
        loop {
            attempt += 1;
            let token = self.current_token().await?;
            let response = build(token.clone()).await?.send().await?;
            let status = response.status();
            match self.retry.decide(status, attempt, refreshes) {
                RetryDecision::Return => return Ok(response),
                RetryDecision::RefreshAuth => {
                    warn!(%status, attempt, "credential rejected, forcing refresh");
                    refreshes += 1;
                    self.refresh_token(&token).await?;
                }
                RetryDecision::RetryAfter(delay) => {
                    warn!(%status, attempt, ?delay, "server error, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn current_token(&self) -> Result<String, PhotosError> {
        let mut credential = self.credential.lock().await;
        if let Some(token) = credential.as_ref() {
            return Ok(token.clone());
        }
        let token = self.tokens.fetch_token(false).await?;
        *credential = Some(token.clone());
        Ok(token)
    }

    async fn refresh_token(&self, rejected: &str) -> Result<(), PhotosError> {
        let mut credential = self.credential.lock().await;
        // Another caller already replaced the rejected token.
        if credential.as_deref().is_some_and(|current| current != rejected) {
            return Ok(());
        }
        let token = self.tokens.fetch_token(true).await?;
        *credential = Some(token);
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url, PhotosError> {
        Ok(self.base_url.join(path)?)
    }

    async fn check_status(response: Response) -> Result<Response, PhotosError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(PhotosError::Api { status, body })
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, PhotosError> {
        let response = Self::check_status(response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| PhotosError::Decode(err.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct FindByHashRequest {
    sha1: String,
}

#[derive(Debug, Serialize)]
struct UploadTokenRequest {
    sha1: String,
    size: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaKeyResponse {
    #[serde(default)]
    media_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitBody<'a> {
    upload: &'a UploadReceipt,
    file_name: &'a str,
    sha1: String,
    timestamp: CommitTimestamp,
    quality: &'static str,
    make: &'static str,
    model: &'static str,
}

#[derive(Debug, Serialize)]
struct CommitTimestamp {
    seconds: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LibraryRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    state_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DedupKeysRequest<'a> {
    dedup_keys: &'a [String],
}
