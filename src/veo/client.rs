//! VeoClient - handles communication with the Veo video generation API.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::frame::FrameReference;

/// The environment variable name for the Gemini API key.
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Default base URL for the generative language API.
pub const VEO_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model for video generation.
pub const DEFAULT_MODEL: &str = "veo-3.1-fast-generate-preview";

/// Built-in instruction sent with every cleaning request. Extra user text is
/// appended to this, never substituted for it.
pub const DEFAULT_PROMPT: &str = "Professionally remove all text, watermarks, subtitles, and \
    overlays from this video. Regenerate the underlying scene with high visual consistency \
    and no artifacts.";

/// Default timeout for individual HTTP requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connection timeout (10 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default polling interval for operation status checks (8 seconds).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(8);

/// Default ceiling for an entire generation attempt (10 minutes).
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Upstream message fragment indicating the supplied key is not authorized
/// for the requested model. Only consulted when the error body carries no
/// structured status.
const ENTITY_NOT_FOUND_MARKER: &str = "Requested entity was not found";

/// Aspect ratio of the generated video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    /// 16:9 landscape output.
    Landscape,
    /// 9:16 portrait output.
    Portrait,
}

impl AspectRatio {
    /// Wire representation expected by the generation service.
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
        }
    }

    /// Parse from the wire representation. Returns None for unknown values.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "16:9" => Some(AspectRatio::Landscape),
            "9:16" => Some(AspectRatio::Portrait),
            _ => None,
        }
    }
}

/// Output resolution of the generated video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    P720,
    P1080,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "720p" => Some(Resolution::P720),
            "1080p" => Some(Resolution::P1080),
            _ => None,
        }
    }
}

/// One generation attempt's parameters. Immutable once constructed; a fresh
/// request is built for every attempt.
#[derive(Debug)]
pub struct GenerationRequest {
    frame: FrameReference,
    prompt: String,
    aspect_ratio: AspectRatio,
    resolution: Resolution,
}

impl GenerationRequest {
    pub fn new(
        frame: FrameReference,
        prompt: String,
        aspect_ratio: AspectRatio,
        resolution: Resolution,
    ) -> Self {
        Self {
            frame,
            prompt,
            aspect_ratio,
            resolution,
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn aspect_ratio(&self) -> AspectRatio {
        self.aspect_ratio
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }
}

/// Request body for the predictLongRunning endpoint.
#[derive(Debug, Serialize)]
struct PredictRequest {
    instances: Vec<Instance>,
    parameters: Parameters,
}

#[derive(Debug, Serialize)]
struct Instance {
    prompt: String,
    image: InlineImage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineImage {
    bytes_base64_encoded: String,
    mime_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Parameters {
    aspect_ratio: &'static str,
    resolution: &'static str,
    sample_count: u32,
}

/// Snapshot of a long-running generation operation, as returned by the
/// service. Polling always replaces the whole snapshot, never merges fields.
#[derive(Debug, Clone, Deserialize)]
pub struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    response: Option<OperationResponse>,
    #[serde(default)]
    error: Option<StatusDetail>,
}

impl Operation {
    /// Opaque handle used to refresh this operation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the operation has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Result locator of a terminal operation, if the service returned one.
    pub fn result_uri(&self) -> Option<&str> {
        self.response
            .as_ref()?
            .generated_videos
            .first()?
            .video
            .as_ref()
            .map(|v| v.uri.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResponse {
    #[serde(default)]
    generated_videos: Vec<GeneratedVideo>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeneratedVideo {
    #[serde(default)]
    video: Option<VideoRef>,
}

#[derive(Debug, Clone, Deserialize)]
struct VideoRef {
    uri: String,
}

/// Structured error payload: `{ "error": { code, message, status } }`.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: StatusDetail,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StatusDetail {
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Cancellation token for an in-flight generation attempt.
///
/// Cloning shares the underlying flag, so a Ctrl+C handler can cancel a poll
/// loop running elsewhere.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Install a Ctrl+C handler that cancels the given token.
pub fn setup_ctrlc_handler(token: CancelToken) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        token.cancel();
        eprintln!("\nReceived Ctrl+C, cancelling generation...");
    })
}

/// Client for communicating with the Veo generation API.
pub struct VeoClient {
    api_key: String,
    base_url: String,
    model: String,
    poll_interval: Duration,
    http_client: reqwest::Client,
}

impl VeoClient {
    /// Create a new VeoClient by reading the API key from the environment.
    ///
    /// # Errors
    ///
    /// Returns `VeoError::MissingApiKey` if the `GEMINI_API_KEY` environment
    /// variable is not set.
    pub fn new() -> Result<Self, VeoError> {
        let api_key = std::env::var(GEMINI_API_KEY_ENV).map_err(|_| VeoError::MissingApiKey)?;
        Self::with_api_key(api_key)
    }

    /// Create a new VeoClient with an explicit API key.
    pub fn with_api_key(api_key: String) -> Result<Self, VeoError> {
        if api_key.trim().is_empty() {
            return Err(VeoError::MissingApiKey);
        }

        let http_client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            api_key,
            base_url: VEO_API_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            http_client,
        })
    }

    /// Create a new VeoClient with a custom base URL.
    ///
    /// Useful for testing against a mock server.
    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self, VeoError> {
        let mut client = Self::with_api_key(api_key)?;
        client.base_url = base_url;
        Ok(client)
    }

    /// Create a new VeoClient with a custom generation model.
    pub fn with_model(api_key: String, model: String) -> Result<Self, VeoError> {
        let mut client = Self::with_api_key(api_key)?;
        client.model = model;
        Ok(client)
    }

    /// Override the generation model.
    pub fn set_model(&mut self, model: String) {
        self.model = model;
    }

    /// Override the API base URL.
    pub fn set_base_url(&mut self, base_url: String) {
        self.base_url = base_url;
    }

    /// Override the polling interval. Intervals below one millisecond are
    /// clamped up to keep the loop from spinning.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval.max(Duration::from_millis(1));
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Submit a generation request, receiving the initial operation snapshot.
    ///
    /// # Errors
    ///
    /// Returns `VeoError::AuthRequired` if the service rejects the key for
    /// permission/billing reasons, `VeoError::ApiError` for other upstream
    /// errors, or `VeoError::HttpError` if the request itself fails.
    pub async fn submit(&self, request: &GenerationRequest) -> Result<Operation, VeoError> {
        let url = format!(
            "{}/models/{}:predictLongRunning",
            self.base_url, self.model
        );

        let body = PredictRequest {
            instances: vec![Instance {
                prompt: request.prompt.clone(),
                image: InlineImage {
                    bytes_base64_encoded: request.frame.base64_payload(),
                    mime_type: request.frame.mime_type.clone(),
                },
            }],
            parameters: Parameters {
                aspect_ratio: request.aspect_ratio.as_str(),
                resolution: request.resolution.as_str(),
                sample_count: 1,
            },
        };

        let response = self
            .http_client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let operation: Operation = response.json().await?;
        log::info!("Generation submitted, operation: {}", operation.name);
        Ok(operation)
    }

    /// Fetch a fresh snapshot of an in-flight operation.
    ///
    /// The returned snapshot fully replaces the one passed in. Refusing to
    /// refresh a terminal operation keeps the no-poll-after-done invariant
    /// visible at the API boundary.
    pub async fn refresh(&self, operation: &Operation) -> Result<Operation, VeoError> {
        if operation.done {
            return Err(VeoError::ApiError(
                "refusing to poll an operation that is already terminal".to_string(),
            ));
        }

        let url = format!("{}/{}", self.base_url, operation.name);

        let response = self
            .http_client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let operation: Operation = response.json().await?;
        Ok(operation)
    }

    /// Run one generation attempt end to end and write the result to `dest`.
    ///
    /// Submits the request, polls at the configured interval until the
    /// operation is terminal, then downloads the generated video. Never
    /// returns success before the operation reports done.
    pub async fn generate_to_file(
        &self,
        request: &GenerationRequest,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<PathBuf, VeoError> {
        self.generate_to_file_with_timeout(request, dest, cancel, DEFAULT_GENERATION_TIMEOUT)
            .await
    }

    /// Like `generate_to_file`, with a custom ceiling for the whole attempt.
    ///
    /// # Errors
    ///
    /// In addition to submit/refresh errors: `VeoError::Timeout` when the
    /// ceiling elapses before the operation is terminal,
    /// `VeoError::Cancelled` when the token fires, and `VeoError::NoResult`
    /// when a terminal operation carries no result locator.
    pub async fn generate_to_file_with_timeout(
        &self,
        request: &GenerationRequest,
        dest: &Path,
        cancel: &CancelToken,
        timeout: Duration,
    ) -> Result<PathBuf, VeoError> {
        use tokio::time::Instant;

        let mut operation = self.submit(request).await?;
        let start = Instant::now();

        while !operation.is_done() {
            if cancel.is_cancelled() {
                log::warn!("Generation cancelled while polling {}", operation.name);
                return Err(VeoError::Cancelled);
            }
            if start.elapsed() > timeout {
                log::error!("Generation timed out after {:?}", timeout);
                return Err(VeoError::Timeout);
            }

            tokio::time::sleep(self.poll_interval).await;

            if cancel.is_cancelled() {
                return Err(VeoError::Cancelled);
            }

            // Wholesale replacement of the snapshot; fields are never merged.
            operation = self.refresh(&operation).await?;
            log::debug!("Polled {}: done={}", operation.name, operation.done);
        }

        if let Some(detail) = &operation.error {
            return Err(classify_status_detail(detail));
        }

        let uri = operation.result_uri().ok_or(VeoError::NoResult)?;
        log::info!("Generation complete, downloading result");
        self.download_video(uri, dest).await
    }

    /// Download a generated video to disk, appending the API key as a query
    /// parameter as the result locator requires.
    ///
    /// Streams the body to disk without buffering the whole video in memory.
    pub async fn download_video(&self, uri: &str, dest: &Path) -> Result<PathBuf, VeoError> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let separator = if uri.contains('?') { '&' } else { '?' };
        let url = format!("{}{}key={}", uri, separator, self.api_key);

        let response = self.http_client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();

        use futures_util::StreamExt;
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result?;
            file.write_all(&chunk).await?;
        }

        file.flush().await?;

        Ok(dest.to_path_buf())
    }

    /// Turn a non-success HTTP response into a classified error.
    async fn error_from_response(response: reqwest::Response) -> VeoError {
        let http_status = response.status().as_u16();
        let body = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => return VeoError::HttpError(e),
        };
        classify_api_error(http_status, &body)
    }
}

/// Map an upstream error body to the three-way outcome the caller relies on:
/// auth-required, or a generic API error carrying the upstream message.
///
/// Structured classification is preferred: the JSON error payload's status
/// and code are checked first, and the legacy message substring only when no
/// structured payload is present.
fn classify_api_error(http_status: u16, body: &[u8]) -> VeoError {
    if let Ok(parsed) = serde_json::from_slice::<ApiErrorBody>(body) {
        return classify_status_detail(&parsed.error);
    }

    let text = String::from_utf8_lossy(body);
    if text.contains(ENTITY_NOT_FOUND_MARKER) {
        return VeoError::AuthRequired;
    }
    if http_status == 404 {
        return VeoError::AuthRequired;
    }

    VeoError::ApiError(format!(
        "request failed with status {}: {}",
        http_status,
        text.trim()
    ))
}

/// Classify a structured status detail, shared between HTTP error bodies and
/// operation-level terminal errors.
fn classify_status_detail(detail: &StatusDetail) -> VeoError {
    let message = detail.message.clone().unwrap_or_default();

    if detail.status.as_deref() == Some("NOT_FOUND")
        || detail.code == Some(404)
        || message.contains(ENTITY_NOT_FOUND_MARKER)
    {
        return VeoError::AuthRequired;
    }

    if message.is_empty() {
        VeoError::ApiError(format!(
            "service returned an error (status {:?}, code {:?})",
            detail.status, detail.code
        ))
    } else {
        VeoError::ApiError(message)
    }
}

/// Errors that can occur during Veo operations.
#[derive(Debug, thiserror::Error)]
pub enum VeoError {
    #[error("API key not configured")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("API error: {0}")]
    ApiError(String),

    /// The service rejected the key for permission/billing reasons. The
    /// caller converts this into a re-prompt rather than a terminal error.
    #[error("the service rejected the API key; select a key with billing enabled")]
    AuthRequired,

    #[error("generation completed but returned no result")]
    NoResult,

    #[error("generation timed out")]
    Timeout,

    #[error("generation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl VeoError {
    /// The message a user-facing error state should carry. Generic upstream
    /// failures pass their message through verbatim.
    pub fn user_message(&self) -> String {
        match self {
            VeoError::ApiError(message) => message.clone(),
            other => other.to_string(),
        }
    }
}
