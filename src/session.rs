//! Session state machine and attempt orchestration.
//!
//! `SessionController` is a pure state machine over idle/processing/
//! completed/error; the async `run_*` functions are the thin effect layer
//! that drives frame extraction and generation and feeds outcomes back into
//! it. Rendering (CLI output here) happens outside, off the state values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame;
use crate::veo::{AspectRatio, CancelToken, GenerationRequest, Resolution, VeoClient, VeoError};

/// Message shown while a job is in flight.
pub const PROCESSING_MESSAGE: &str =
    "The AI is analyzing the video and removing text. This can take several minutes...";

/// Presentation state of one user session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Processing { message: String },
    Completed { output: PathBuf },
    Error { message: String },
}

/// Outcome of asking the controller to start an attempt.
#[derive(Debug, PartialEq)]
pub enum Begin {
    /// The attempt may proceed. `superseded` names a prior result the
    /// caller now owns and should release.
    Started { superseded: Option<PathBuf> },
    /// A job is already in flight; the request was ignored.
    InFlight,
}

/// State machine over one user session. At most one job is live at a time.
#[derive(Debug)]
pub struct SessionController {
    state: SessionState,
    auth_required: bool,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            auth_required: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Whether the last attempt ended in an authorization rejection that the
    /// credential prompt must resolve before a retry makes sense.
    pub fn auth_required(&self) -> bool {
        self.auth_required
    }

    /// Enter `Processing`, unless a job is already in flight.
    ///
    /// A prior completed result is discarded here; the path is handed back
    /// so the caller can release the underlying file.
    pub fn begin(&mut self, message: impl Into<String>) -> Begin {
        if matches!(self.state, SessionState::Processing { .. }) {
            log::warn!("Ignoring start request while a job is already in flight");
            return Begin::InFlight;
        }

        let superseded = match std::mem::replace(
            &mut self.state,
            SessionState::Processing {
                message: message.into(),
            },
        ) {
            SessionState::Completed { output } => Some(output),
            _ => None,
        };

        Begin::Started { superseded }
    }

    /// Success: the attempt produced a playable result.
    pub fn complete(&mut self, output: PathBuf) {
        self.state = SessionState::Completed { output };
        self.auth_required = false;
    }

    /// The upstream rejected the credential: back to idle with the auth
    /// flag raised, which drives the forced credential prompt.
    pub fn require_auth(&mut self) {
        self.state = SessionState::Idle;
        self.auth_required = true;
    }

    /// Any other failure becomes the error state, message carried verbatim.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = SessionState::Error {
            message: message.into(),
        };
    }

    /// User dismissed the error display.
    pub fn dismiss_error(&mut self) {
        if matches!(self.state, SessionState::Error { .. }) {
            self.state = SessionState::Idle;
        }
    }

    /// User reset the session. Returns a prior result path to release.
    pub fn reset(&mut self) -> Option<PathBuf> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Completed { output } => Some(output),
            _ => None,
        }
    }

    /// The credential prompt resolved; clear the auth flag.
    pub fn auth_resolved(&mut self) {
        self.auth_required = false;
    }
}

/// Parameters for one cleaning attempt.
#[derive(Debug, Clone)]
pub struct AttemptOptions {
    /// Full instruction text sent to the model.
    pub prompt: String,
    /// Forced aspect ratio; probed from the source when None.
    pub aspect_ratio: Option<AspectRatio>,
    pub resolution: Resolution,
    /// Ceiling for the whole generation attempt.
    pub timeout: Duration,
}

/// Run a full attempt: derive the reference frame, then generate.
///
/// Extraction failures surface as the error state; they never reach the
/// generation service.
pub async fn run_attempt(
    controller: &mut SessionController,
    client: &VeoClient,
    video: &Path,
    options: &AttemptOptions,
    dest: &Path,
    cancel: &CancelToken,
) {
    let superseded = match controller.begin(PROCESSING_MESSAGE) {
        Begin::Started { superseded } => superseded,
        Begin::InFlight => return,
    };
    release_superseded(superseded);

    let reference = match frame::extract_reference_frame(video).await {
        Ok(reference) => reference,
        Err(e) => {
            controller.fail(format!("Frame extraction failed: {}", e));
            return;
        }
    };

    let aspect_ratio = match options.aspect_ratio {
        Some(ratio) => ratio,
        None => frame::detect_aspect_ratio(video).await,
    };

    let request = GenerationRequest::new(
        reference,
        options.prompt.clone(),
        aspect_ratio,
        options.resolution,
    );

    drive_generation(controller, client, &request, dest, cancel, options.timeout).await;
}

/// Run the generation half of an attempt with an already-derived reference
/// frame. Exposed separately so the end-to-end path can be exercised
/// without a real video source.
pub async fn run_generation(
    controller: &mut SessionController,
    client: &VeoClient,
    request: &GenerationRequest,
    dest: &Path,
    cancel: &CancelToken,
    timeout: Duration,
) {
    let superseded = match controller.begin(PROCESSING_MESSAGE) {
        Begin::Started { superseded } => superseded,
        Begin::InFlight => return,
    };
    release_superseded(superseded);

    drive_generation(controller, client, request, dest, cancel, timeout).await;
}

async fn drive_generation(
    controller: &mut SessionController,
    client: &VeoClient,
    request: &GenerationRequest,
    dest: &Path,
    cancel: &CancelToken,
    timeout: Duration,
) {
    match client
        .generate_to_file_with_timeout(request, dest, cancel, timeout)
        .await
    {
        Ok(path) => controller.complete(path),
        Err(VeoError::AuthRequired) => controller.require_auth(),
        Err(e) => controller.fail(e.user_message()),
    }
}

/// Release a result file superseded by a new attempt. Best effort; a stale
/// file is not worth failing the new attempt over.
fn release_superseded(superseded: Option<PathBuf>) {
    if let Some(path) = superseded {
        log::info!("Releasing superseded result {:?}", path);
        if let Err(e) = std::fs::remove_file(&path) {
            log::warn!("Could not remove superseded result {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let controller = SessionController::new();
        assert_eq!(*controller.state(), SessionState::Idle);
        assert!(!controller.auth_required());
    }

    #[test]
    fn test_begin_from_idle() {
        let mut controller = SessionController::new();
        let begin = controller.begin("working");
        assert_eq!(begin, Begin::Started { superseded: None });
        assert_eq!(
            *controller.state(),
            SessionState::Processing {
                message: "working".to_string()
            }
        );
    }

    #[test]
    fn test_begin_while_processing_is_noop() {
        let mut controller = SessionController::new();
        controller.begin("first");
        assert_eq!(controller.begin("second"), Begin::InFlight);
        // The original message survives; nothing was replaced.
        assert_eq!(
            *controller.state(),
            SessionState::Processing {
                message: "first".to_string()
            }
        );
    }

    #[test]
    fn test_complete_clears_auth_flag() {
        let mut controller = SessionController::new();
        controller.begin("working");
        controller.require_auth();
        assert!(controller.auth_required());

        controller.begin("retry");
        controller.complete(PathBuf::from("/tmp/out.mp4"));
        assert!(!controller.auth_required());
        assert_eq!(
            *controller.state(),
            SessionState::Completed {
                output: PathBuf::from("/tmp/out.mp4")
            }
        );
    }

    #[test]
    fn test_require_auth_returns_to_idle() {
        let mut controller = SessionController::new();
        controller.begin("working");
        controller.require_auth();
        assert_eq!(*controller.state(), SessionState::Idle);
        assert!(controller.auth_required());
    }

    #[test]
    fn test_fail_carries_message() {
        let mut controller = SessionController::new();
        controller.begin("working");
        controller.fail("Network timeout");
        assert_eq!(
            *controller.state(),
            SessionState::Error {
                message: "Network timeout".to_string()
            }
        );
    }

    #[test]
    fn test_dismiss_error_returns_to_idle() {
        let mut controller = SessionController::new();
        controller.begin("working");
        controller.fail("boom");
        controller.dismiss_error();
        assert_eq!(*controller.state(), SessionState::Idle);
    }

    #[test]
    fn test_dismiss_error_only_applies_to_error_state() {
        let mut controller = SessionController::new();
        controller.begin("working");
        controller.dismiss_error();
        assert!(matches!(
            controller.state(),
            SessionState::Processing { .. }
        ));
    }

    #[test]
    fn test_begin_after_completed_supersedes_result() {
        let mut controller = SessionController::new();
        controller.begin("working");
        controller.complete(PathBuf::from("/tmp/old.mp4"));

        let begin = controller.begin("again");
        assert_eq!(
            begin,
            Begin::Started {
                superseded: Some(PathBuf::from("/tmp/old.mp4"))
            }
        );
    }

    #[test]
    fn test_reset_discards_result() {
        let mut controller = SessionController::new();
        controller.begin("working");
        controller.complete(PathBuf::from("/tmp/out.mp4"));

        let released = controller.reset();
        assert_eq!(released, Some(PathBuf::from("/tmp/out.mp4")));
        assert_eq!(*controller.state(), SessionState::Idle);
    }

    #[test]
    fn test_reset_from_idle_releases_nothing() {
        let mut controller = SessionController::new();
        assert_eq!(controller.reset(), None);
    }

    #[test]
    fn test_auth_resolved_clears_flag() {
        let mut controller = SessionController::new();
        controller.begin("working");
        controller.require_auth();
        controller.auth_resolved();
        assert!(!controller.auth_required());
    }
}
