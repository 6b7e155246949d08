//! Reference frame extraction for cleanview.
//!
//! Derives a single still image from the source video by decoding the frame
//! at timestamp 0 with FFmpeg at the video's native pixel dimensions and
//! encoding it losslessly as PNG.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::veo::AspectRatio;

/// Upper bound for a single frame extraction. A source that never becomes
/// decodable must not hang the caller's state machine.
pub const DEFAULT_EXTRACT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for an ffprobe dimension query.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A single encoded still image used as the generation reference.
///
/// Ephemeral: created per generation attempt and discarded after submission.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReference {
    /// MIME type of the encoded image (always `image/png` for extraction).
    pub mime_type: String,
    /// Encoded image bytes.
    pub data: Vec<u8>,
}

impl FrameReference {
    /// Wrap PNG bytes as a frame reference.
    pub fn png(data: Vec<u8>) -> Self {
        Self {
            mime_type: "image/png".to_string(),
            data,
        }
    }

    /// Base64 form of the image bytes, as carried on the wire.
    pub fn base64_payload(&self) -> String {
        BASE64.encode(&self.data)
    }

    /// `data:<mime>;base64,<payload>` rendering of this frame.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64_payload())
    }
}

/// Pixel dimensions of a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoDimensions {
    pub width: u32,
    pub height: u32,
}

/// Errors that can occur during frame extraction
#[derive(Debug)]
pub enum FrameError {
    /// FFmpeg or ffprobe executable not found
    FfmpegNotFound,
    /// FFmpeg exited with a failure while decoding the frame
    ExtractionFailed { stderr: String },
    /// FFmpeg succeeded but produced no image data
    EmptyFrame,
    /// Extraction did not complete within the allowed time
    Timeout,
    /// I/O error while running the subprocess
    IoError(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::FfmpegNotFound => {
                write!(
                    f,
                    "FFmpeg not found. Please install it with:\n\n    brew install ffmpeg\n"
                )
            }
            FrameError::ExtractionFailed { stderr } => {
                write!(f, "FFmpeg could not decode a reference frame: {}", stderr)
            }
            FrameError::EmptyFrame => write!(f, "FFmpeg produced no image data"),
            FrameError::Timeout => write!(f, "frame extraction timed out"),
            FrameError::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            FrameError::FfmpegNotFound
        } else {
            FrameError::IoError(e)
        }
    }
}

/// Extract the frame at timestamp 0 of `video` as a PNG reference image.
///
/// Repeated extraction from the same input yields the same frame: the seek
/// target and encoder are fixed, and the image keeps the source's native
/// dimensions.
pub async fn extract_reference_frame(video: &Path) -> Result<FrameReference, FrameError> {
    extract_reference_frame_with_timeout(video, DEFAULT_EXTRACT_TIMEOUT).await
}

/// Like `extract_reference_frame`, with a custom timeout bound.
pub async fn extract_reference_frame_with_timeout(
    video: &Path,
    timeout: Duration,
) -> Result<FrameReference, FrameError> {
    let output_fut = tokio::process::Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-ss")
        .arg("0")
        .arg("-i")
        .arg(video)
        .arg("-frames:v")
        .arg("1")
        .arg("-f")
        .arg("image2pipe")
        .arg("-c:v")
        .arg("png")
        .arg("pipe:1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, output_fut)
        .await
        .map_err(|_| {
            log::error!("Frame extraction timed out after {:?}", timeout);
            FrameError::Timeout
        })??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(FrameError::ExtractionFailed { stderr });
    }

    if output.stdout.is_empty() {
        return Err(FrameError::EmptyFrame);
    }

    log::debug!(
        "Extracted reference frame from {:?} ({} bytes)",
        video,
        output.stdout.len()
    );
    Ok(FrameReference::png(output.stdout))
}

/// Probe the pixel dimensions of the first video stream via ffprobe.
pub async fn probe_dimensions(video: &Path) -> Result<VideoDimensions, FrameError> {
    let output_fut = tokio::process::Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height")
        .arg("-of")
        .arg("csv=p=0")
        .arg(video)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(PROBE_TIMEOUT, output_fut)
        .await
        .map_err(|_| FrameError::Timeout)??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(FrameError::ExtractionFailed { stderr });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_dimensions(&stdout).ok_or(FrameError::EmptyFrame)
}

/// Parse ffprobe's `width,height` CSV output.
fn parse_dimensions(s: &str) -> Option<VideoDimensions> {
    let line = s.lines().next()?.trim().trim_end_matches(',');
    let (w, h) = line.split_once(',')?;
    let width = w.trim().parse().ok()?;
    let height = h.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some(VideoDimensions { width, height })
}

/// Aspect ratio bucket for a set of dimensions: portrait sources map to
/// 9:16, everything else to 16:9.
pub fn aspect_ratio_for(dims: VideoDimensions) -> AspectRatio {
    if dims.height > dims.width {
        AspectRatio::Portrait
    } else {
        AspectRatio::Landscape
    }
}

/// Derive the output aspect ratio from the source video, falling back to
/// 16:9 when probing fails.
pub async fn detect_aspect_ratio(video: &Path) -> AspectRatio {
    match probe_dimensions(video).await {
        Ok(dims) => aspect_ratio_for(dims),
        Err(e) => {
            log::warn!("Could not probe {:?}, assuming 16:9: {}", video, e);
            AspectRatio::Landscape
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_reference_mime_type() {
        let frame = FrameReference::png(vec![1, 2, 3]);
        assert_eq!(frame.mime_type, "image/png");
    }

    #[test]
    fn test_base64_payload_is_deterministic() {
        let a = FrameReference::png(vec![0x89, 0x50, 0x4e, 0x47]);
        let b = FrameReference::png(vec![0x89, 0x50, 0x4e, 0x47]);
        assert_eq!(a.base64_payload(), b.base64_payload());
        assert_eq!(a.base64_payload(), "iVBORw==");
    }

    #[test]
    fn test_to_data_uri_shape() {
        let frame = FrameReference::png(vec![0x89, 0x50, 0x4e, 0x47]);
        assert_eq!(frame.to_data_uri(), "data:image/png;base64,iVBORw==");
    }

    #[test]
    fn test_parse_dimensions_basic() {
        assert_eq!(
            parse_dimensions("1920,1080\n"),
            Some(VideoDimensions {
                width: 1920,
                height: 1080
            })
        );
    }

    #[test]
    fn test_parse_dimensions_trailing_comma() {
        // Some ffprobe builds emit a trailing field separator.
        assert_eq!(
            parse_dimensions("1080,1920,\n"),
            Some(VideoDimensions {
                width: 1080,
                height: 1920
            })
        );
    }

    #[test]
    fn test_parse_dimensions_rejects_garbage() {
        assert_eq!(parse_dimensions(""), None);
        assert_eq!(parse_dimensions("widthxheight"), None);
        assert_eq!(parse_dimensions("0,1080"), None);
    }

    #[test]
    fn test_aspect_ratio_for_landscape() {
        let dims = VideoDimensions {
            width: 1920,
            height: 1080,
        };
        assert_eq!(aspect_ratio_for(dims), AspectRatio::Landscape);
    }

    #[test]
    fn test_aspect_ratio_for_portrait() {
        let dims = VideoDimensions {
            width: 1080,
            height: 1920,
        };
        assert_eq!(aspect_ratio_for(dims), AspectRatio::Portrait);
    }

    #[test]
    fn test_aspect_ratio_for_square_is_landscape() {
        let dims = VideoDimensions {
            width: 720,
            height: 720,
        };
        assert_eq!(aspect_ratio_for(dims), AspectRatio::Landscape);
    }

    #[test]
    fn test_frame_error_display() {
        assert_eq!(
            FrameError::Timeout.to_string(),
            "frame extraction timed out"
        );
        assert_eq!(
            FrameError::EmptyFrame.to_string(),
            "FFmpeg produced no image data"
        );
        assert!(FrameError::FfmpegNotFound.to_string().contains("FFmpeg not found"));
    }

    #[test]
    fn test_io_not_found_maps_to_ffmpeg_not_found() {
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "no ffmpeg");
        assert!(matches!(FrameError::from(e), FrameError::FfmpegNotFound));
    }

    #[tokio::test]
    async fn test_extract_missing_file_fails() {
        // Either ffmpeg is absent (FfmpegNotFound) or it exits non-zero on a
        // nonexistent input; both are errors, never a hang.
        let result = extract_reference_frame_with_timeout(
            Path::new("/nonexistent/clip.mp4"),
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_err());
    }
}
