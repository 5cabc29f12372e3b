//! Grabbing single frames from a video source.
//!
//! The inference loop opens the source, reads one frame, and drops the capture right away.  No
//! connection to the source is held between samples.

use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// A single encoded video frame
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Bytes,
}

impl Frame {
    pub fn new(data: Bytes) -> Self {
        Frame { data }
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("The capture process could not be launched")]
    LaunchFailure(#[from] std::io::Error),

    #[error("Source '{url}' could not be opened: {reason}")]
    OpenFailed { url: String, reason: String },

    #[error("Opening source '{0}' timed out")]
    TimedOut(String),
}

/// Something that can open a video source for frame capture
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Opens the source.  An error means the source could not be reached at all, which the
    /// inference loop treats as a transient fault and retries after a backoff.
    async fn open(&self, source: &str) -> Result<Box<dyn FrameCapture>, CaptureError>;
}

/// An open capture of a video source.  The source is released when this is dropped.
#[async_trait]
pub trait FrameCapture: Send {
    /// Reads the next frame, returning `None` if no frame could be decoded
    async fn read_frame(&mut self) -> Option<Frame>;
}

/// Grabs a single frame by running ffmpeg against the source, and reading one mjpeg encoded
/// frame from its standard output.
pub struct FfmpegFrameSource {
    executable: String,
    open_timeout: Duration,
}

impl FfmpegFrameSource {
    pub fn new(executable: String, open_timeout: Duration) -> Self {
        FfmpegFrameSource {
            executable,
            open_timeout,
        }
    }

    fn arguments(source: &str) -> Vec<String> {
        let mut args = vec![
            "-nostdin".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
        ];

        if crate::is_eligible_source(source) {
            args.push("-rtsp_transport".to_string());
            args.push("tcp".to_string());
        }

        args.push("-i".to_string());
        args.push(source.to_string());
        args.push("-frames:v".to_string());
        args.push("1".to_string());
        args.push("-f".to_string());
        args.push("image2pipe".to_string());
        args.push("-c:v".to_string());
        args.push("mjpeg".to_string());
        args.push("-".to_string());

        args
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn open(&self, source: &str) -> Result<Box<dyn FrameCapture>, CaptureError> {
        let child = Command::new(&self.executable)
            .args(FfmpegFrameSource::arguments(source))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the output future on timeout kills the process
        let output = match timeout(self.open_timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Err(CaptureError::TimedOut(source.to_string())),
        };

        if !output.status.success() && output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no output")
                .trim()
                .to_string();

            return Err(CaptureError::OpenFailed {
                url: source.to_string(),
                reason: format!("{} ({})", reason, output.status),
            });
        }

        debug!("Captured {} bytes from '{}'", output.stdout.len(), source);
        let frame = if output.stdout.is_empty() {
            None
        } else {
            Some(Frame::new(Bytes::from(output.stdout)))
        };

        Ok(Box::new(GrabbedFrame { frame }))
    }
}

struct GrabbedFrame {
    frame: Option<Frame>,
}

#[async_trait]
impl FrameCapture for GrabbedFrame {
    async fn read_frame(&mut self) -> Option<Frame> {
        self.frame.take()
    }
}
