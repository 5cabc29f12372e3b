//! The object detection capability.  Detection is treated as an opaque, stateless function from
//! a frame to a set of labels, and may be invoked concurrently by the loops of different streams.

use crate::inference::capture::Frame;
use std::env;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{error, warn};

/// A single object found in a frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Detection {
    pub label: String,
}

impl Detection {
    pub fn new(label: impl Into<String>) -> Self {
        Detection {
            label: label.into(),
        }
    }
}

/// Maps a frame to zero or more labeled detections.  Calls are made from the blocking thread
/// pool, so implementations are free to do heavy synchronous work.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Vec<Detection>;

    /// Whether the detector can currently process frames.  Inference loops skip sampling while
    /// their detector is not ready.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Detector used when no detection model has been configured
pub struct UnavailableDetector;

impl Detector for UnavailableDetector {
    fn detect(&self, _frame: &Frame) -> Vec<Detection> {
        Vec::new()
    }

    fn is_ready(&self) -> bool {
        false
    }
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("The detector executable '{0}' was not found")]
    ExecutableNotFound(String),
}

/// Runs an external model command for every frame.  The encoded frame is written to the
/// command's standard input, and every non-empty line it writes to standard output is taken as
/// the label of one detection.
pub struct CommandDetector {
    executable: String,
    arguments: Vec<String>,
}

impl CommandDetector {
    /// Creates a detector for the executable.  A bare command name is looked up on `PATH`, the
    /// same way it would be when spawned, while anything else is taken as a path to the file.
    pub fn new(executable: String, arguments: Vec<String>) -> Result<Self, DetectorError> {
        if !executable_exists(&executable) {
            return Err(DetectorError::ExecutableNotFound(executable));
        }

        Ok(CommandDetector {
            executable,
            arguments,
        })
    }
}

fn executable_exists(executable: &str) -> bool {
    let path = Path::new(executable);
    if path.components().count() != 1 {
        return path.is_file();
    }

    match env::var_os("PATH") {
        Some(paths) => env::split_paths(&paths).any(|directory| directory.join(path).is_file()),
        None => false,
    }
}

impl Detector for CommandDetector {
    fn detect(&self, frame: &Frame) -> Vec<Detection> {
        let mut child = match Command::new(&self.executable)
            .args(&self.arguments)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to run detector '{}': {}", self.executable, e);
                return Vec::new();
            }
        };

        // Feed stdin from another thread so a chatty model can't deadlock us on a full pipe
        let stdin = child.stdin.take();
        let data = frame.data.clone();
        let writer = std::thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&data);
            }
        });

        let output = child.wait_with_output();
        let _ = writer.join();

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!("Failed waiting on detector '{}': {}", self.executable, e);
                return Vec::new();
            }
        };

        if !output.status.success() {
            warn!("Detector exited with {}", output.status);
            return Vec::new();
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .map(Detection::new)
            .collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn unavailable_detector_is_never_ready() {
        assert!(!UnavailableDetector.is_ready());
        assert!(UnavailableDetector
            .detect(&Frame::new(Bytes::from_static(b"frame")))
            .is_empty());
    }

    #[test]
    fn missing_executable_is_rejected() {
        match CommandDetector::new("/definitely/not/a/model".to_string(), Vec::new()) {
            Err(DetectorError::ExecutableNotFound(path)) => {
                assert_eq!(path, "/definitely/not/a/model")
            }
            Ok(_) => panic!("Expected detector creation to fail"),
        }
    }

    #[test]
    fn bare_command_names_are_found_on_path() {
        let detector = CommandDetector::new(
            "sh".to_string(),
            vec!["-c".to_string(), "cat > /dev/null; echo truck".to_string()],
        )
        .unwrap();

        let detections = detector.detect(&Frame::new(Bytes::from_static(b"jpeg bytes")));
        assert_eq!(detections, vec![Detection::new("truck")]);

        match CommandDetector::new("definitely-not-a-model".to_string(), Vec::new()) {
            Err(DetectorError::ExecutableNotFound(name)) => assert_eq!(name, "definitely-not-a-model"),
            Ok(_) => panic!("Expected an unknown command to be rejected"),
        }
    }

    #[test]
    fn command_output_lines_become_detections() {
        let detector = CommandDetector::new(
            "/bin/sh".to_string(),
            vec![
                "-c".to_string(),
                "cat > /dev/null; echo car; echo; echo ' pothole '".to_string(),
            ],
        )
        .unwrap();

        let detections = detector.detect(&Frame::new(Bytes::from_static(b"jpeg bytes")));

        assert_eq!(
            detections,
            vec![Detection::new("car"), Detection::new("pothole")]
        );
    }

    #[test]
    fn failing_command_yields_no_detections() {
        let detector = CommandDetector::new(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "cat > /dev/null; echo car; exit 3".to_string()],
        )
        .unwrap();

        assert!(detector
            .detect(&Frame::new(Bytes::from_static(b"jpeg bytes")))
            .is_empty());
    }
}
