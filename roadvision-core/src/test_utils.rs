//! Helpers shared by tests of this crate and of crates built on top of it

use crate::inference::capture::{CaptureError, Frame, FrameCapture, FrameSource};
use crate::inference::detector::{Detection, Detector};
use crate::registry::{StreamRegistry, StreamStatus};
use crate::transcoder::params::{TranscoderArguments, PLAYLIST_PLACEHOLDER, SOURCE_PLACEHOLDER};
use crate::transcoder::TranscoderSettings;
use crate::StreamId;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transcoder stand-in that writes a playlist and then runs until terminated
pub const LONG_RUNNING_SCRIPT: &str =
    "echo '#EXTM3U' > \"$2\"; echo \"transcoding $1\" >&2; exec sleep 30";

/// Transcoder stand-in that records each launch next to its playlist before running
pub const COUNTING_SCRIPT: &str =
    "echo launch >> \"$(dirname \"$2\")/launches\"; exec sleep 30";

/// Transcoder stand-in that exits right away with a failure
pub const CRASHING_SCRIPT: &str = "exit 1";

/// Transcoder stand-in that records each launch in the output root, then exits with a failure
pub const COUNTED_CRASH_SCRIPT: &str =
    "echo launch >> \"$(dirname \"$(dirname \"$2\")\")/launches\"; exit 1";

/// Transcoder stand-in that writes its pid to `<output root>/<stream id>.pid` and then runs until
/// terminated.  `exec` keeps the pid the same once `sleep` takes over.
pub const PID_RECORDING_SCRIPT: &str =
    "echo $$ > \"$(dirname \"$2\").pid\"; echo '#EXTM3U' > \"$2\"; exec sleep 30";

/// Transcoder stand-in that ignores termination requests, and so has to be killed.  Records its
/// pid the same way `PID_RECORDING_SCRIPT` does.
pub const STUBBORN_SCRIPT: &str =
    "trap '' TERM; echo $$ > \"$(dirname \"$2\").pid\"; echo '#EXTM3U' > \"$2\"; exec sleep 30";

/// Transcoder settings that run the given shell script in place of ffmpeg.  The script receives
/// the stream's source as `$1` and the playlist path as `$2`.
pub fn shell_transcoder_settings(
    output_root: &Path,
    script: &str,
    stop_grace_period: Duration,
) -> TranscoderSettings {
    TranscoderSettings {
        executable: "/bin/sh".to_string(),
        arguments: TranscoderArguments::Template(vec![
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
            SOURCE_PLACEHOLDER.to_string(),
            PLAYLIST_PLACEHOLDER.to_string(),
        ]),
        output_root: output_root.to_path_buf(),
        log_root: None,
        playback_base_url: "http://localhost:8000/hls".to_string(),
        stop_grace_period,
    }
}

/// Polls until the condition is true, panicking if that takes too long
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("Condition was not met within {:?}", WAIT_TIMEOUT);
        }

        sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_status(registry: &StreamRegistry, id: &StreamId, status: StreamStatus) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let current = registry.get(id).expect("Stream not found").status();
        if current == status {
            return;
        }

        if Instant::now() >= deadline {
            panic!(
                "Stream {} did not reach status {:?} (currently {:?})",
                id, status, current
            );
        }

        sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_file(path: &Path) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !path.exists() {
        if Instant::now() >= deadline {
            panic!("File '{}' was never created", path.display());
        }

        sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_removal(path: &Path) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while path.exists() {
        if Instant::now() >= deadline {
            panic!("'{}' was never removed", path.display());
        }

        sleep(Duration::from_millis(10)).await;
    }
}

/// File the pid recording scripts write the stream's transcoder pid to
pub fn pid_file(output_root: &Path, id: &StreamId) -> PathBuf {
    output_root.join(format!("{}.pid", id))
}

/// Waits until the pid file has been fully written and returns the pid in it
pub async fn wait_for_pid(path: &Path) -> i32 {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(pid) = contents.trim().parse() {
                return pid;
            }
        }

        if Instant::now() >= deadline {
            panic!("No pid was written to '{}'", path.display());
        }

        sleep(Duration::from_millis(10)).await;
    }
}

/// Returns false once no process with the pid exists anymore, which for a child process means it
/// has exited and been reaped
#[cfg(unix)]
pub fn process_exists(pid: i32) -> bool {
    // SAFETY: signal 0 only checks whether the pid can be signalled
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }

    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// What a single `open()` call of a `ScriptedFrameSource` results in
#[derive(Clone, Copy, Debug)]
pub enum ScriptedOpen {
    /// The source could not be opened
    Fail,

    /// The source opened but no frame could be read
    NoFrame,

    /// The source opened and produced a frame
    Frame,
}

/// Frame source that plays back a fixed script of open results, then repeats a fallback result
/// forever.
pub struct ScriptedFrameSource {
    script: Mutex<VecDeque<ScriptedOpen>>,
    fallback: ScriptedOpen,
    open_delay: Duration,
    opens: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    observer: Option<(Arc<StreamRegistry>, StreamId)>,
    observed_counts: Mutex<Vec<u64>>,
}

impl ScriptedFrameSource {
    pub fn new(script: Vec<ScriptedOpen>, fallback: ScriptedOpen) -> Self {
        ScriptedFrameSource {
            script: Mutex::new(script.into()),
            fallback,
            open_delay: Duration::from_millis(0),
            opens: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            observer: None,
            observed_counts: Mutex::new(Vec::new()),
        }
    }

    /// Every open will take this long to resolve
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Records the stream's detection count at the start of every open
    pub fn observing(mut self, registry: Arc<StreamRegistry>, id: StreamId) -> Self {
        self.observer = Some((registry, id));
        self
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// The largest number of opens that were in progress at the same time
    pub fn max_concurrent_opens(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn observed_counts(&self) -> Vec<u64> {
        self.observed_counts.lock().clone()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl FrameSource for ScriptedFrameSource {
    async fn open(&self, source: &str) -> Result<Box<dyn FrameCapture>, CaptureError> {
        if let Some((registry, id)) = &self.observer {
            if let Ok(stream) = registry.get(id) {
                self.observed_counts.lock().push(stream.detection_count());
            }
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if !self.open_delay.is_zero() {
            sleep(self.open_delay).await;
        }

        let next = self.script.lock().pop_front().unwrap_or(self.fallback);
        match next {
            ScriptedOpen::Fail => Err(CaptureError::OpenFailed {
                url: source.to_string(),
                reason: "scripted failure".to_string(),
            }),

            ScriptedOpen::NoFrame => Ok(Box::new(ScriptedCapture { frame: None })),
            ScriptedOpen::Frame => Ok(Box::new(ScriptedCapture {
                frame: Some(Frame::new(Bytes::from_static(b"frame"))),
            })),
        }
    }
}

struct ScriptedCapture {
    frame: Option<Frame>,
}

#[async_trait]
impl FrameCapture for ScriptedCapture {
    async fn read_frame(&mut self) -> Option<Frame> {
        self.frame.take()
    }
}

/// Detector that returns the same labels for every frame
pub struct FixedDetector {
    labels: Vec<String>,
}

impl FixedDetector {
    pub fn new(labels: &[&str]) -> Self {
        FixedDetector {
            labels: labels.iter().map(|label| label.to_string()).collect(),
        }
    }
}

impl Detector for FixedDetector {
    fn detect(&self, _frame: &Frame) -> Vec<Detection> {
        self.labels.iter().map(Detection::new).collect()
    }
}
