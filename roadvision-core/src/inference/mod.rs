//! Periodic frame sampling and object detection, one loop per stream.
//!
//! Every cycle the loop reads the stream's source from the registry, opens it, grabs a single frame
//! and releases the source again before running detection.  Results from one cycle are folded into
//! the registry with a single mutation.  A loop ends when it's cancelled or when its stream is no
//! longer in the registry.

pub mod capture;
pub mod detector;

use crate::registry::StreamRegistry;
use crate::{is_eligible_source, StreamId};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use self::capture::FrameSource;
use self::detector::Detector;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("No stream exists with the id '{0}'")]
    NotFound(StreamId),

    #[error("Stream {id} has a source of '{stream_source}', which cannot be analyzed")]
    InvalidSource { id: StreamId, stream_source: String },
}

/// Timing of the inference loops
#[derive(Clone, Debug)]
pub struct InferenceSettings {
    /// Delay between the end of one completed cycle and the start of the next
    pub sample_interval: Duration,

    /// Delay before retrying after the source could not be opened, or while the detector is
    /// not ready
    pub retry_backoff: Duration,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        InferenceSettings {
            sample_interval: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(10),
        }
    }
}

enum CycleOutcome {
    Completed,
    Backoff,
    Cancelled,
}

struct RunningLoop {
    cancellation: CancellationToken,
    task: JoinHandle<()>,
}

struct RunnerInner {
    settings: InferenceSettings,
    registry: Arc<StreamRegistry>,
    frame_source: Arc<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    loops: Mutex<HashMap<StreamId, RunningLoop>>,
}

/// Owns the inference loops, at most one per stream
#[derive(Clone)]
pub struct InferenceRunner {
    inner: Arc<RunnerInner>,
}

impl InferenceRunner {
    pub fn new(
        settings: InferenceSettings,
        registry: Arc<StreamRegistry>,
        frame_source: Arc<dyn FrameSource>,
        detector: Arc<dyn Detector>,
    ) -> Self {
        InferenceRunner {
            inner: Arc::new(RunnerInner {
                settings,
                registry,
                frame_source,
                detector,
                loops: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts sampling the stream.  Does nothing if a loop is already running for it.
    pub fn start(&self, id: &StreamId) -> Result<(), InferenceError> {
        let stream = match self.inner.registry.get(id) {
            Ok(stream) => stream,
            Err(_) => return Err(InferenceError::NotFound(id.clone())),
        };

        if !is_eligible_source(stream.source()) {
            return Err(InferenceError::InvalidSource {
                id: id.clone(),
                stream_source: stream.source().to_string(),
            });
        }

        let mut loops = self.inner.loops.lock();
        if let Some(existing) = loops.get(id) {
            if !existing.task.is_finished() {
                debug!(stream_id = %id, "Stream {} is already being analyzed", id);
                return Ok(());
            }
        }

        let cancellation = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            self.inner.clone(),
            id.clone(),
            cancellation.clone(),
        ));

        loops.insert(id.clone(), RunningLoop { cancellation, task });

        Ok(())
    }

    /// Stops the stream's loop and waits for it to exit.  A no-op if no loop is running.
    pub async fn stop(&self, id: &StreamId) {
        let running = self.inner.loops.lock().remove(id);
        if let Some(running) = running {
            running.cancellation.cancel();
            if let Err(error) = running.task.await {
                error!(stream_id = %id, "Inference loop for stream {} failed: {}", id, error);
            }
        }
    }

    /// Stops every loop and waits for all of them to exit
    pub async fn stop_all(&self) {
        let ids = self
            .inner
            .loops
            .lock()
            .keys()
            .cloned()
            .collect::<Vec<_>>();

        join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    pub fn is_running(&self, id: &StreamId) -> bool {
        match self.inner.loops.lock().get(id) {
            Some(running) => !running.task.is_finished(),
            None => false,
        }
    }
}

#[instrument(name = "Inference Loop", skip(inner, cancellation), fields(stream_id = %id))]
async fn run_loop(inner: Arc<RunnerInner>, id: StreamId, cancellation: CancellationToken) {
    info!("Starting analysis of stream {}", id);

    loop {
        if cancellation.is_cancelled() {
            break;
        }

        let source = match inner.registry.get(&id) {
            Ok(stream) => stream.source().to_string(),
            Err(_) => {
                info!("Stream {} removed", id);
                break;
            }
        };

        let delay = match run_cycle(&inner, &id, &source, &cancellation).await {
            CycleOutcome::Completed => inner.settings.sample_interval,
            CycleOutcome::Backoff => inner.settings.retry_backoff,
            CycleOutcome::Cancelled => break,
        };

        tokio::select! {
            _ = sleep(delay) => (),
            _ = cancellation.cancelled() => break,
        }
    }

    info!("Analysis of stream {} stopped", id);
}

async fn run_cycle(
    inner: &RunnerInner,
    id: &StreamId,
    source: &str,
    cancellation: &CancellationToken,
) -> CycleOutcome {
    if !inner.detector.is_ready() {
        warn!("Detector not available, skipping analysis");
        return CycleOutcome::Backoff;
    }

    let opened = tokio::select! {
        result = inner.frame_source.open(source) => result,
        _ = cancellation.cancelled() => return CycleOutcome::Cancelled,
    };

    let mut capture = match opened {
        Ok(capture) => capture,
        Err(error) => {
            warn!("Could not open stream {} for analysis: {}", source, error);
            return CycleOutcome::Backoff;
        }
    };

    let frame = tokio::select! {
        frame = capture.read_frame() => frame,
        _ = cancellation.cancelled() => return CycleOutcome::Cancelled,
    };

    // Release the source before running detection
    drop(capture);

    let frame = match frame {
        Some(frame) => frame,
        None => {
            warn!("Failed to grab a frame from {}", source);
            return CycleOutcome::Completed;
        }
    };

    debug!("Analyzing frame from stream {}", id);
    let detector = inner.detector.clone();
    let detections = match tokio::task::spawn_blocking(move || detector.detect(&frame)).await {
        Ok(detections) => detections,
        Err(error) => {
            error!("Detection failed for stream {}: {}", id, error);
            return CycleOutcome::Completed;
        }
    };

    if detections.is_empty() {
        return CycleOutcome::Completed;
    }

    let result = inner.registry.mutate(id, |stream| {
        stream.record_detections(detections.iter().map(|detection| detection.label.as_str()))
    });

    match result {
        Ok(stream) => info!(
            detections = detections.len(),
            "Recorded {} detections for stream {} ({} total)",
            detections.len(),
            id,
            stream.detection_count()
        ),

        Err(_) => debug!("Stream {} removed before its detections could be recorded", id),
    }

    CycleOutcome::Completed
}
