//! The stream manager is the entry point for everything that happens to a stream.  It owns the
//! registry, the transcoder supervisor and the inference runner, and decides which streams get
//! actively processed.  Streams with an eligible source get a transcoder and an inference loop as
//! soon as they are added, while all other streams are only tracked.
//!
//! Lifecycle operations on the same stream are serialized, so a removal that arrives while a
//! transcoder is still being launched or stopped waits for that to finish first.

use crate::inference::capture::FrameSource;
use crate::inference::detector::Detector;
use crate::inference::{InferenceError, InferenceRunner, InferenceSettings};
use crate::registry::{Stream, StreamRegistry};
use crate::transcoder::{TranscoderError, TranscoderSettings, TranscoderSupervisor};
use crate::{is_eligible_source, StreamId};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, instrument, warn};

#[derive(Clone, Debug)]
pub struct StreamManagerSettings {
    pub transcoder: TranscoderSettings,
    pub inference: InferenceSettings,

    /// Most alerts retained per stream.  The oldest alerts are dropped first.
    pub max_alerts: usize,
}

#[derive(Error, Debug)]
pub enum StreamManagerError {
    #[error("No stream exists with the id '{0}'")]
    NotFound(StreamId),

    #[error("Stream {id} has a source of '{stream_source}', which cannot be transcoded")]
    InvalidSource { id: StreamId, stream_source: String },

    #[error("The transcoder for stream {id} could not be launched")]
    LaunchFailure {
        id: StreamId,
        #[source]
        error: TranscoderError,
    },
}

struct ManagerInner {
    registry: Arc<StreamRegistry>,
    transcoder: TranscoderSupervisor,
    inference: InferenceRunner,
    lifecycle_locks: Mutex<HashMap<StreamId, Arc<AsyncMutex<()>>>>,
}

#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

impl StreamManager {
    pub fn new(
        settings: StreamManagerSettings,
        frame_source: Arc<dyn FrameSource>,
        detector: Arc<dyn Detector>,
    ) -> Self {
        let registry = Arc::new(StreamRegistry::with_alert_capacity(settings.max_alerts));
        let transcoder = TranscoderSupervisor::new(settings.transcoder, registry.clone());
        let inference =
            InferenceRunner::new(settings.inference, registry.clone(), frame_source, detector);

        StreamManager {
            inner: Arc::new(ManagerInner {
                registry,
                transcoder,
                inference,
                lifecycle_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts tracking a new stream.  When the source is eligible its transcoder is launched and
    /// its inference loop started before this returns.
    ///
    /// A transcoder that fails to launch is reported as a `LaunchFailure`.  The stream stays
    /// tracked in that case, with an `Idle` status, and can be retried through `play_stream`.
    #[instrument(skip(self, source))]
    pub async fn add_stream(
        &self,
        name: String,
        source: String,
    ) -> Result<Stream, StreamManagerError> {
        let stream = self.inner.registry.create(name, source);
        let id = stream.id().clone();
        if !is_eligible_source(stream.source()) {
            info!(
                stream_id = %id,
                "Stream {} has an ineligible source and will only be tracked", id
            );

            return Ok(stream);
        }

        let lock = self.lifecycle_lock(&id);
        let _guard = lock.lock().await;

        self.start_workers(&id).await?;
        Ok(self.inner.registry.get(&id).unwrap_or(stream))
    }

    /// Stops the stream's workers, removes its output and stops tracking it.  Returns whether
    /// the stream existed.
    #[instrument(skip(self), fields(stream_id = %id))]
    pub async fn remove_stream(&self, id: &StreamId) -> bool {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;

        if !self.inner.registry.contains(id) {
            self.inner.lifecycle_locks.lock().remove(id);
            return false;
        }

        self.stop_workers(id).await;
        let existed = self.inner.registry.delete(id);
        self.inner.lifecycle_locks.lock().remove(id);

        existed
    }

    pub fn list_streams(&self) -> Vec<Stream> {
        self.inner.registry.list()
    }

    pub fn get_stream(&self, id: &StreamId) -> Result<Stream, StreamManagerError> {
        self.inner
            .registry
            .get(id)
            .map_err(|_| StreamManagerError::NotFound(id.clone()))
    }

    /// Ensures the stream is being transcoded and analyzed, returning its playback url.
    #[instrument(skip(self), fields(stream_id = %id))]
    pub async fn start_processing(&self, id: &StreamId) -> Result<String, StreamManagerError> {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;

        self.ensure_eligible(id)?;
        self.start_workers(id).await
    }

    /// Stops transcoding and analyzing the stream, while keeping it tracked.  Stopping a stream
    /// that has nothing running is not an error.
    #[instrument(skip(self), fields(stream_id = %id))]
    pub async fn stop_processing(&self, id: &StreamId) -> Result<(), StreamManagerError> {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;

        if !self.inner.registry.contains(id) {
            self.inner.lifecycle_locks.lock().remove(id);
            return Err(StreamManagerError::NotFound(id.clone()));
        }

        self.stop_workers(id).await;
        Ok(())
    }

    /// Ensures the stream has a transcoder running and returns the url its output can be played
    /// from.
    #[instrument(skip(self), fields(stream_id = %id))]
    pub async fn play_stream(&self, id: &StreamId) -> Result<String, StreamManagerError> {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;

        self.ensure_eligible(id)?;
        self.inner
            .transcoder
            .start(id)
            .await
            .map_err(|error| transcoder_error(id, error))
    }

    /// Stops every worker, forgets every stream and leaves an empty output root behind.  Returns
    /// once all transcoder processes have been reaped.
    pub async fn shutdown(&self) {
        info!("Shutting down stream manager");

        let ids = self.inner.registry.ids();
        join_all(ids.iter().map(|id| self.remove_stream(id))).await;

        // Anything still running belongs to a stream that raced with the removals above
        self.inner.inference.stop_all().await;
        self.inner.transcoder.stop_all().await;
        self.inner.transcoder.reset_output_root().await;

        info!("Stream manager shut down");
    }

    fn lifecycle_lock(&self, id: &StreamId) -> Arc<AsyncMutex<()>> {
        self.inner
            .lifecycle_locks
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Must be called with the stream's lifecycle lock held
    fn ensure_eligible(&self, id: &StreamId) -> Result<(), StreamManagerError> {
        let stream = match self.get_stream(id) {
            Ok(stream) => stream,
            Err(error) => {
                self.inner.lifecycle_locks.lock().remove(id);
                return Err(error);
            }
        };

        if is_eligible_source(stream.source()) {
            Ok(())
        } else {
            Err(StreamManagerError::InvalidSource {
                id: id.clone(),
                stream_source: stream.source().to_string(),
            })
        }
    }

    /// Must be called with the stream's lifecycle lock held
    async fn start_workers(&self, id: &StreamId) -> Result<String, StreamManagerError> {
        let transcoder_result = self.inner.transcoder.start(id).await;
        if let Err(TranscoderError::NotFound(_)) = &transcoder_result {
            return Err(StreamManagerError::NotFound(id.clone()));
        }

        // Analysis does not depend on the transcoder, so it runs even when the launch failed
        match self.inner.inference.start(id) {
            Ok(()) => (),
            Err(InferenceError::NotFound(_)) => {
                return Err(StreamManagerError::NotFound(id.clone()))
            }

            Err(InferenceError::InvalidSource { id, stream_source }) => {
                return Err(StreamManagerError::InvalidSource { id, stream_source })
            }
        }

        match transcoder_result {
            Ok(url) => Ok(url),
            Err(error) => {
                warn!(stream_id = %id, "Stream {} is being analyzed without a transcoder", id);
                Err(transcoder_error(id, error))
            }
        }
    }

    /// Must be called with the stream's lifecycle lock held
    async fn stop_workers(&self, id: &StreamId) {
        self.inner.inference.stop(id).await;
        self.inner.transcoder.stop(id).await;
        self.inner.transcoder.remove_output(id).await;
    }
}

fn transcoder_error(id: &StreamId, error: TranscoderError) -> StreamManagerError {
    match error {
        TranscoderError::NotFound(id) => StreamManagerError::NotFound(id),
        TranscoderError::InvalidSource { id, stream_source } => {
            StreamManagerError::InvalidSource { id, stream_source }
        }

        error => {
            error!(stream_id = %id, "Transcoder for stream {} failed to launch: {}", id, error);
            StreamManagerError::LaunchFailure {
                id: id.clone(),
                error,
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::registry::StreamStatus;
    use crate::test_utils::{self, FixedDetector, ScriptedFrameSource, ScriptedOpen};
    use crate::transcoder::params::PLAYLIST_FILE_NAME;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager_with(
        script: &str,
        grace_period: Duration,
        frame_source: Arc<dyn FrameSource>,
    ) -> (StreamManager, TempDir) {
        let output = tempfile::tempdir().unwrap();
        let settings = StreamManagerSettings {
            transcoder: test_utils::shell_transcoder_settings(output.path(), script, grace_period),
            inference: InferenceSettings {
                sample_interval: Duration::from_millis(10),
                retry_backoff: Duration::from_millis(10),
            },
            max_alerts: 100,
        };

        let manager = StreamManager::new(settings, frame_source, Arc::new(FixedDetector::new(&[])));
        (manager, output)
    }

    fn manager(script: &str, grace_period: Duration) -> (StreamManager, TempDir) {
        let frame_source = Arc::new(ScriptedFrameSource::new(Vec::new(), ScriptedOpen::NoFrame));
        manager_with(script, grace_period, frame_source)
    }

    async fn add(manager: &StreamManager, source: &str) -> Stream {
        manager
            .add_stream("cam".to_string(), source.to_string())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn eligible_stream_runs_until_stopped() {
        let (manager, output) = manager(test_utils::LONG_RUNNING_SCRIPT, Duration::from_secs(5));

        let stream = add(&manager, "rtsp://camA").await;
        assert_eq!(stream.status(), StreamStatus::Running, "Unexpected status");

        let url = stream.playback_url().expect("No playback url").to_string();
        assert!(url.contains(&stream.id().0), "Url '{}' does not contain the id", url);

        let output_directory = output.path().join(&stream.id().0);
        test_utils::wait_for_file(&output_directory.join(PLAYLIST_FILE_NAME)).await;
        assert!(manager.inner.inference.is_running(stream.id()), "No inference loop");

        manager.stop_processing(stream.id()).await.unwrap();

        let stream = manager.get_stream(stream.id()).unwrap();
        assert_eq!(stream.status(), StreamStatus::Idle, "Unexpected status");
        assert_eq!(stream.playback_url(), None, "Expected playback url cleared");
        assert!(!output_directory.exists(), "Output directory still exists");
        assert!(!manager.inner.inference.is_running(stream.id()), "Loop still running");
    }

    #[tokio::test]
    async fn ineligible_stream_is_only_tracked() {
        let (manager, output) = manager(test_utils::COUNTING_SCRIPT, Duration::from_secs(5));

        let stream = add(&manager, "https://example.com/video.m3u8").await;

        assert_eq!(stream.status(), StreamStatus::Idle, "Unexpected status");
        assert_eq!(stream.playback_url(), None, "Unexpected playback url");
        assert!(!manager.inner.transcoder.is_supervising(stream.id()), "Transcoder launched");
        assert!(!manager.inner.inference.is_running(stream.id()), "Loop started");
        assert!(!output.path().join(&stream.id().0).exists(), "Output created");

        match manager.play_stream(stream.id()).await {
            Err(StreamManagerError::InvalidSource { id, stream_source }) => {
                assert_eq!(&id, stream.id());
                assert_eq!(stream_source, "https://example.com/video.m3u8");
            }

            Err(e) => panic!("Expected invalid source error, instead got: {:?}", e),
            Ok(_) => panic!("Expected play to be rejected"),
        }

        let stream = manager.get_stream(stream.id()).unwrap();
        assert_eq!(stream.status(), StreamStatus::Idle, "Status changed after play");
    }

    #[tokio::test]
    async fn remove_waits_for_stop_in_grace_period() {
        let (manager, output) = manager(test_utils::STUBBORN_SCRIPT, Duration::from_millis(500));
        let stream = add(&manager, "rtsp://camA").await;
        let output_directory = output.path().join(&stream.id().0);
        test_utils::wait_for_file(&output_directory.join(PLAYLIST_FILE_NAME)).await;

        let stopping_manager = manager.clone();
        let id = stream.id().clone();
        let stop = tokio::spawn(async move { stopping_manager.stop_processing(&id).await });
        test_utils::wait_until(|| {
            manager
                .get_stream(stream.id())
                .map(|stream| stream.status() == StreamStatus::Stopping)
                .unwrap_or(false)
        })
        .await;

        assert!(manager.remove_stream(stream.id()).await, "Stream should have existed");

        assert!(!output_directory.exists(), "Output directory still exists");
        assert!(!manager.inner.transcoder.is_supervising(stream.id()), "Process alive");
        assert!(
            manager.list_streams().iter().all(|s| s.id() != stream.id()),
            "Removed stream still listed"
        );

        stop.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_leaves_empty_output_root() {
        let (manager, output) = manager(test_utils::LONG_RUNNING_SCRIPT, Duration::from_secs(5));
        let first = add(&manager, "rtsp://camA").await;
        let second = add(&manager, "rtsp://camB").await;
        add(&manager, "https://example.com/video.m3u8").await;
        test_utils::wait_for_file(&output.path().join(&first.id().0).join(PLAYLIST_FILE_NAME))
            .await;
        test_utils::wait_for_file(&output.path().join(&second.id().0).join(PLAYLIST_FILE_NAME))
            .await;

        manager.shutdown().await;

        assert!(output.path().is_dir(), "Output root should exist");
        assert_eq!(
            std::fs::read_dir(output.path()).unwrap().count(),
            0,
            "Output root should be empty"
        );

        assert!(manager.list_streams().is_empty(), "Streams still tracked");
        assert!(!manager.inner.transcoder.is_supervising(first.id()), "First still alive");
        assert!(!manager.inner.transcoder.is_supervising(second.id()), "Second still alive");
    }

    #[tokio::test]
    async fn shutdown_reaps_every_transcoder_process() {
        let (manager, output) = manager(test_utils::STUBBORN_SCRIPT, Duration::from_millis(300));
        let first = add(&manager, "rtsp://camA").await;
        let second = add(&manager, "rtsp://camB").await;
        let first_pid =
            test_utils::wait_for_pid(&test_utils::pid_file(output.path(), first.id())).await;
        let second_pid =
            test_utils::wait_for_pid(&test_utils::pid_file(output.path(), second.id())).await;
        assert!(test_utils::process_exists(first_pid), "First process never ran");
        assert!(test_utils::process_exists(second_pid), "Second process never ran");

        manager.shutdown().await;

        assert!(!test_utils::process_exists(first_pid), "Process {} still exists", first_pid);
        assert!(!test_utils::process_exists(second_pid), "Process {} still exists", second_pid);
    }

    #[tokio::test]
    async fn listing_reflects_adds_and_removes() {
        let (manager, _output) = manager(test_utils::LONG_RUNNING_SCRIPT, Duration::from_secs(5));
        let mut ids = Vec::new();
        for x in 0..5 {
            let stream = add(&manager, &format!("https://example.com/{}.m3u8", x)).await;
            ids.push(stream.id().clone());
        }

        assert!(manager.remove_stream(&ids[1]).await, "Second stream should exist");
        assert!(manager.remove_stream(&ids[3]).await, "Fourth stream should exist");
        assert!(!manager.remove_stream(&ids[3]).await, "Fourth stream removed twice");

        let listed = manager
            .list_streams()
            .into_iter()
            .map(|stream| stream.id().clone())
            .collect::<Vec<_>>();

        assert_eq!(listed, vec![ids[0].clone(), ids[2].clone(), ids[4].clone()]);
    }

    #[tokio::test]
    async fn launch_failure_leaves_stream_tracked_and_idle() {
        let (broken, _output) = {
            let output = tempfile::tempdir().unwrap();
            let mut transcoder = test_utils::shell_transcoder_settings(
                output.path(),
                test_utils::LONG_RUNNING_SCRIPT,
                Duration::from_secs(5),
            );

            transcoder.executable = "/definitely/not/a/transcoder".to_string();
            let settings = StreamManagerSettings {
                transcoder,
                inference: InferenceSettings::default(),
                max_alerts: 100,
            };

            let frame_source = Arc::new(ScriptedFrameSource::new(Vec::new(), ScriptedOpen::NoFrame));
            (
                StreamManager::new(settings, frame_source, Arc::new(FixedDetector::new(&[]))),
                output,
            )
        };

        let id = match broken
            .add_stream("cam".to_string(), "rtsp://camA".to_string())
            .await
        {
            Err(StreamManagerError::LaunchFailure { id, .. }) => id,
            Err(e) => panic!("Expected launch failure, instead got: {:?}", e),
            Ok(_) => panic!("Expected add to report a launch failure"),
        };

        let stream = broken.get_stream(&id).unwrap();
        assert_eq!(stream.status(), StreamStatus::Idle, "Unexpected status");
        assert_eq!(stream.playback_url(), None, "Unexpected playback url");
        assert_eq!(broken.list_streams().len(), 1, "Stream should still be tracked");

        broken.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_starts_launch_a_single_transcoder() {
        let (manager, output) = manager(test_utils::COUNTING_SCRIPT, Duration::from_secs(5));
        let stream = add(&manager, "rtsp://camA").await;

        manager.start_processing(stream.id()).await.unwrap();
        manager.play_stream(stream.id()).await.unwrap();

        let launches = output.path().join(&stream.id().0).join("launches");
        test_utils::wait_for_file(&launches).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let content = std::fs::read_to_string(&launches).unwrap();
        assert_eq!(content.lines().count(), 1, "Unexpected number of launches");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn play_restarts_stopped_stream() {
        let (manager, output) = manager(test_utils::LONG_RUNNING_SCRIPT, Duration::from_secs(5));
        let stream = add(&manager, "rtsp://camA").await;
        manager.stop_processing(stream.id()).await.unwrap();

        let url = manager.play_stream(stream.id()).await.unwrap();

        let stream = manager.get_stream(stream.id()).unwrap();
        assert_eq!(stream.status(), StreamStatus::Running, "Unexpected status");
        assert_eq!(stream.playback_url(), Some(url.as_str()), "Unexpected url");
        test_utils::wait_for_file(&output.path().join(&stream.id().0).join(PLAYLIST_FILE_NAME))
            .await;

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stopping_crashed_stream_is_a_no_op() {
        let (manager, _output) = manager(test_utils::CRASHING_SCRIPT, Duration::from_secs(5));
        let stream = manager
            .add_stream("cam".to_string(), "rtsp://camA".to_string())
            .await
            .unwrap();

        test_utils::wait_until(|| !manager.inner.transcoder.is_supervising(stream.id())).await;
        test_utils::wait_for_status(&manager.inner.registry, stream.id(), StreamStatus::Idle)
            .await;

        manager.stop_processing(stream.id()).await.unwrap();
        manager.stop_processing(stream.id()).await.unwrap();

        let stream = manager.get_stream(stream.id()).unwrap();
        assert_eq!(stream.status(), StreamStatus::Idle, "Unexpected status");
    }

    #[tokio::test]
    async fn operations_on_unknown_stream_return_not_found() {
        let (manager, _output) = manager(test_utils::LONG_RUNNING_SCRIPT, Duration::from_secs(5));
        let id = StreamId("42".to_string());

        assert!(matches!(manager.get_stream(&id), Err(StreamManagerError::NotFound(_))));
        assert!(matches!(
            manager.play_stream(&id).await,
            Err(StreamManagerError::NotFound(_))
        ));
        assert!(matches!(
            manager.start_processing(&id).await,
            Err(StreamManagerError::NotFound(_))
        ));
        assert!(matches!(
            manager.stop_processing(&id).await,
            Err(StreamManagerError::NotFound(_))
        ));
        assert!(!manager.remove_stream(&id).await, "Unknown stream reported as removed");
    }

    #[tokio::test]
    async fn detections_are_recorded_for_eligible_streams() {
        let output = tempfile::tempdir().unwrap();
        let settings = StreamManagerSettings {
            transcoder: test_utils::shell_transcoder_settings(
                output.path(),
                test_utils::LONG_RUNNING_SCRIPT,
                Duration::from_secs(5),
            ),
            inference: InferenceSettings {
                sample_interval: Duration::from_millis(10),
                retry_backoff: Duration::from_millis(10),
            },
            max_alerts: 3,
        };

        let frame_source = Arc::new(ScriptedFrameSource::new(Vec::new(), ScriptedOpen::Frame));
        let manager = StreamManager::new(
            settings,
            frame_source,
            Arc::new(FixedDetector::new(&["car", "pothole"])),
        );

        let stream = add(&manager, "rtsp://camA").await;
        test_utils::wait_until(|| {
            manager
                .get_stream(stream.id())
                .map(|stream| stream.detection_count() >= 4)
                .unwrap_or(false)
        })
        .await;

        let stream = manager.get_stream(stream.id()).unwrap();
        assert_eq!(stream.alerts().len(), 3, "Alerts should be capped");
        assert!(
            stream.alerts().iter().all(|alert| alert.ends_with(" detected")),
            "Unexpected alerts: {:?}",
            stream.alerts()
        );

        manager.shutdown().await;
    }
}
