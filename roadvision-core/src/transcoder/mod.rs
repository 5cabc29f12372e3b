//! Supervises one transcoder process per stream.  The transcoder reads the stream's source and
//! continuously writes an HLS playlist into a directory dedicated to that stream.
//!
//! Each launched process gets its own supervision task.  That task waits on the process and on a
//! stop request, whichever comes first.  When a stop is requested the process is asked to terminate
//! and is killed if it has not exited after the grace period.  Either way the task then removes the
//! stream's output directory and reverts the stream to `Idle` in the registry.  The task is the
//! only code that touches the process handle once it has been launched.

pub mod params;

use crate::registry::{StreamRegistry, StreamStatus};
use crate::{is_eligible_source, StreamId};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use self::params::{TranscoderArguments, PLAYLIST_FILE_NAME};

/// Errors that can be returned when starting a transcoder
#[derive(Error, Debug)]
pub enum TranscoderError {
    #[error("No stream exists with the id '{0}'")]
    NotFound(StreamId),

    #[error("Stream {id} has a source of '{stream_source}', which cannot be transcoded")]
    InvalidSource { id: StreamId, stream_source: String },

    #[error("The output directory '{path}' could not be created")]
    OutputDirectory {
        path: String,
        #[source]
        error: std::io::Error,
    },

    #[error("The launch of the transcoder for stream {0} did not complete")]
    LaunchInterrupted(StreamId),

    #[error("The transcoder '{executable}' failed to launch")]
    LaunchFailure {
        executable: String,
        #[source]
        error: std::io::Error,
    },
}

/// Settings shared by every transcoder launched by a supervisor
#[derive(Clone, Debug)]
pub struct TranscoderSettings {
    /// Path to (or name of) the transcoder executable
    pub executable: String,

    pub arguments: TranscoderArguments,

    /// Directory that holds one output subdirectory per stream
    pub output_root: PathBuf,

    /// Directory transcoder output logs are written to.  When not set the transcoder's output is
    /// discarded.
    pub log_root: Option<PathBuf>,

    /// Base url the output root is served from
    pub playback_base_url: String,

    /// How long a transcoder has to exit after being asked to terminate before it's killed
    pub stop_grace_period: Duration,
}

impl TranscoderSettings {
    /// Directory the given stream's playlist and segments are written to
    pub fn output_directory(&self, id: &StreamId) -> PathBuf {
        self.output_root.join(&id.0)
    }

    /// Url the given stream's playlist can be played from while it is being transcoded
    pub fn playback_url(&self, id: &StreamId) -> String {
        format!(
            "{}/{}/{}",
            self.playback_base_url.trim_end_matches('/'),
            id,
            PLAYLIST_FILE_NAME
        )
    }
}

enum SlotState {
    /// The process is being spawned.  Holding the slot keeps a concurrent start from spawning a
    /// second process for the same stream.
    Launching,

    Running {
        stop_sender: oneshot::Sender<()>,
        task: JoinHandle<()>,

        /// Set once the process is gone, while its output may still be getting cleaned up
        exited: Arc<AtomicBool>,
    },
}

struct ProcessSlot {
    launch_id: Uuid,
    state: SlotState,
}

enum ProcessOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    StopRequested,
}

struct SupervisorInner {
    settings: TranscoderSettings,
    registry: Arc<StreamRegistry>,
    processes: Mutex<HashMap<StreamId, ProcessSlot>>,
}

/// Owns the lifecycle of transcoder processes, at most one per stream
#[derive(Clone)]
pub struct TranscoderSupervisor {
    inner: Arc<SupervisorInner>,
}

impl TranscoderSupervisor {
    pub fn new(settings: TranscoderSettings, registry: Arc<StreamRegistry>) -> Self {
        TranscoderSupervisor {
            inner: Arc::new(SupervisorInner {
                settings,
                registry,
                processes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Launches a transcoder for the stream and returns its playback url.  If a transcoder is
    /// already being supervised for the stream nothing is launched, and the url of the existing
    /// one is returned.
    ///
    /// The launch itself runs on its own task, so dropping the returned future does not abandon a
    /// half launched process.  A process that has already exited but is still being cleaned up
    /// does not count as supervised: its cleanup is awaited and a new process is launched.
    #[instrument(skip(self), fields(stream_id = %id))]
    pub async fn start(&self, id: &StreamId) -> Result<String, TranscoderError> {
        let stream = match self.inner.registry.get(id) {
            Ok(stream) => stream,
            Err(_) => return Err(TranscoderError::NotFound(id.clone())),
        };

        if !is_eligible_source(stream.source()) {
            return Err(TranscoderError::InvalidSource {
                id: id.clone(),
                stream_source: stream.source().to_string(),
            });
        }

        let launch_id = Uuid::new_v4();
        let exiting_task = {
            let mut processes = self.inner.processes.lock();
            let exiting_task = match processes.remove(id) {
                None => None,
                Some(ProcessSlot {
                    state: SlotState::Running { task, exited, .. },
                    ..
                }) if exited.load(Ordering::SeqCst) || task.is_finished() => Some(task),

                Some(slot) => {
                    processes.insert(id.clone(), slot);
                    info!("Stream {} already has a transcoder, not launching another", id);
                    return Ok(self.inner.settings.playback_url(id));
                }
            };

            processes.insert(
                id.clone(),
                ProcessSlot {
                    launch_id,
                    state: SlotState::Launching,
                },
            );

            exiting_task
        };

        let supervisor = self.clone();
        let launch_stream = id.clone();
        let source = stream.source().to_string();
        let launch = tokio::spawn(
            async move {
                if let Some(task) = exiting_task {
                    debug!(
                        "Waiting for the previous transcoder of stream {} to be cleaned up",
                        launch_stream
                    );

                    let _ = task.await;
                }

                supervisor
                    .launch_reserved(&launch_stream, &source, launch_id)
                    .await
            }
            .in_current_span(),
        );

        match launch.await {
            Ok(result) => result,
            Err(error) => {
                error!("Launch task for stream {} failed: {}", id, error);
                self.inner.release_slot(id, launch_id);
                let _ = self.inner.registry.mutate(id, |stream| {
                    stream.set_status(StreamStatus::Idle);
                    stream.set_playback_url(None);
                });

                Err(TranscoderError::LaunchInterrupted(id.clone()))
            }
        }
    }

    /// Stops the stream's transcoder, waiting until the process has exited and the stream's
    /// output directory has been removed.  Stopping a stream without a running transcoder is a
    /// no-op.
    #[instrument(skip(self), fields(stream_id = %id))]
    pub async fn stop(&self, id: &StreamId) {
        let slot = {
            let mut processes = self.inner.processes.lock();
            match processes.get(id) {
                Some(ProcessSlot {
                    state: SlotState::Running { .. },
                    ..
                }) => processes.remove(id),

                _ => None,
            }
        };

        let (stop_sender, task) = match slot {
            Some(ProcessSlot {
                state: SlotState::Running { stop_sender, task, .. },
                ..
            }) => (stop_sender, task),

            _ => {
                debug!("No transcoder to stop for stream {}", id);
                return;
            }
        };

        if !task.is_finished() {
            let _ = self
                .inner
                .registry
                .mutate(id, |stream| stream.set_status(StreamStatus::Stopping));
        }

        // The receiver is gone if the process already exited on its own
        let _ = stop_sender.send(());
        if let Err(error) = task.await {
            error!("Transcoder supervision task for stream {} failed: {}", id, error);
        }

        let _ = self.inner.registry.mutate(id, |stream| {
            stream.set_status(StreamStatus::Idle);
            stream.set_playback_url(None);
        });
    }

    /// Stops every transcoder this supervisor has launched and waits for all of them to finish
    pub async fn stop_all(&self) {
        let ids = self
            .inner
            .processes
            .lock()
            .keys()
            .cloned()
            .collect::<Vec<_>>();

        join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    /// Returns true if a transcoder process is currently alive for the stream
    pub fn is_supervising(&self, id: &StreamId) -> bool {
        match self.inner.processes.lock().get(id) {
            Some(ProcessSlot {
                state: SlotState::Running { task, exited, .. },
                ..
            }) => !exited.load(Ordering::SeqCst) && !task.is_finished(),

            Some(ProcessSlot {
                state: SlotState::Launching,
                ..
            }) => true,

            None => false,
        }
    }

    /// Removes whatever output the stream has left on disk.  Only valid once no transcoder is
    /// being supervised for the stream.
    pub async fn remove_output(&self, id: &StreamId) {
        remove_directory(&self.inner.settings.output_directory(id)).await;
    }

    /// Deletes everything under the output root and recreates it empty
    pub async fn reset_output_root(&self) {
        let root = &self.inner.settings.output_root;
        remove_directory(root).await;
        if let Err(error) = tokio::fs::create_dir_all(root).await {
            error!(
                "Failed to recreate output root '{}': {}",
                root.display(),
                error
            );
        }
    }

    /// Launches the process for a slot that was reserved with `launch_id`, and either replaces the
    /// reservation with the running process or releases it
    async fn launch_reserved(
        &self,
        id: &StreamId,
        source: &str,
        launch_id: Uuid,
    ) -> Result<String, TranscoderError> {
        match self.launch(id, source, launch_id).await {
            Ok(state) => {
                self.inner
                    .processes
                    .lock()
                    .insert(id.clone(), ProcessSlot { launch_id, state });

                Ok(self.inner.settings.playback_url(id))
            }

            Err(error) => {
                error!("Failed to start transcoder for stream {}: {}", id, error);
                self.inner.release_slot(id, launch_id);
                let _ = self.inner.registry.mutate(id, |stream| {
                    stream.set_status(StreamStatus::Idle);
                    stream.set_playback_url(None);
                });

                Err(error)
            }
        }
    }

    async fn launch(
        &self,
        id: &StreamId,
        source: &str,
        launch_id: Uuid,
    ) -> Result<SlotState, TranscoderError> {
        let settings = &self.inner.settings;
        if self
            .inner
            .registry
            .mutate(id, |stream| stream.set_status(StreamStatus::Starting))
            .is_err()
        {
            return Err(TranscoderError::NotFound(id.clone()));
        }

        let output_directory = settings.output_directory(id);
        if let Err(error) = tokio::fs::create_dir_all(&output_directory).await {
            return Err(TranscoderError::OutputDirectory {
                path: output_directory.display().to_string(),
                error,
            });
        }

        let playlist = output_directory.join(PLAYLIST_FILE_NAME);
        let args = settings.arguments.build(source, &playlist);
        let log_file = self.open_log_file(id).await;

        info!(
            launch_id = %launch_id,
            "Starting transcoder for stream {} with the following arguments: {:?}", id, args
        );

        let mut command = Command::new(&settings.executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);

        // ffmpeg writes its progress output to stderr
        if log_file.is_some() {
            command.stderr(Stdio::piped());
        } else {
            command.stderr(Stdio::null());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                remove_directory(&output_directory).await;
                return Err(TranscoderError::LaunchFailure {
                    executable: settings.executable.clone(),
                    error,
                });
            }
        };

        if let (Some(mut stderr), Some(mut log_file)) = (child.stderr.take(), log_file) {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stderr, &mut log_file).await;
            });
        }

        let playback_url = settings.playback_url(id);
        let updated = self.inner.registry.mutate(id, |stream| {
            stream.set_status(StreamStatus::Running);
            stream.set_playback_url(Some(playback_url));
        });

        if updated.is_err() {
            // The stream was removed while the process was being spawned
            warn!("Stream {} disappeared while its transcoder was launching", id);
            terminate(id, &mut child, settings.stop_grace_period).await;
            remove_directory(&output_directory).await;
            return Err(TranscoderError::NotFound(id.clone()));
        }

        let (stop_sender, stop_receiver) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(supervise(
            self.inner.clone(),
            Supervised {
                id: id.clone(),
                launch_id,
                exited: exited.clone(),
                output_directory,
            },
            child,
            stop_receiver,
        ));

        Ok(SlotState::Running {
            stop_sender,
            task,
            exited,
        })
    }

    async fn open_log_file(&self, id: &StreamId) -> Option<File> {
        let log_root = match &self.inner.settings.log_root {
            Some(root) => root.join("transcoder"),
            None => return None,
        };

        if let Err(error) = tokio::fs::create_dir_all(&log_root).await {
            warn!(
                "Could not create transcoder log directory '{}': {}",
                log_root.display(),
                error
            );

            return None;
        }

        let log_path = log_root.join(format!("{}.log", id));
        let mut log_file = match OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)
            .await
        {
            Ok(file) => file,
            Err(error) => {
                warn!(
                    "Failed to open transcoder log file '{}': {}",
                    log_path.display(),
                    error
                );

                return None;
            }
        };

        // Add a separator so we have a clear boundary when appending to an existing log file.
        // Streams that get restarted keep appending to the same log.
        let _ = log_file
            .write_all(b"\n\n------------------New Execution----------------\n\n")
            .await;
        let _ = log_file.flush().await;

        Some(log_file)
    }
}

impl SupervisorInner {
    /// Removes the stream's slot, but only if it still belongs to the given launch
    fn release_slot(&self, id: &StreamId, launch_id: Uuid) {
        let mut processes = self.processes.lock();
        if let Some(slot) = processes.get(id) {
            if slot.launch_id == launch_id {
                processes.remove(id);
            }
        }
    }
}

/// What a supervision task needs to know about the process it watches
struct Supervised {
    id: StreamId,
    launch_id: Uuid,
    exited: Arc<AtomicBool>,
    output_directory: PathBuf,
}

#[instrument(skip_all, fields(stream_id = %process.id))]
async fn supervise(
    inner: Arc<SupervisorInner>,
    process: Supervised,
    mut child: Child,
    stop_receiver: oneshot::Receiver<()>,
) {
    let Supervised {
        id,
        launch_id,
        exited,
        output_directory,
    } = process;

    let outcome = tokio::select! {
        result = child.wait() => ProcessOutcome::Exited(result),
        _ = stop_receiver => ProcessOutcome::StopRequested,
    };

    match outcome {
        ProcessOutcome::Exited(Ok(status)) => {
            warn!("Transcoder for stream {} exited unexpectedly with {}", id, status);
        }

        ProcessOutcome::Exited(Err(error)) => {
            error!("Failed waiting on transcoder for stream {}: {}", id, error);
            let _ = child.kill().await;
        }

        ProcessOutcome::StopRequested => {
            info!("Stopping transcoder for stream {}", id);
            terminate(&id, &mut child, inner.settings.stop_grace_period).await;
        }
    }

    exited.store(true, Ordering::SeqCst);
    remove_directory(&output_directory).await;

    let _ = inner.registry.mutate(&id, |stream| {
        stream.set_status(StreamStatus::Idle);
        stream.set_playback_url(None);
    });

    inner.release_slot(&id, launch_id);
    info!("Transcoder for stream {} has stopped", id);
}

/// Asks the process to exit, and kills it if it's still running after the grace period
async fn terminate(id: &StreamId, child: &mut Child, grace_period: Duration) {
    request_termination(child);

    match timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!("Transcoder for stream {} exited with {}", id, status);
        }

        Ok(Err(error)) => {
            error!("Failed waiting on transcoder for stream {}: {}", id, error);
            let _ = child.kill().await;
        }

        Err(_) => {
            warn!(
                "Transcoder for stream {} did not exit within {} ms, killing it",
                id,
                grace_period.as_millis()
            );

            if let Err(error) = child.kill().await {
                error!("Failed to kill transcoder for stream {}: {}", id, error);
            }
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: the pid belongs to a child that has not been reaped yet
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}

async fn remove_directory(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => info!("Removed output directory '{}'", path.display()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => (),
        Err(error) => error!(
            "Failed to remove output directory '{}': {}",
            path.display(),
            error
        ),
    }
}
