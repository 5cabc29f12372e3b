//! The stream registry holds the authoritative set of tracked streams.  It is the only piece of
//! state shared between the stream manager and the per-stream workers, and every read or write of
//! a record goes through it.
//!
//! All operations take a single short critical section.  Callers never get a reference into the
//! registry, they get a copy of the record, and updates are applied through `mutate()` with a
//! closure that runs while the lock is held.  That closure must only touch in-memory fields.

use crate::StreamId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::info;

/// Number of alerts retained per stream when no capacity is specified
pub const DEFAULT_ALERT_CAPACITY: usize = 100;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No stream exists with the id '{0}'")]
    NotFound(StreamId),
}

/// Where a stream is within its processing lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// A tracked video source and the state derived from transcoding and analyzing it.
#[derive(Clone, Debug, Serialize)]
pub struct Stream {
    id: StreamId,
    name: String,
    source: String,
    status: StreamStatus,

    #[serde(rename = "detections")]
    detection_count: u64,

    alerts: VecDeque<String>,

    #[serde(rename = "hls_url")]
    playback_url: Option<String>,

    last_update: DateTime<Utc>,

    #[serde(skip)]
    sequence: u64,

    #[serde(skip)]
    alert_capacity: usize,
}

impl Stream {
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    /// Total number of detections made across all completed inference cycles
    pub fn detection_count(&self) -> u64 {
        self.detection_count
    }

    /// The most recent alerts, oldest first.  Only the newest alerts are kept once the registry's
    /// alert capacity has been reached.
    pub fn alerts(&self) -> &VecDeque<String> {
        &self.alerts
    }

    /// Url the stream's playlist can be played from.  Only set while a transcoder is active.
    pub fn playback_url(&self) -> Option<&str> {
        self.playback_url.as_deref()
    }

    /// When the detection count last changed (or when the stream was created if it never has)
    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub(crate) fn set_status(&mut self, status: StreamStatus) {
        self.status = status;
    }

    pub(crate) fn set_playback_url(&mut self, url: Option<String>) {
        self.playback_url = url;
    }

    /// Folds the labels from a single inference cycle into the record.  Each label produces one
    /// `"<label> detected"` alert and one increment of the detection count.  Nothing changes if
    /// no labels are passed in.
    pub fn record_detections<'a>(&mut self, labels: impl IntoIterator<Item = &'a str>) {
        let mut detected = 0;
        for label in labels {
            if self.alert_capacity > 0 {
                if self.alerts.len() >= self.alert_capacity {
                    self.alerts.pop_front();
                }

                self.alerts.push_back(format!("{} detected", label));
            }

            detected += 1;
        }

        if detected > 0 {
            self.detection_count = self.detection_count.saturating_add(detected);
            self.last_update = Utc::now();
        }
    }
}

struct RegistryState {
    next_id: u64,
    streams: HashMap<StreamId, Stream>,
}

/// Thread safe store of all tracked streams
pub struct StreamRegistry {
    state: Mutex<RegistryState>,
    alert_capacity: usize,
}

impl StreamRegistry {
    pub fn new() -> Self {
        StreamRegistry::with_alert_capacity(DEFAULT_ALERT_CAPACITY)
    }

    /// Creates a registry whose records retain at most `alert_capacity` alerts each
    pub fn with_alert_capacity(alert_capacity: usize) -> Self {
        StreamRegistry {
            state: Mutex::new(RegistryState {
                next_id: 1,
                streams: HashMap::new(),
            }),
            alert_capacity,
        }
    }

    /// Adds a new stream in the `Idle` state and returns a copy of it.  The id is issued inside
    /// the same critical section as the insert, so concurrent creates never share an id.
    pub fn create(&self, name: String, source: String) -> Stream {
        let mut state = self.state.lock();
        let sequence = state.next_id;
        state.next_id += 1;

        let stream = Stream {
            id: StreamId(sequence.to_string()),
            name,
            source,
            status: StreamStatus::Idle,
            detection_count: 0,
            alerts: VecDeque::new(),
            playback_url: None,
            last_update: Utc::now(),
            sequence,
            alert_capacity: self.alert_capacity,
        };

        state.streams.insert(stream.id.clone(), stream.clone());
        info!(stream_id = %stream.id, "Stream '{}' registered with id {}", stream.name, stream.id);

        stream
    }

    pub fn get(&self, id: &StreamId) -> Result<Stream, RegistryError> {
        let state = self.state.lock();
        match state.streams.get(id) {
            Some(stream) => Ok(stream.clone()),
            None => Err(RegistryError::NotFound(id.clone())),
        }
    }

    pub fn contains(&self, id: &StreamId) -> bool {
        self.state.lock().streams.contains_key(id)
    }

    /// Point in time copy of every tracked stream, in the order they were created
    pub fn list(&self) -> Vec<Stream> {
        let mut streams = {
            let state = self.state.lock();
            state.streams.values().cloned().collect::<Vec<_>>()
        };

        streams.sort_by_key(|stream| stream.sequence);
        streams
    }

    /// Ids of every tracked stream, in the order they were created
    pub fn ids(&self) -> Vec<StreamId> {
        self.list().into_iter().map(|stream| stream.id).collect()
    }

    /// Removes the stream, returning whether it existed
    pub fn delete(&self, id: &StreamId) -> bool {
        let removed = self.state.lock().streams.remove(id).is_some();
        if removed {
            info!(stream_id = %id, "Stream {} removed from the registry", id);
        }

        removed
    }

    /// Applies the update to the stream within a single critical section and returns a copy of
    /// the updated record.
    pub fn mutate(
        &self,
        id: &StreamId,
        update: impl FnOnce(&mut Stream),
    ) -> Result<Stream, RegistryError> {
        let mut state = self.state.lock();
        match state.streams.get_mut(id) {
            Some(stream) => {
                update(stream);
                Ok(stream.clone())
            }

            None => Err(RegistryError::NotFound(id.clone())),
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        StreamRegistry::new()
    }
}
