extern crate pest;
#[macro_use]
extern crate pest_derive;

pub mod config;
pub mod inference;
pub mod manager;
pub mod registry;
pub mod transcoder;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Unique identifier for a tracked stream.  Identifiers are issued by the stream registry, stay
/// the same for the whole lifetime of the stream, and are never handed out a second time within
/// the same process run.
///
/// The identifier doubles as the name of the stream's output directory, and is therefore also
/// part of the stream's playback url.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheme of the only transport this system transcodes and analyzes.
pub const ELIGIBLE_SCHEME: &str = "rtsp://";

/// Returns true if the source uses the streaming transport this system actively processes.
/// Streams with any other source are tracked but left inert.
pub fn is_eligible_source(source: &str) -> bool {
    match source.get(..ELIGIBLE_SCHEME.len()) {
        Some(scheme) => scheme.eq_ignore_ascii_case(ELIGIBLE_SCHEME),
        None => false,
    }
}
