use std::collections::HashMap;
use std::sync::Arc;

use picamera_core::TrackKind;
use tracing::debug;

use crate::connection::MediaTrack;

/// Separator between the source id and the track suffix in relay stream ids
/// (`PA_xxx|TR_yyy`).
const STREAM_ID_SEPARATOR: char = '|';

/// Source identifier of a remote stream id.
pub fn source_id(stream_id: &str) -> &str {
    stream_id
        .split(STREAM_ID_SEPARATOR)
        .next()
        .unwrap_or(stream_id)
}

/// Remote tracks grouped by source. A source's entry is created on its first
/// track; later tracks with the same source are merged into it.
#[derive(Debug, Default)]
pub struct RemoteStreamTable {
    streams: HashMap<String, Vec<Arc<dyn MediaTrack>>>,
}

impl RemoteStreamTable {
    /// Add a track and return its source id. Duplicate track ids are ignored.
    pub fn add(&mut self, stream_id: &str, track: Arc<dyn MediaTrack>) -> String {
        let sid = source_id(stream_id).to_owned();
        let tracks = self.streams.entry(sid.clone()).or_default();
        if tracks.iter().any(|t| t.id() == track.id()) {
            debug!("[{}] track {} already attached", sid, track.id());
        } else {
            debug!("[{}] got {:?} track {}", sid, track.kind(), track.id());
            tracks.push(track);
        }
        sid
    }

    pub fn stream(&self, source_id: &str) -> Option<&[Arc<dyn MediaTrack>]> {
        self.streams.get(source_id).map(Vec::as_slice)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.streams.values().flatten() {
            if track.kind() == TrackKind::Audio {
                track.set_enabled(enabled);
            }
        }
    }

    /// Stop every track and forget all sources.
    pub fn clear(&mut self) {
        for track in self.streams.values().flatten() {
            track.stop();
        }
        self.streams.clear();
    }
}
