//! Chunked transfer reassembly.
//!
//! # Transfer Layout
//!
//! ```text
//! msg 0    "<total>"   ASCII decimal byte count, e.g. "48213"
//! msg 1..n  chunk      raw bytes, appended at the implicit offset
//! ```
//!
//! A transfer completes when exactly `total` bytes have arrived. A header of
//! `0` completes at once with an empty payload. A zero-length fragment is a
//! trailer: ignored while idle, and it aborts a transfer in progress.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use picamera_core::{ProtocolError, VideoMetadata};
use tracing::{debug, warn};

use crate::codec::{decode, CmdType};

/// Upper bound for a single transfer.
pub const DEFAULT_MAX_TRANSFER_BYTES: usize = 256 * 1024 * 1024;
/// Initial buffer reservation; the buffer grows as chunks arrive.
const INITIAL_RESERVE: usize = 64 * 1024;
const SNAPSHOT_URL_PREFIX: &str = "data:image/jpeg;base64,";

// ── TransferSink ─────────────────────────────────────────────────────────────

pub trait TransferSink {
    fn on_progress(&mut self, received: usize, total: usize);
    fn on_complete(&mut self, payload: Bytes);
}

// ── ChunkedReceiver ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Receiving,
}

#[derive(Debug)]
pub struct ChunkedReceiver {
    limit: usize,
    state: ReceiverState,
    total: usize,
    buffer: BytesMut,
}

impl Default for ChunkedReceiver {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_TRANSFER_BYTES)
    }
}

impl ChunkedReceiver {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            state: ReceiverState::Idle,
            total: 0,
            buffer: BytesMut::new(),
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Feed one fragment. On error the receiver is back in `Idle` and the
    /// fragment has been dropped.
    pub fn receive<S: TransferSink + ?Sized>(
        &mut self,
        fragment: &[u8],
        sink: &mut S,
    ) -> Result<(), ProtocolError> {
        match self.state {
            ReceiverState::Idle => self.start(fragment, sink),
            ReceiverState::Receiving => self.append(fragment, sink),
        }
    }

    pub fn reset(&mut self) {
        self.state = ReceiverState::Idle;
        self.total = 0;
        self.buffer = BytesMut::new();
    }

    fn start<S: TransferSink + ?Sized>(
        &mut self,
        header: &[u8],
        sink: &mut S,
    ) -> Result<(), ProtocolError> {
        if header.is_empty() {
            return Ok(());
        }

        let total = parse_header(header)?;
        if total > self.limit {
            return Err(ProtocolError::TransferTooLarge {
                total,
                limit: self.limit,
            });
        }
        if total == 0 {
            sink.on_complete(Bytes::new());
            return Ok(());
        }

        self.state = ReceiverState::Receiving;
        self.total = total;
        self.buffer = BytesMut::with_capacity(total.min(INITIAL_RESERVE));
        Ok(())
    }

    fn append<S: TransferSink + ?Sized>(
        &mut self,
        fragment: &[u8],
        sink: &mut S,
    ) -> Result<(), ProtocolError> {
        if fragment.is_empty() {
            debug!(
                "Trailer aborted transfer at {}/{} bytes",
                self.buffer.len(),
                self.total
            );
            self.reset();
            return Ok(());
        }

        let received = self.buffer.len();
        if received + fragment.len() > self.total {
            let err = ProtocolError::Overflow {
                received,
                fragment: fragment.len(),
                total: self.total,
            };
            self.reset();
            return Err(err);
        }

        self.buffer.extend_from_slice(fragment);
        let received = self.buffer.len();
        sink.on_progress(received, self.total);

        if received == self.total {
            let payload = std::mem::take(&mut self.buffer).freeze();
            self.reset();
            sink.on_complete(payload);
        }
        Ok(())
    }
}

fn parse_header(header: &[u8]) -> Result<usize, ProtocolError> {
    let text = std::str::from_utf8(header).map_err(|_| ProtocolError::InvalidHeader {
        reason: "not UTF-8".to_owned(),
    })?;
    text.trim()
        .parse::<usize>()
        .map_err(|e| ProtocolError::InvalidHeader {
            reason: format!("{text:?}: {e}"),
        })
}

// ── Replies ──────────────────────────────────────────────────────────────────

/// A decoded inbound event produced by a [`ReceiverSet`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Progress {
        kind: CmdType,
        received: usize,
        total: usize,
    },
    /// `data:image/jpeg;base64,...`
    Snapshot(String),
    Metadata(VideoMetadata),
    File(Bytes),
    Message(Bytes),
}

#[derive(Default)]
struct Collected {
    progress: Vec<(usize, usize)>,
    payload: Option<Bytes>,
}

impl TransferSink for Collected {
    fn on_progress(&mut self, received: usize, total: usize) {
        self.progress.push((received, total));
    }

    fn on_complete(&mut self, payload: Bytes) {
        self.payload = Some(payload);
    }
}

fn finish(kind: CmdType, payload: Bytes) -> Result<Reply, ProtocolError> {
    Ok(match kind {
        CmdType::Snapshot => Reply::Snapshot(format!(
            "{SNAPSHOT_URL_PREFIX}{}",
            STANDARD.encode(&payload)
        )),
        CmdType::Metadata => {
            let metadata = serde_json::from_slice::<VideoMetadata>(&payload).map_err(|e| {
                ProtocolError::MalformedPayload {
                    reason: format!("metadata: {e}"),
                }
            })?;
            Reply::Metadata(metadata)
        }
        CmdType::Recording => Reply::File(payload),
        _ => Reply::Message(payload),
    })
}

// ── ReceiverSet ──────────────────────────────────────────────────────────────

/// The four streamed-reply receivers attached to one data channel.
#[derive(Debug, Default)]
pub struct ReceiverSet {
    snapshot: ChunkedReceiver,
    metadata: ChunkedReceiver,
    recording: ChunkedReceiver,
    custom: ChunkedReceiver,
}

impl ReceiverSet {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            snapshot: ChunkedReceiver::with_limit(limit),
            metadata: ChunkedReceiver::with_limit(limit),
            recording: ChunkedReceiver::with_limit(limit),
            custom: ChunkedReceiver::with_limit(limit),
        }
    }

    pub fn receiver(&self, kind: CmdType) -> Option<&ChunkedReceiver> {
        match kind {
            CmdType::Snapshot => Some(&self.snapshot),
            CmdType::Metadata => Some(&self.metadata),
            CmdType::Recording => Some(&self.recording),
            CmdType::Custom => Some(&self.custom),
            _ => None,
        }
    }

    fn receiver_mut(&mut self, kind: CmdType) -> Option<&mut ChunkedReceiver> {
        match kind {
            CmdType::Snapshot => Some(&mut self.snapshot),
            CmdType::Metadata => Some(&mut self.metadata),
            CmdType::Recording => Some(&mut self.recording),
            CmdType::Custom => Some(&mut self.custom),
            _ => None,
        }
    }

    /// Decode one tagged message and route its body to the matching receiver.
    pub fn dispatch(&mut self, message: &Bytes) -> Result<Vec<Reply>, ProtocolError> {
        let (kind, body) = decode(message)?;
        let Some(receiver) = self.receiver_mut(kind) else {
            debug!("Ignoring inbound {} message ({} bytes)", kind, body.len());
            return Ok(Vec::new());
        };

        let mut collected = Collected::default();
        receiver.receive(&body, &mut collected)?;

        let mut replies: Vec<Reply> = collected
            .progress
            .into_iter()
            .map(|(received, total)| Reply::Progress {
                kind,
                received,
                total,
            })
            .collect();
        // a body that fails to parse drops only the final reply
        if let Some(payload) = collected.payload {
            match finish(kind, payload) {
                Ok(reply) => replies.push(reply),
                Err(e) => warn!("Dropping completed {} transfer: {}", kind, e),
            }
        }
        Ok(replies)
    }

    pub fn reset(&mut self) {
        for receiver in [
            &mut self.snapshot,
            &mut self.metadata,
            &mut self.recording,
            &mut self.custom,
        ] {
            if receiver.state() == ReceiverState::Receiving {
                warn!(
                    "Discarding partial transfer ({}/{} bytes)",
                    receiver.received(),
                    receiver.total()
                );
            }
            receiver.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;

    #[derive(Default)]
    struct Recorder {
        progress: Vec<(usize, usize)>,
        completed: Vec<Bytes>,
    }

    impl TransferSink for Recorder {
        fn on_progress(&mut self, received: usize, total: usize) {
            self.progress.push((received, total));
        }

        fn on_complete(&mut self, payload: Bytes) {
            self.completed.push(payload);
        }
    }

    #[test]
    fn three_byte_transfer_completes_once() {
        let mut rx = ChunkedReceiver::default();
        let mut sink = Recorder::default();

        rx.receive(b"3", &mut sink).unwrap();
        assert_eq!(rx.state(), ReceiverState::Receiving);
        rx.receive(&[0x41, 0x42, 0x43], &mut sink).unwrap();

        assert_eq!(sink.completed, vec![Bytes::from_static(&[0x41, 0x42, 0x43])]);
        assert_eq!(sink.progress, vec![(3, 3)]);
        assert_eq!(rx.state(), ReceiverState::Idle);
    }

    #[test]
    fn progress_fires_per_chunk_and_increases() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let chunks: Vec<&[u8]> = payload.chunks(1_500).collect();

        let mut rx = ChunkedReceiver::default();
        let mut sink = Recorder::default();
        rx.receive(payload.len().to_string().as_bytes(), &mut sink).unwrap();
        for chunk in &chunks {
            rx.receive(chunk, &mut sink).unwrap();
        }

        assert_eq!(sink.progress.len(), chunks.len());
        assert!(sink.progress.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(sink.progress.last(), Some(&(10_000, 10_000)));
        assert_eq!(sink.completed.len(), 1);
        assert_eq!(&sink.completed[0][..], &payload[..]);
    }

    #[test]
    fn zero_header_completes_without_progress() {
        let mut rx = ChunkedReceiver::default();
        let mut sink = Recorder::default();
        rx.receive(b"0", &mut sink).unwrap();
        assert_eq!(sink.completed, vec![Bytes::new()]);
        assert!(sink.progress.is_empty());
        assert_eq!(rx.state(), ReceiverState::Idle);
    }

    #[test]
    fn trailer_aborts_transfer_in_progress() {
        let mut rx = ChunkedReceiver::default();
        let mut sink = Recorder::default();
        rx.receive(b"10", &mut sink).unwrap();
        rx.receive(b"abc", &mut sink).unwrap();
        rx.receive(b"", &mut sink).unwrap();

        assert_eq!(rx.state(), ReceiverState::Idle);
        assert!(sink.completed.is_empty());

        // idle trailer is a no-op
        rx.receive(b"", &mut sink).unwrap();
        assert_eq!(rx.state(), ReceiverState::Idle);
    }

    #[test]
    fn bad_header_and_overflow_reset() {
        let mut rx = ChunkedReceiver::default();
        let mut sink = Recorder::default();

        let err = rx.receive(b"abc", &mut sink).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHeader { .. }));
        assert_eq!(rx.state(), ReceiverState::Idle);

        rx.receive(b"2", &mut sink).unwrap();
        let err = rx.receive(b"xyz", &mut sink).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Overflow {
                received: 0,
                fragment: 3,
                total: 2
            }
        );
        assert_eq!(rx.state(), ReceiverState::Idle);

        // a fresh transfer still works afterwards
        rx.receive(b"1", &mut sink).unwrap();
        rx.receive(b"z", &mut sink).unwrap();
        assert_eq!(sink.completed, vec![Bytes::from_static(b"z")]);
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut rx = ChunkedReceiver::with_limit(16);
        let mut sink = Recorder::default();
        let err = rx.receive(b"17", &mut sink).unwrap_err();
        assert_eq!(err, ProtocolError::TransferTooLarge { total: 17, limit: 16 });
        assert_eq!(rx.state(), ReceiverState::Idle);
    }

    #[test]
    fn receiver_set_decodes_snapshot_as_data_url() {
        let mut set = ReceiverSet::default();
        assert!(set.dispatch(&encode(CmdType::Snapshot, b"2")).unwrap().is_empty());
        let replies = set.dispatch(&encode(CmdType::Snapshot, &[0xff, 0xd8])).unwrap();

        assert_eq!(
            replies,
            vec![
                Reply::Progress {
                    kind: CmdType::Snapshot,
                    received: 2,
                    total: 2
                },
                Reply::Snapshot("data:image/jpeg;base64,/9g=".to_owned()),
            ]
        );
    }

    #[test]
    fn receiver_set_parses_metadata_json() {
        let body = br#"{"duration":"00:01:00","image":"aGk=","path":"/rec/1.mp4"}"#;
        let mut set = ReceiverSet::default();
        set.dispatch(&encode(CmdType::Metadata, body.len().to_string().as_bytes()))
            .unwrap();
        let replies = set.dispatch(&encode(CmdType::Metadata, body)).unwrap();

        let Some(Reply::Metadata(meta)) = replies.last() else {
            panic!("expected metadata, got {replies:?}");
        };
        assert_eq!(meta.path, "/rec/1.mp4");
    }

    #[test]
    fn malformed_metadata_keeps_progress_and_set_recovers() {
        let mut set = ReceiverSet::default();
        set.dispatch(&encode(CmdType::Metadata, b"3")).unwrap();
        let replies = set.dispatch(&encode(CmdType::Metadata, b"{x}")).unwrap();
        assert_eq!(
            replies,
            vec![Reply::Progress {
                kind: CmdType::Metadata,
                received: 3,
                total: 3
            }]
        );
        assert_eq!(
            set.receiver(CmdType::Metadata).map(ChunkedReceiver::state),
            Some(ReceiverState::Idle)
        );

        let body = br#"{"duration":"00:00:05","image":"","path":"/rec/2.mp4"}"#;
        set.dispatch(&encode(CmdType::Metadata, body.len().to_string().as_bytes()))
            .unwrap();
        let replies = set.dispatch(&encode(CmdType::Metadata, body)).unwrap();
        assert!(matches!(replies.last(), Some(Reply::Metadata(meta)) if meta.path == "/rec/2.mp4"));
    }

    #[test]
    fn receiver_set_keeps_kinds_independent() {
        let mut set = ReceiverSet::default();
        set.dispatch(&encode(CmdType::Recording, b"4")).unwrap();
        set.dispatch(&encode(CmdType::Custom, b"2")).unwrap();
        set.dispatch(&encode(CmdType::Recording, b"ab")).unwrap();
        let custom = set.dispatch(&encode(CmdType::Custom, b"hi")).unwrap();
        let file = set.dispatch(&encode(CmdType::Recording, b"cd")).unwrap();

        assert_eq!(custom.last(), Some(&Reply::Message(Bytes::from_static(b"hi"))));
        assert_eq!(file.last(), Some(&Reply::File(Bytes::from_static(b"abcd"))));
    }

    #[test]
    fn receiver_set_ignores_request_kinds() {
        let mut set = ReceiverSet::default();
        assert!(set.dispatch(&encode(CmdType::Connect, &[1])).unwrap().is_empty());
        assert!(set.dispatch(&Bytes::new()).is_err());
    }

    #[test]
    fn reset_discards_partial_transfers() {
        let mut set = ReceiverSet::default();
        set.dispatch(&encode(CmdType::Recording, b"4")).unwrap();
        set.reset();
        assert_eq!(
            set.receiver(CmdType::Recording).map(ChunkedReceiver::state),
            Some(ReceiverState::Idle)
        );
    }
}
