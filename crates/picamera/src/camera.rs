//! The public handle.
//!
//! ```text
//! let (mut camera, mut events) = PiCamera::new(options, backend)?;
//! camera.connect().await?;
//! while let Some(event) = events.recv().await { ... camera.snapshot(30); ... }
//! camera.terminate().await;
//! ```

use bytes::Bytes;
use picamera_core::{
    PeerConnectionState, PiCameraError, PiCameraOptions, PropertyValue, SignalingKind,
};
use picamera_protocol::{MetadataSelector, DEFAULT_SNAPSHOT_QUALITY};
use picamera_signaling::{MqttSignaling, SignalingAdapter, WebSocketSignaling};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::events::CameraEvent;
use crate::orchestrator::{Orchestrator, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Terminated,
}

/// A connection to one camera. Single use: after [`terminate`](Self::terminate)
/// create a new `PiCamera` to reconnect.
pub struct PiCamera {
    options: PiCameraOptions,
    backend: Backend,
    events: mpsc::UnboundedSender<CameraEvent>,
    status_tx: Option<watch::Sender<PeerConnectionState>>,
    status: watch::Receiver<PeerConnectionState>,
    requests: Option<mpsc::UnboundedSender<Request>>,
    task: Option<JoinHandle<()>>,
    lifecycle: Lifecycle,
}

impl PiCamera {
    /// Validate `options` and build an idle camera plus its event stream.
    pub fn new(
        options: PiCameraOptions,
        backend: Backend,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CameraEvent>), PiCameraError> {
        options.validate()?;
        let (events, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PeerConnectionState::New);
        let camera = Self {
            options,
            backend,
            events,
            status_tx: Some(status_tx),
            status,
            requests: None,
            task: None,
            lifecycle: Lifecycle::Idle,
        };
        Ok((camera, rx))
    }

    pub fn options(&self) -> &PiCameraOptions {
        &self.options
    }

    fn signaling(&self) -> Result<Box<dyn SignalingAdapter>, PiCameraError> {
        Ok(match self.options.signaling {
            SignalingKind::Mqtt => Box::new(MqttSignaling::new(
                &self.options,
                self.backend.broker.clone(),
            )?),
            SignalingKind::Websocket => Box::new(WebSocketSignaling::new(
                &self.options,
                self.backend.socket.clone(),
            )?),
        })
    }

    /// Open signaling and start negotiating. The watchdog starts now.
    ///
    /// Fails if signaling cannot be opened (the camera stays idle and may be
    /// connected again) or if called twice.
    pub async fn connect(&mut self) -> Result<(), PiCameraError> {
        match self.lifecycle {
            Lifecycle::Running => return Err(PiCameraError::AlreadyConnected),
            Lifecycle::Terminated => return Err(PiCameraError::Terminated),
            Lifecycle::Idle => {}
        }

        let mut signaling = self.signaling()?;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        signaling.connect(signal_tx).await?;

        let Some(status_tx) = self.status_tx.take() else {
            return Err(PiCameraError::Terminated);
        };
        let (requests, task) = Orchestrator::spawn(
            self.options.clone(),
            self.backend.clone(),
            signaling,
            signal_rx,
            self.events.clone(),
            status_tx,
        );
        self.requests = Some(requests);
        self.task = Some(task);
        self.lifecycle = Lifecycle::Running;
        info!("PiCamera connecting via {:?}", self.options.signaling);
        Ok(())
    }

    /// Close every session and the signaling link, then report `closed`.
    /// Calling it again, or after a timeout already closed everything, does
    /// nothing.
    pub async fn terminate(&mut self) {
        if self.lifecycle == Lifecycle::Terminated {
            return;
        }
        self.lifecycle = Lifecycle::Terminated;

        let Some(requests) = self.requests.take() else {
            // never connected
            self.status_tx.take();
            let _ = self.events.send(CameraEvent::ConnectionState(PeerConnectionState::Closed));
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if requests.send(Request::Terminate(done_tx)).is_ok() {
            let _ = done_rx.await;
        } else {
            debug!("Orchestrator already stopped");
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// The commander's state (the subscriber's in SFU topology); `new` before
    /// any session exists and `closed` after termination.
    pub fn status(&self) -> PeerConnectionState {
        if self.lifecycle == Lifecycle::Terminated {
            return PeerConnectionState::Closed;
        }
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == PeerConnectionState::Connected
    }

    fn request(&self, request: Request) {
        match &self.requests {
            Some(requests) => {
                if requests.send(request).is_err() {
                    debug!("Request dropped: connection closed");
                }
            }
            None => debug!("Request dropped: not connected"),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────────
    //
    // Fire-and-forget: dropped unless the command channel is open. Replies
    // arrive as events.

    /// Quality is clamped to 0..=100.
    pub fn snapshot(&self, quality: i32) {
        self.request(Request::Snapshot(quality));
    }

    pub fn snapshot_default(&self) {
        self.snapshot(DEFAULT_SNAPSHOT_QUALITY);
    }

    /// `key` is a [`picamera_core::CameraPropertyKey`] or a raw control id.
    pub fn set_camera_property(&self, key: impl Into<u32>, value: impl Into<PropertyValue>) {
        self.request(Request::SetCameraProperty {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn fetch_metadata(&self, selector: MetadataSelector) {
        self.request(Request::FetchMetadata(selector));
    }

    pub fn fetch_file(&self, path: impl Into<String>) {
        self.request(Request::FetchFile(path.into()));
    }

    pub fn send_message(&self, data: impl Into<Bytes>) {
        self.request(Request::SendMessage(data.into()));
    }

    /// `None` flips the current setting.
    pub fn toggle_mic(&self, enabled: Option<bool>) {
        self.request(Request::ToggleMic(enabled));
    }

    /// `None` flips the current setting.
    pub fn toggle_speaker(&self, enabled: Option<bool>) {
        self.request(Request::ToggleSpeaker(enabled));
    }
}
