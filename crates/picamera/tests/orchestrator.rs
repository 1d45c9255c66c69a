//! End-to-end connection flows against in-memory peers, broker and socket.

use std::sync::Arc;
use std::time::Duration;

use picamera::{
    Backend, CameraEvent, ChannelId, PeerConnectionState, PiCamera, PiCameraError,
    PiCameraOptions, SignalingKind,
};
use picamera_core::{IceCandidateInit, SessionDescription, SessionRole};
use picamera_protocol::{encode, CmdType};
use picamera_signaling::mock::{MockBroker, MockSocket};
use picamera_signaling::{Action, BrokerRequest, SocketRequest};
use picamera_webrtc::mock::{
    MockMediaSource, MockPeerConnection, MockPeerFactory, PeerCall, MOCK_ANSWER_SDP,
    MOCK_OFFER_SDP,
};
use picamera_webrtc::{MediaTrack, PeerEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time;

// ── Harness ──────────────────────────────────────────────────────────────────

/// Let every spawned task run to idle.
async fn settle() {
    time::sleep(Duration::from_millis(1)).await;
}

fn drain(rx: &mut UnboundedReceiver<CameraEvent>) -> Vec<CameraEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn mqtt_options(timeout: u64) -> PiCameraOptions {
    PiCameraOptions {
        device_uid: Some("cam-01".into()),
        mqtt_host: Some("broker.example".into()),
        timeout,
        ..Default::default()
    }
}

fn sfu_options() -> PiCameraOptions {
    PiCameraOptions {
        signaling: SignalingKind::Websocket,
        websocket_url: Some("wss://sfu.example".into()),
        api_key: Some("key".into()),
        user_id: Some("viewer".into()),
        room_id: Some("cam-01".into()),
        timeout: 0,
        ..Default::default()
    }
}

struct Rig {
    peers: Arc<MockPeerFactory>,
    broker: Arc<MockBroker>,
    socket: Arc<MockSocket>,
}

impl Rig {
    fn new() -> Self {
        Self {
            peers: MockPeerFactory::new(),
            broker: MockBroker::new(),
            socket: MockSocket::new(),
        }
    }

    fn backend(&self) -> Backend {
        Backend::new(self.peers.clone(), Arc::new(MockMediaSource::default()))
            .with_broker(self.broker.clone())
            .with_socket(self.socket.clone())
    }

    fn camera(&self, options: PiCameraOptions) -> (PiCamera, UnboundedReceiver<CameraEvent>) {
        PiCamera::new(options, self.backend()).unwrap()
    }

    fn peer(&self, role: SessionRole) -> Arc<MockPeerConnection> {
        self.peers.peer(role).unwrap()
    }

    /// `{device}/{topic}/{client id}` as subscribed by the adapter.
    fn topic(&self, topic: &str) -> String {
        let (settings, _) = self.broker.opened().unwrap();
        format!("cam-01/{topic}/{}", settings.client_id)
    }
}

fn is_closed(event: &CameraEvent) -> bool {
    matches!(event, CameraEvent::ConnectionState(PeerConnectionState::Closed))
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn watchdog_times_out_once_then_closes() {
    let rig = Rig::new();
    let (mut camera, mut events) = rig.camera(mqtt_options(100));
    camera.connect().await.unwrap();
    rig.broker.accept();

    time::sleep(Duration::from_millis(99)).await;
    assert!(drain(&mut events).is_empty());

    time::sleep(Duration::from_millis(50)).await;
    let fired = drain(&mut events);
    assert_eq!(fired.len(), 2);
    assert!(matches!(fired[0], CameraEvent::Timeout));
    assert!(is_closed(&fired[1]));
    assert_eq!(camera.status(), PeerConnectionState::Closed);

    // the commander was closed and the broker released
    assert!(rig.peer(SessionRole::Commander).calls().contains(&PeerCall::Close));
    assert!(rig.broker.requests().contains(&BrokerRequest::Disconnect));

    camera.terminate().await;
    time::sleep(Duration::from_secs(1)).await;
    assert!(drain(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn zero_timeout_disables_watchdog() {
    let rig = Rig::new();
    let (mut camera, mut events) = rig.camera(mqtt_options(0));
    camera.connect().await.unwrap();
    rig.broker.accept();

    time::sleep(Duration::from_secs(60)).await;
    assert!(drain(&mut events).is_empty());
    assert_eq!(camera.status(), PeerConnectionState::New);
}

#[tokio::test(start_paused = true)]
async fn terminate_is_idempotent() {
    let rig = Rig::new();
    let (mut camera, mut events) = rig.camera(mqtt_options(0));
    camera.connect().await.unwrap();
    rig.broker.accept();
    settle().await;

    camera.terminate().await;
    camera.terminate().await;
    settle().await;

    let closed: Vec<_> = drain(&mut events).into_iter().filter(is_closed).collect();
    assert_eq!(closed.len(), 1);
    assert!(matches!(camera.connect().await, Err(PiCameraError::Terminated)));
}

#[tokio::test]
async fn terminate_before_connect_reports_closed() {
    let rig = Rig::new();
    let (mut camera, mut events) = rig.camera(mqtt_options(0));
    camera.terminate().await;
    camera.terminate().await;

    let fired = drain(&mut events);
    assert_eq!(fired.len(), 1);
    assert!(is_closed(&fired[0]));
    assert!(rig.broker.opened().is_none());
}

#[tokio::test]
async fn connect_twice_is_rejected() {
    let rig = Rig::new();
    let (mut camera, _events) = rig.camera(mqtt_options(0));
    camera.connect().await.unwrap();
    assert!(matches!(camera.connect().await, Err(PiCameraError::AlreadyConnected)));
    camera.terminate().await;
}

#[tokio::test]
async fn refused_broker_leaves_camera_idle() {
    let peers = MockPeerFactory::new();
    let backend = Backend::new(peers.clone(), Arc::new(MockMediaSource::default()))
        .with_broker(MockBroker::refusing());
    let (mut camera, _events) = PiCamera::new(mqtt_options(0), backend).unwrap();

    assert!(matches!(camera.connect().await, Err(PiCameraError::Signaling(_))));
    assert_eq!(camera.status(), PeerConnectionState::New);
    assert!(peers.peers().is_empty());
}

#[test]
fn invalid_options_are_rejected() {
    let rig = Rig::new();
    let options = PiCameraOptions {
        mqtt_host: None,
        ..mqtt_options(0)
    };
    assert!(matches!(
        PiCamera::new(options, rig.backend()),
        Err(PiCameraError::ConfigurationInvalid { .. })
    ));
}

// ── Direct topology ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn direct_flow_negotiates_over_broker() {
    let rig = Rig::new();
    let (mut camera, mut events) = rig.camera(mqtt_options(100));
    camera.connect().await.unwrap();
    rig.broker.accept();
    settle().await;

    // offer published on the session's sdp topic
    let requests = rig.broker.requests();
    assert_eq!(requests.len(), 1);
    let BrokerRequest::Publish { topic, payload } = &requests[0] else {
        panic!("unexpected {:?}", requests[0]);
    };
    assert_eq!(topic, &format!("{}/offer", rig.topic("sdp")));
    let offer: serde_json::Value = serde_json::from_slice(payload).unwrap();
    assert_eq!(offer["type"], "offer");
    assert_eq!(offer["sdp"], MOCK_OFFER_SDP);

    // a candidate ahead of the answer is queued, then flushed
    rig.broker
        .publish(&rig.topic("ice"), &br#"{"candidate":"candidate:remote","sdpMid":"0"}"#[..]);
    rig.broker
        .publish(&rig.topic("sdp"), &br#"{"type":"answer","sdp":"v=0 answer"}"#[..]);
    settle().await;

    let commander = rig.peer(SessionRole::Commander);
    let calls = commander.calls();
    let remote = calls
        .iter()
        .position(|c| *c == PeerCall::SetRemoteDescription(SessionDescription::answer("v=0 answer")))
        .unwrap();
    assert!(matches!(&calls[remote + 1], PeerCall::AddIceCandidate(c) if c.candidate == "candidate:remote"));

    // local candidates go out, empty end-of-candidates markers do not
    commander.emit(PeerEvent::IceCandidate(IceCandidateInit::new("candidate:local")));
    commander.emit(PeerEvent::IceCandidate(IceCandidateInit::new("")));
    settle().await;
    let requests = rig.broker.requests();
    assert_eq!(requests.len(), 1);
    assert!(matches!(
        &requests[0],
        BrokerRequest::Publish { topic, .. } if *topic == format!("{}/offer", rig.topic("ice"))
    ));

    commander.set_state(PeerConnectionState::Connected);
    settle().await;
    assert!(camera.is_connected());
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, CameraEvent::ConnectionState(PeerConnectionState::Connected))));

    // broker released once the commander is up
    let requests = rig.broker.requests();
    assert!(matches!(&requests[0], BrokerRequest::Unsubscribe(_)));
    assert!(matches!(&requests[1], BrokerRequest::Unsubscribe(_)));
    assert_eq!(requests[2], BrokerRequest::Disconnect);

    // watchdog cleared
    time::sleep(Duration::from_millis(200)).await;
    assert!(!drain(&mut events).iter().any(|e| matches!(e, CameraEvent::Timeout)));

    commander.open_channel("command");
    settle().await;
    assert!(matches!(
        drain(&mut events).as_slice(),
        [CameraEvent::DataChannelOpen(ChannelId::Command)]
    ));

    camera.snapshot(30);
    settle().await;
    let channel = commander.channel("command").unwrap();
    assert_eq!(channel.sent(), vec![bytes::Bytes::from_static(&[1, 30])]);

    commander.deliver("command", encode(CmdType::Snapshot, b"2"));
    commander.deliver("command", encode(CmdType::Snapshot, &[0xff, 0xd8]));
    settle().await;
    let replies = drain(&mut events);
    assert!(matches!(
        replies[0],
        CameraEvent::Progress { received: 2, total: 2, kind: CmdType::Snapshot }
    ));
    assert!(matches!(&replies[1], CameraEvent::Snapshot(url) if url == "data:image/jpeg;base64,/9g="));

    camera.terminate().await;
    // the camera is told we are leaving before the channel closes
    assert_eq!(channel.sent().last().map(|m| m.to_vec()), Some(vec![0, 0]));
    assert!(channel.is_closed());
    assert!(drain(&mut events).iter().any(is_closed));
}

#[tokio::test(start_paused = true)]
async fn failed_commander_terminates() {
    let rig = Rig::new();
    let (mut camera, mut events) = rig.camera(mqtt_options(0));
    camera.connect().await.unwrap();
    rig.broker.accept();
    settle().await;

    rig.peer(SessionRole::Commander)
        .set_state(PeerConnectionState::Failed);
    settle().await;

    let fired = drain(&mut events);
    assert!(matches!(
        fired[0],
        CameraEvent::ConnectionState(PeerConnectionState::Failed)
    ));
    assert!(is_closed(fired.last().unwrap()));
    assert_eq!(camera.status(), PeerConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn toggles_flip_local_audio() {
    let media = Arc::new(MockMediaSource::default());
    let broker = MockBroker::new();
    let backend = Backend::new(MockPeerFactory::new(), media.clone()).with_broker(broker.clone());
    let (mut camera, _events) = PiCamera::new(mqtt_options(0), backend).unwrap();
    camera.connect().await.unwrap();
    broker.accept();
    settle().await;

    let mic = media.issued().pop().unwrap();
    assert!(mic.is_enabled());

    camera.toggle_mic(None);
    settle().await;
    assert!(!mic.is_enabled());

    camera.toggle_mic(Some(true));
    settle().await;
    assert!(mic.is_enabled());

    camera.terminate().await;
    assert!(mic.is_stopped());
}

// ── SFU topology ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sfu_flow_negotiates_both_legs() {
    let rig = Rig::new();
    let (mut camera, mut events) = rig.camera(sfu_options());
    camera.connect().await.unwrap();
    settle().await;
    assert_eq!(
        rig.socket.url().unwrap().as_str(),
        "wss://sfu.example/rtc?apiKey=key&userId=viewer&roomId=cam-01"
    );
    assert!(rig.peers.peers().is_empty());

    rig.socket.push("join", r#"{"urls":["stun:stun.example:3478"]}"#);
    settle().await;

    let publisher = rig.peer(SessionRole::Publisher);
    let subscriber = rig.peer(SessionRole::Subscriber);
    assert_eq!(publisher.config().ice_servers[0].urls, vec!["stun:stun.example:3478"]);
    assert_eq!(subscriber.config().ice_servers, publisher.config().ice_servers);

    let sent = rig.socket.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].action, Action::Offer);
    assert_eq!(sent[0].message, MOCK_OFFER_SDP);

    rig.socket.push("answer", "v=0 publisher answer");
    rig.socket.push("offer", "v=0 subscriber offer");
    rig.socket.push(
        "trickle",
        r#"{"target":"SUBSCRIBER","candidateInit":{"candidate":"candidate:remote"}}"#,
    );
    settle().await;

    assert!(publisher.calls().contains(&PeerCall::SetRemoteDescription(
        SessionDescription::answer("v=0 publisher answer")
    )));
    assert!(subscriber.calls().contains(&PeerCall::SetRemoteDescription(
        SessionDescription::offer("v=0 subscriber offer")
    )));
    assert_eq!(subscriber.applied_candidates(), vec!["candidate:remote"]);

    publisher.emit(PeerEvent::IceCandidate(IceCandidateInit::new("candidate:pub")));
    settle().await;
    let sent = rig.socket.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].action, Action::Answer);
    assert_eq!(sent[0].message, MOCK_ANSWER_SDP);
    assert_eq!(sent[1].action, Action::TricklePublisher);
    assert_eq!(sent[1].message, "candidate:pub");

    // only the subscriber leg drives the reported state
    publisher.set_state(PeerConnectionState::Connected);
    settle().await;
    assert!(drain(&mut events).is_empty());
    subscriber.set_state(PeerConnectionState::Connected);
    settle().await;
    assert!(camera.is_connected());

    // the proxy stays up for room notifications
    rig.socket
        .push("participant", r#"[{"sid":"PA_1","id":"cam","state":"JOINED"}]"#);
    rig.socket.push("error", "room is full");
    settle().await;
    let fired = drain(&mut events);
    assert!(matches!(fired[0], CameraEvent::ConnectionState(PeerConnectionState::Connected)));
    assert!(matches!(&fired[1], CameraEvent::Participant(list) if list.len() == 1));
    assert!(matches!(&fired[2], CameraEvent::SignalingError(m) if m == "room is full"));

    camera.terminate().await;
    let requests = rig.socket.requests();
    assert!(matches!(&requests[0], SocketRequest::Text(text) if text.contains("leave")));
    assert_eq!(requests[1], SocketRequest::Close);
    assert!(publisher.calls().contains(&PeerCall::Close));
    assert!(subscriber.calls().contains(&PeerCall::Close));
    assert!(drain(&mut events).iter().any(is_closed));
}

#[tokio::test(start_paused = true)]
async fn relay_leave_releases_socket() {
    let rig = Rig::new();
    let (mut camera, _events) = rig.camera(sfu_options());
    camera.connect().await.unwrap();
    rig.socket.push("join", r#"{"urls":["stun:stun.example:3478"]}"#);
    settle().await;
    let _ = rig.socket.sent();

    rig.socket.push("leave", "");
    settle().await;
    let requests = rig.socket.requests();
    assert!(matches!(&requests[0], SocketRequest::Text(text) if text.contains("leave")));
    assert_eq!(requests[1], SocketRequest::Close);

    camera.terminate().await;
}
