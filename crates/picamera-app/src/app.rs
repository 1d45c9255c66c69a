use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;
use clap::Parser;
use picamera::{
    Backend, CameraEvent, ChannelId, MetadataSelector, PeerConnectionState, PiCamera,
    PiCameraOptions, SignalingKind, VideoMetadata,
};
use tracing::{debug, info, warn};

/// Connect to a camera and fetch snapshots, recording metadata or files.
#[derive(Debug, Parser)]
#[command(name = "picamera", version)]
pub struct Args {
    /// JSON options file (camelCase or snake_case keys)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    device_uid: Option<String>,
    #[arg(long)]
    mqtt_host: Option<String>,
    /// Use the SFU proxy at this URL instead of the broker
    #[arg(long)]
    websocket_url: Option<String>,
    #[arg(long)]
    room_id: Option<String>,
    /// Connection watchdog in milliseconds, 0 disables it
    #[arg(long, value_name = "MS")]
    timeout: Option<u64>,
    /// Negotiate the command channel only, no media
    #[arg(long)]
    datachannel_only: bool,

    /// Request a JPEG snapshot at this quality (0-100)
    #[arg(long, value_name = "QUALITY")]
    snapshot: Option<i32>,
    /// Request metadata of the latest recording
    #[arg(long)]
    metadata: bool,
    /// Request metadata of recordings older than this file
    #[arg(long, value_name = "PATH", conflicts_with = "metadata")]
    metadata_before: Option<String>,
    /// Download a recording
    #[arg(long, value_name = "PATH")]
    fetch: Option<String>,

    /// Directory results are written to
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
    /// Terminate after this many seconds instead of when all requests finish
    #[arg(long, value_name = "SECONDS")]
    exit_after: Option<u64>,
}

impl Args {
    fn options(&self) -> Result<PiCameraOptions> {
        let mut options = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => PiCameraOptions::default(),
        };

        if let Some(uid) = &self.device_uid {
            options.device_uid = Some(uid.clone());
        }
        if let Some(host) = &self.mqtt_host {
            options.mqtt_host = Some(host.clone());
        }
        if let Some(url) = &self.websocket_url {
            options.signaling = SignalingKind::Websocket;
            options.websocket_url = Some(url.clone());
        }
        if let Some(room) = &self.room_id {
            options.room_id = Some(room.clone());
        }
        if let Some(timeout) = self.timeout {
            options.timeout = timeout;
        }
        if self.datachannel_only {
            options.datachannel_only = true;
        }
        Ok(options)
    }

    fn selector(&self) -> Option<MetadataSelector> {
        match (&self.metadata_before, self.metadata) {
            (Some(path), _) => Some(MetadataSelector::Before(path.clone())),
            (None, true) => Some(MetadataSelector::Latest),
            (None, false) => None,
        }
    }
}

// ── Outstanding requests ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Pending {
    snapshot: bool,
    metadata: bool,
    file: Option<String>,
    requested: bool,
}

impl Pending {
    fn is_done(&self) -> bool {
        self.requested && !self.snapshot && !self.metadata && self.file.is_none()
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Connect, issue the requested commands once the command channel opens,
/// save every reply, then terminate.
pub async fn run() -> Result<()> {
    let args = Args::parse();
    let options = args.options()?;
    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;

    let backend = Backend::webrtc().context("WebRTC backend unavailable")?;
    let (mut camera, mut events) = PiCamera::new(options, backend)?;
    camera.connect().await.context("signaling connect failed")?;

    let mut pending = Pending::default();
    let mut saved = 0usize;
    let exit_after = async {
        match args.exit_after {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(exit_after);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match on_event(&camera, &args, &mut pending, &mut saved, event)? {
                    Flow::Continue => {}
                    Flow::Stop => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, terminating");
                break;
            }
            _ = &mut exit_after => {
                info!("Exit timer elapsed, terminating");
                break;
            }
        }
    }

    camera.terminate().await;
    info!("Saved {} result(s) to {}", saved, args.output.display());
    Ok(())
}

fn on_event(
    camera: &PiCamera,
    args: &Args,
    pending: &mut Pending,
    saved: &mut usize,
    event: CameraEvent,
) -> Result<Flow> {
    match event {
        CameraEvent::ConnectionState(state) => {
            info!("Connection state: {}", state);
            if state == PeerConnectionState::Closed {
                return Ok(Flow::Stop);
            }
        }
        CameraEvent::DataChannelOpen(ChannelId::Command) => request(camera, args, pending),
        CameraEvent::DataChannelOpen(id) => debug!("Channel {} open", id),
        CameraEvent::Stream { source_id, tracks } => {
            info!("Stream from {}: {} track(s)", source_id, tracks.len());
        }
        CameraEvent::Progress {
            received,
            total,
            kind,
        } => {
            debug!("{}: {}/{} bytes", kind, received, total);
        }
        CameraEvent::Snapshot(url) => {
            let jpeg = decode_data_url(&url)?;
            save(&args.output.join("snapshot.jpg"), &jpeg)?;
            pending.snapshot = false;
            *saved += 1;
        }
        CameraEvent::Metadata(meta) => {
            save_metadata(&args.output, *saved, &meta)?;
            pending.metadata = false;
            *saved += 1;
        }
        CameraEvent::FileDownloaded(data) => {
            let name = pending
                .file
                .take()
                .map(|path| file_name(&path))
                .unwrap_or_else(|| "recording.bin".to_owned());
            save(&args.output.join(name), &data)?;
            *saved += 1;
        }
        CameraEvent::Message(data) => info!("Message: {}", String::from_utf8_lossy(&data)),
        CameraEvent::Timeout => warn!("Camera did not connect in time"),
        CameraEvent::SignalingError(message) => warn!("Signaling: {}", message),
        CameraEvent::Info(message) => info!("Relay: {}", message),
        CameraEvent::RoomInfo(_)
        | CameraEvent::Quality(_)
        | CameraEvent::Speaking(_)
        | CameraEvent::Participant(_) => debug!("Room event: {:?}", event),
    }

    if pending.is_done() && args.exit_after.is_none() {
        info!("All requests complete");
        return Ok(Flow::Stop);
    }
    Ok(Flow::Continue)
}

fn request(camera: &PiCamera, args: &Args, pending: &mut Pending) {
    if pending.requested {
        return;
    }
    if let Some(quality) = args.snapshot {
        info!("Requesting snapshot (quality {})", quality);
        camera.snapshot(quality);
        pending.snapshot = true;
    }
    if let Some(selector) = args.selector() {
        info!("Requesting metadata: {:?}", selector);
        camera.fetch_metadata(selector);
        pending.metadata = true;
    }
    if let Some(path) = &args.fetch {
        info!("Requesting {}", path);
        camera.fetch_file(path.clone());
        pending.file = Some(path.clone());
    }
    pending.requested = pending.snapshot || pending.metadata || pending.file.is_some();
    if !pending.requested {
        info!("Connected; press Ctrl-C to exit");
    }
}

// ── Output ─────────────────────────────────────────────────────────────────────

/// Payload of a `data:<mime>;base64,<payload>` URL.
fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    let Some((header, payload)) = url.strip_prefix("data:").and_then(|u| u.split_once(',')) else {
        bail!("not a data url");
    };
    if !header.ends_with(";base64") {
        bail!("data url is not base64: {header}");
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .context("decoding snapshot")
}

fn save(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote {} ({} bytes)", path.display(), data.len());
    Ok(())
}

fn save_metadata(dir: &Path, index: usize, meta: &VideoMetadata) -> Result<()> {
    let json = serde_json::to_vec_pretty(meta)?;
    save(&dir.join(format!("metadata-{index}.json")), &json)
}

/// Last component of a camera-side path; never `.`, `..` or empty.
fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording.bin".to_owned())
}
