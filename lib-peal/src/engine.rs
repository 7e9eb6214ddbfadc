use std::{
  collections::HashMap,
  fmt,
  path::PathBuf,
  process::Stdio,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
  net::TcpStream,
  process::{Child, Command},
  sync::{mpsc, oneshot, Mutex},
  task::JoinHandle,
  time::{self, Instant},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use crate::{config::SessionConfig, ice::IceCandidate, sdp::SdpType};

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const STREAM_MAX_RETRIES: u32 = 3;
const STREAM_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// ICE/DTLS connection state reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
  New,
  Checking,
  Connected,
  Completed,
  Failed,
  Disconnected,
  Closed,
}

impl ConnectionState {
  pub fn as_str(&self) -> &'static str {
    match self {
      ConnectionState::New => "new",
      ConnectionState::Checking => "checking",
      ConnectionState::Connected => "connected",
      ConnectionState::Completed => "completed",
      ConnectionState::Failed => "failed",
      ConnectionState::Disconnected => "disconnected",
      ConnectionState::Closed => "closed",
    }
  }
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An audio capture or playback device known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
  pub name: String,
  pub description: String,
  pub device_class: String,
}

/// Session statistics as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
  #[serde(default)]
  pub connection_state: String,
  #[serde(default)]
  pub ice_connection_state: String,
  #[serde(default)]
  pub ice_gathering_state: String,
  #[serde(default)]
  pub bytes_sent: u64,
  #[serde(default)]
  pub bytes_received: u64,
  #[serde(default)]
  pub bandwidth_kbps: f64,
  #[serde(default)]
  pub local_candidates: Vec<String>,
  #[serde(default)]
  pub remote_candidates: Vec<String>,
  #[serde(default)]
  pub connection_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case", tag = "command")]
pub(crate) enum EngineCommand {
  CreateSession {
    session_id: String,
    #[serde(flatten)]
    config: SessionConfig,
  },
  CreateOffer {
    session_id: String,
  },
  CreateAnswer {
    session_id: String,
  },
  SetRemoteDescription {
    session_id: String,
    sdp: String,
    sdp_type: String,
  },
  AddIceCandidate {
    session_id: String,
    #[serde(flatten)]
    candidate: IceCandidate,
  },
  EndSession {
    session_id: String,
  },
  SetMute {
    session_id: String,
    muted: bool,
  },
  ListAudioDevices,
  GetStats {
    session_id: String,
  },
  Heartbeat,
  Shutdown,
}

#[derive(Debug, Serialize)]
struct EngineRequest {
  id: u64,
  #[serde(flatten)]
  command: EngineCommand,
}

#[derive(Debug, Default, Deserialize)]
struct EngineReply {
  id: u64,
  #[serde(default)]
  error: Option<String>,
  #[serde(default)]
  sdp: Option<String>,
  #[serde(default)]
  devices: Option<Vec<AudioDevice>>,
  #[serde(default)]
  stats: Option<SessionStats>,
}

/// One event on a session's ordered event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "event")]
pub enum EngineEvent {
  IceCandidate {
    #[serde(flatten)]
    candidate: IceCandidate,
  },
  ConnectionState {
    state: ConnectionState,
  },
}

#[derive(Debug, Deserialize)]
struct EngineEventFrame {
  session_id: String,
  #[serde(flatten)]
  event: EngineEvent,
}

/// The media engine as seen by the call core: request/reply operations plus
/// an ordered per-session event stream. Implemented by [`EngineClient`] for
/// the real out-of-process engine and by fakes in tests.
#[async_trait]
pub trait MediaEngine: Send + Sync {
  async fn create_session(&self, session_id: &str, config: &SessionConfig) -> Result<()>;
  async fn create_offer(&self, session_id: &str) -> Result<String>;
  async fn create_answer(&self, session_id: &str) -> Result<String>;
  async fn set_remote_description(&self, session_id: &str, sdp: &str, sdp_type: SdpType)
    -> Result<()>;
  async fn add_ice_candidate(&self, session_id: &str, candidate: &IceCandidate) -> Result<()>;
  async fn end_session(&self, session_id: &str) -> Result<()>;
  async fn set_mute(&self, session_id: &str, muted: bool) -> Result<()>;
  async fn list_audio_devices(&self) -> Result<Vec<AudioDevice>>;
  async fn stats(&self, session_id: &str) -> Result<SessionStats>;
  async fn events(&self, session_id: &str) -> Result<mpsc::Receiver<EngineEvent>>;
}

/// JSON-over-WebSocket client for the media engine's control endpoint.
#[derive(Clone)]
pub struct EngineClient {
  url: String,
  tx: mpsc::Sender<Message>,
  pending: Arc<Mutex<HashMap<u64, oneshot::Sender<EngineReply>>>>,
  next_id: Arc<AtomicU64>,
  streams: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl fmt::Debug for EngineClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EngineClient").field("url", &self.url).finish()
  }
}

impl EngineClient {
  pub async fn connect(url: &str) -> Result<Self> {
    let (websocket, _response) = tokio_tungstenite::connect_async(url)
      .await
      .context("failed to connect to media engine")?;
    info!("connected to media engine at {}", url);

    let (mut sink, mut stream) = websocket.split();
    let (tx, rx) = mpsc::channel(64);
    let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<EngineReply>>>> =
      Arc::new(Mutex::new(HashMap::new()));

    let send_task = tokio::spawn(async move {
      let mut rx = ReceiverStream::new(rx);
      while let Some(message) = rx.next().await {
        sink.send(message).await?;
      }
      Ok::<_, anyhow::Error>(())
    });

    let recv_task = {
      let pending = pending.clone();
      tokio::spawn(async move {
        while let Some(message) = stream.next().await {
          match message? {
            Message::Text(text) => {
              debug!("engine  <<< {}", text);
              match serde_json::from_str::<EngineReply>(&text) {
                Ok(reply) => {
                  if let Some(waiter) = pending.lock().await.remove(&reply.id) {
                    let _ = waiter.send(reply);
                  }
                  else {
                    debug!("engine reply for unknown request id {}", reply.id);
                  }
                },
                Err(e) => warn!("failed to parse engine reply: {:?}\nframe: {}", e, text),
              }
            },
            Message::Close(_) => {
              debug!("engine control connection closed");
              break;
            },
            _ => {},
          }
        }
        Ok::<_, anyhow::Error>(())
      })
    };

    tokio::spawn(async move {
      tokio::select! {
        res = recv_task => if let Ok(Err(e)) = res {
          error!("engine recv loop: {:?}", e);
        },
        res = send_task => if let Ok(Err(e)) = res {
          error!("engine send loop: {:?}", e);
        },
      };
    });

    Ok(Self {
      url: url.trim_end_matches('/').to_owned(),
      tx,
      pending,
      next_id: Arc::new(AtomicU64::new(1)),
      streams: Arc::new(Mutex::new(HashMap::new())),
    })
  }

  async fn request(&self, command: EngineCommand) -> Result<EngineReply> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (reply_tx, reply_rx) = oneshot::channel();
    self.pending.lock().await.insert(id, reply_tx);

    let json = serde_json::to_string(&EngineRequest { id, command })?;
    debug!("engine  >>> {}", json);
    if self.tx.send(Message::Text(json)).await.is_err() {
      self.pending.lock().await.remove(&id);
      bail!("engine control connection closed");
    }

    let reply = reply_rx
      .await
      .context("engine control connection closed before reply")?;
    if let Some(error) = reply.error {
      bail!("engine error: {}", error);
    }
    Ok(reply)
  }

  pub(crate) async fn heartbeat(&self) -> Result<()> {
    self.request(EngineCommand::Heartbeat).await?;
    Ok(())
  }

  pub(crate) async fn shutdown(&self) -> Result<()> {
    self.request(EngineCommand::Shutdown).await?;
    Ok(())
  }
}

fn is_unavailable(error: &WsError) -> bool {
  match error {
    WsError::Io(e) => matches!(
      e.kind(),
      std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::TimedOut
    ),
    _ => false,
  }
}

/// Consume a session's event socket, forwarding events in order. Transient
/// unavailability is retried with exponential backoff; anything else ends
/// the stream. Dropping the returned sender tells the call layer the stream
/// is gone for good.
async fn consume_events(url: String, session_id: String, tx: mpsc::Sender<EngineEvent>) {
  let mut delay = Duration::from_secs(1);

  for attempt in 0..=STREAM_MAX_RETRIES {
    if attempt > 0 {
      info!(
        "reconnecting event stream for {} (attempt {}/{})",
        session_id, attempt, STREAM_MAX_RETRIES
      );
      time::sleep(delay).await;
      delay = (delay * 2).min(STREAM_BACKOFF_CAP);
    }

    let mut stream = match tokio_tungstenite::connect_async(url.as_str()).await {
      Ok((websocket, _response)) => websocket,
      Err(e) if is_unavailable(&e) => {
        warn!("media engine unavailable for {}: {:?}", session_id, e);
        continue;
      },
      Err(e) => {
        error!("event stream for {} failed: {:?}", session_id, e);
        return;
      },
    };

    loop {
      match stream.next().await {
        Some(Ok(Message::Text(text))) => {
          debug!("engine event <<< {}", text);
          match serde_json::from_str::<EngineEventFrame>(&text) {
            Ok(frame) if frame.session_id == session_id => {
              if tx.send(frame.event).await.is_err() {
                return;
              }
            },
            Ok(frame) => debug!("event for foreign session {} ignored", frame.session_id),
            Err(e) => warn!("failed to parse engine event: {:?}\nframe: {}", e, text),
          }
        },
        Some(Ok(Message::Close(_))) | None => {
          debug!("event stream ended for {}", session_id);
          return;
        },
        Some(Ok(_)) => {},
        Some(Err(e)) if is_unavailable(&e) => {
          warn!("event stream for {} interrupted: {:?}", session_id, e);
          break;
        },
        Some(Err(e)) => {
          error!("event stream for {} failed: {:?}", session_id, e);
          return;
        },
      }
    }
  }

  error!("max retries reached for {} event stream, giving up", session_id);
}

#[async_trait]
impl MediaEngine for EngineClient {
  async fn create_session(&self, session_id: &str, config: &SessionConfig) -> Result<()> {
    self
      .request(EngineCommand::CreateSession {
        session_id: session_id.to_owned(),
        config: config.clone(),
      })
      .await?;
    Ok(())
  }

  async fn create_offer(&self, session_id: &str) -> Result<String> {
    self
      .request(EngineCommand::CreateOffer {
        session_id: session_id.to_owned(),
      })
      .await?
      .sdp
      .context("engine returned no offer SDP")
  }

  async fn create_answer(&self, session_id: &str) -> Result<String> {
    self
      .request(EngineCommand::CreateAnswer {
        session_id: session_id.to_owned(),
      })
      .await?
      .sdp
      .context("engine returned no answer SDP")
  }

  async fn set_remote_description(
    &self,
    session_id: &str,
    sdp: &str,
    sdp_type: SdpType,
  ) -> Result<()> {
    self
      .request(EngineCommand::SetRemoteDescription {
        session_id: session_id.to_owned(),
        sdp: sdp.to_owned(),
        sdp_type: sdp_type.as_str().to_owned(),
      })
      .await?;
    Ok(())
  }

  async fn add_ice_candidate(&self, session_id: &str, candidate: &IceCandidate) -> Result<()> {
    self
      .request(EngineCommand::AddIceCandidate {
        session_id: session_id.to_owned(),
        candidate: candidate.clone(),
      })
      .await?;
    Ok(())
  }

  async fn end_session(&self, session_id: &str) -> Result<()> {
    if let Some(stream) = self.streams.lock().await.remove(session_id) {
      stream.abort();
    }
    self
      .request(EngineCommand::EndSession {
        session_id: session_id.to_owned(),
      })
      .await?;
    Ok(())
  }

  async fn set_mute(&self, session_id: &str, muted: bool) -> Result<()> {
    self
      .request(EngineCommand::SetMute {
        session_id: session_id.to_owned(),
        muted,
      })
      .await?;
    Ok(())
  }

  async fn list_audio_devices(&self) -> Result<Vec<AudioDevice>> {
    Ok(
      self
        .request(EngineCommand::ListAudioDevices)
        .await?
        .devices
        .unwrap_or_default(),
    )
  }

  async fn stats(&self, session_id: &str) -> Result<SessionStats> {
    self
      .request(EngineCommand::GetStats {
        session_id: session_id.to_owned(),
      })
      .await?
      .stats
      .context("engine returned no stats")
  }

  async fn events(&self, session_id: &str) -> Result<mpsc::Receiver<EngineEvent>> {
    let (tx, rx) = mpsc::channel(16);
    let url = format!("{}/events/{}", self.url, session_id);
    let task = tokio::spawn(consume_events(url, session_id.to_owned(), tx));
    if let Some(old) = self.streams.lock().await.insert(session_id.to_owned(), task) {
      warn!("replacing existing event stream for {}", session_id);
      old.abort();
    }
    Ok(rx)
  }
}

/// Where to find and how to run the media engine process.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Path to the engine binary.
  pub binary: PathBuf,

  /// Loopback address the engine listens on.
  pub endpoint: String,

  /// Engine log file; stderr goes next to it. None inherits our stderr.
  pub log_path: Option<PathBuf>,

  pub log_level: String,
}

impl Default for EngineConfig {
  fn default() -> EngineConfig {
    EngineConfig {
      binary: PathBuf::from("peal-media-engine"),
      endpoint: "127.0.0.1:50051".to_owned(),
      log_path: None,
      log_level: "INFO".to_owned(),
    }
  }
}

struct Heartbeat {
  stop_tx: std::sync::mpsc::Sender<()>,
  thread: Option<std::thread::JoinHandle<()>>,
}

impl Heartbeat {
  /// Runs on its own OS thread with its own runtime and engine connection:
  /// the protocol scheduler can be stalled by host GUI work, and the engine
  /// exits when heartbeats stop arriving.
  fn start(url: String) -> Result<Heartbeat> {
    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    let thread = std::thread::Builder::new()
      .name("peal-engine-heartbeat".to_owned())
      .spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
          Ok(runtime) => runtime,
          Err(e) => {
            error!("failed to build heartbeat runtime: {:?}", e);
            return;
          },
        };
        let client = match runtime.block_on(EngineClient::connect(&url)) {
          Ok(client) => client,
          Err(e) => {
            error!("heartbeat channel failed to connect: {:?}", e);
            return;
          },
        };
        debug!("heartbeat loop started");
        loop {
          if let Err(e) = runtime.block_on(client.heartbeat()) {
            warn!("heartbeat failed: {:?}", e);
          }
          match stop_rx.recv_timeout(HEARTBEAT_INTERVAL) {
            Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {},
          }
        }
        debug!("heartbeat loop exiting");
      })
      .context("failed to spawn heartbeat thread")?;
    Ok(Heartbeat {
      stop_tx,
      thread: Some(thread),
    })
  }

  fn stop(mut self) {
    let _ = self.stop_tx.send(());
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        warn!("heartbeat thread panicked");
      }
    }
  }
}

/// The media engine child process: a process-wide resource constructed at
/// application startup and injected into the call manager.
pub struct Engine {
  child: Option<Child>,
  client: EngineClient,
  heartbeat: Option<Heartbeat>,
}

impl fmt::Debug for Engine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Engine").finish()
  }
}

impl Engine {
  #[tracing::instrument(level = "debug", err)]
  pub async fn start(config: EngineConfig) -> Result<Engine> {
    let mut command = Command::new(&config.binary);
    command
      .arg("-listen")
      .arg(&config.endpoint)
      .arg("-log-level")
      .arg(&config.log_level)
      .stdin(Stdio::null())
      .stdout(Stdio::null());
    if let Some(log_path) = &config.log_path {
      command.arg("-log-path").arg(log_path);
      let stderr_file = std::fs::File::create(log_path.with_extension("err"))
        .context("failed to create engine stderr file")?;
      command.stderr(Stdio::from(stderr_file));
    }
    else {
      command.stderr(Stdio::inherit());
    }

    info!("starting media engine: {}", config.binary.display());
    let child = command.spawn().context("failed to spawn media engine")?;

    if let Err(e) = wait_ready(&config.endpoint).await {
      let mut child = child;
      let _ = child.start_kill();
      return Err(e);
    }

    let url = format!("ws://{}", config.endpoint);
    let client = EngineClient::connect(&url).await?;
    let heartbeat = Heartbeat::start(url)?;

    Ok(Engine {
      child: Some(child),
      client,
      heartbeat: Some(heartbeat),
    })
  }

  pub fn client(&self) -> &EngineClient {
    &self.client
  }

  /// Shutdown ladder: shutdown request, short wait, SIGTERM, short wait,
  /// kill.
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn stop(mut self) -> Result<()> {
    if let Some(heartbeat) = self.heartbeat.take() {
      let _ = tokio::task::spawn_blocking(move || heartbeat.stop()).await;
    }

    match time::timeout(SHUTDOWN_GRACE, self.client.shutdown()).await {
      Ok(Ok(())) => {},
      Ok(Err(e)) => warn!("engine shutdown request failed: {:?}", e),
      Err(_) => warn!("engine shutdown request timed out"),
    }

    let Some(mut child) = self.child.take() else {
      return Ok(());
    };
    if let Ok(status) = time::timeout(SHUTDOWN_GRACE, child.wait()).await {
      debug!("media engine exited: {:?}", status);
      return Ok(());
    }

    warn!("media engine still running after shutdown request, terminating");
    #[cfg(unix)]
    if let Some(pid) = child.id() {
      unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
      }
    }
    if let Ok(status) = time::timeout(TERMINATE_GRACE, child.wait()).await {
      debug!("media engine exited: {:?}", status);
      return Ok(());
    }

    warn!("media engine did not terminate, killing");
    child.kill().await.context("failed to kill media engine")?;
    Ok(())
  }
}

async fn wait_ready(endpoint: &str) -> Result<()> {
  let deadline = Instant::now() + READY_TIMEOUT;
  loop {
    match TcpStream::connect(endpoint).await {
      Ok(_) => return Ok(()),
      Err(e) => {
        if Instant::now() >= deadline {
          return Err(e).context("media engine did not become ready in time");
        }
        time::sleep(Duration::from_millis(100)).await;
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn create_session_wire_format() {
    let config = crate::config::CallConfig::default();
    let peer: xmpp_parsers::Jid = "bob@example.org/phone".parse().unwrap();
    let request = EngineRequest {
      id: 7,
      command: EngineCommand::CreateSession {
        session_id: "sid1".to_owned(),
        config: config.session_config(&peer),
      },
    };
    let json = serde_json::to_string(&request).unwrap();
    assert!(json.contains("\"id\":7"));
    assert!(json.contains("\"command\":\"create-session\""));
    assert!(json.contains("\"relay_only\":true"));
    assert!(json.contains("\"peer\":\"bob@example.org/phone\""));
  }

  #[test]
  fn parse_candidate_event() {
    let frame: EngineEventFrame = serde_json::from_str(
      "{\"session_id\":\"sid1\",\"event\":\"ice-candidate\",\
       \"candidate\":\"candidate:1 1 udp 1 192.0.2.1 9 typ host\",\
       \"sdp_mid\":\"0\",\"sdp_mline_index\":0}",
    )
    .unwrap();
    assert_eq!(frame.session_id, "sid1");
    match frame.event {
      EngineEvent::IceCandidate { candidate } => {
        assert_eq!(candidate.sdp_mid, "0");
        assert!(candidate.candidate.starts_with("candidate:1"));
      },
      other => panic!("parsed as {:?}", other),
    }
  }

  #[test]
  fn parse_connection_state_event() {
    let frame: EngineEventFrame = serde_json::from_str(
      "{\"session_id\":\"sid1\",\"event\":\"connection-state\",\"state\":\"connected\"}",
    )
    .unwrap();
    assert_eq!(
      frame.event,
      EngineEvent::ConnectionState {
        state: ConnectionState::Connected
      }
    );
  }

  #[test]
  fn error_reply_becomes_error() {
    let reply: EngineReply =
      serde_json::from_str("{\"id\":3,\"error\":\"no such session\"}").unwrap();
    assert_eq!(reply.id, 3);
    assert_eq!(reply.error.as_deref(), Some("no such session"));
    assert_eq!(reply.sdp, None);
  }

  #[test]
  fn unavailable_classification() {
    let refused = WsError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
    assert!(is_unavailable(&refused));
    let other = WsError::Utf8;
    assert!(!is_unavailable(&other));
  }
}
