//! The per-session call state machine: session table, timers, single-call
//! policy, layered idempotent cleanup, and the event surface toward the
//! host.

use std::{
  collections::{HashMap, HashSet, VecDeque},
  fmt,
  sync::Arc,
  time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use peal_xmpp_parsers::{
  jingle::{Jingle, ReasonElement},
  jingle_message::CallMessage,
  ns as call_ns,
};
use tokio::{
  sync::{mpsc, Mutex},
  task::JoinHandle,
  time,
};
use tracing::{debug, error, info, warn};
use xmpp_parsers::{
  iq::{Iq, IqType},
  message::Message,
  ns,
  stanza_error::{DefinedCondition, ErrorType, StanzaError},
  BareJid, Element, FullJid, Jid,
};

use crate::{
  config::CallConfig,
  engine::{AudioDevice, ConnectionState, EngineEvent, MediaEngine, SessionStats},
  ice::{IceCandidate, IceStats},
  sdp::{MediaType, OfferDetails, Sdp, SdpType},
  stanza_filter::StanzaFilter,
  util::generate_id,
};

pub(crate) const RING_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const TRICKLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  Initiator,
  Responder,
}

/// Lifecycle of a single call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  /// Outgoing: propose sent, waiting for a device to proceed.
  Proposing,

  /// Outgoing: proceed received, engine session being set up.
  /// Incoming: proceed sent, waiting for session-initiate.
  Proceeding,

  /// Outgoing: session-initiate sent, waiting for session-accept.
  Pending,

  /// Incoming: propose received, waiting for the user.
  Proposed,

  /// Incoming: session-initiate received.
  Incoming,

  /// Answer exchanged; waiting for the engine to connect.
  Accepted,

  /// Media flowing.
  Active,

  Terminated,
}

impl SessionState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, SessionState::Terminated)
  }

  /// Local candidates queue until the session stanza carrying our
  /// credentials has gone out to the peer.
  fn queues_candidates(&self) -> bool {
    matches!(
      self,
      SessionState::Proposing
        | SessionState::Proceeding
        | SessionState::Pending
        | SessionState::Incoming
        | SessionState::Accepted
    )
  }
}

/// How a termination reason reads in a call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
  /// Normal end.
  Ended,
  Declined,
  Missed,
  Failed,
  /// Handled on another of our devices.
  OtherDevice,
}

impl CallOutcome {
  pub fn classify(reason: &str) -> CallOutcome {
    match reason {
      "decline" | "declined" | "busy" => CallOutcome::Declined,
      "timeout" => CallOutcome::Missed,
      "connectivity-error" | "failed" => CallOutcome::Failed,
      "answered_elsewhere" | "rejected_elsewhere" | "finished" => CallOutcome::OtherDevice,
      _ => CallOutcome::Ended,
    }
  }
}

/// Notifications posted to the host, which re-dispatches them onto its own
/// scheduler (GUI thread, usually).
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
  IncomingCall {
    session_id: String,
    peer: Jid,
    media: Vec<MediaType>,
  },
  CallInitiated {
    session_id: String,
    peer: Jid,
    media: Vec<MediaType>,
  },
  CallAccepted {
    session_id: String,
  },
  CallStateChanged {
    session_id: String,
    state: ConnectionState,
  },
  CallTerminated {
    session_id: String,
    reason: String,
    peer: Jid,
    outcome: CallOutcome,
  },
}

/// Snapshot of a session for host-side inspection.
#[derive(Debug, Clone)]
pub struct SessionInfo {
  pub peer: Jid,
  pub role: Role,
  pub media: Vec<MediaType>,
  pub state: SessionState,
  pub local_ufrag: Option<String>,
  pub local_pwd: Option<String>,
  pub remote_ufrag: Option<String>,
  pub remote_pwd: Option<String>,
  pub ice_stats: IceStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IqKind {
  SessionInitiate,
  SessionAccept,
  SessionTerminate,
  TransportInfo,
}

pub(crate) struct CallSession {
  pub(crate) peer: Jid,
  pub(crate) role: Role,
  pub(crate) media: Vec<MediaType>,
  pub(crate) state: SessionState,
  pub(crate) accepted: bool,
  pub(crate) answer_pending: bool,
  pub(crate) engine_live: bool,
  pub(crate) waiting_for_candidates: bool,
  pub(crate) remote_offer: Option<String>,
  pub(crate) offer_details: Option<OfferDetails>,
  pub(crate) local_ufrag: Option<String>,
  pub(crate) local_pwd: Option<String>,
  pub(crate) remote_ufrag: Option<String>,
  pub(crate) remote_pwd: Option<String>,
  pub(crate) pending_candidates: VecDeque<IceCandidate>,
  pub(crate) remote_candidates: Vec<IceCandidate>,
  pub(crate) ice_stats: IceStats,
  pub(crate) ring_timer: Option<JoinHandle<()>>,
  pub(crate) trickle_timer: Option<JoinHandle<()>>,
  pub(crate) event_pump: Option<JoinHandle<()>>,
}

impl CallSession {
  pub(crate) fn new(peer: Jid, role: Role, media: Vec<MediaType>) -> CallSession {
    CallSession {
      peer,
      role,
      media,
      state: SessionState::Proposing,
      accepted: false,
      answer_pending: false,
      engine_live: false,
      waiting_for_candidates: false,
      remote_offer: None,
      offer_details: None,
      local_ufrag: None,
      local_pwd: None,
      remote_ufrag: None,
      remote_pwd: None,
      pending_candidates: VecDeque::new(),
      remote_candidates: Vec::new(),
      ice_stats: IceStats::default(),
      ring_timer: None,
      trickle_timer: None,
      event_pump: None,
    }
  }
}

impl fmt::Debug for CallSession {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CallSession")
      .field("peer", &self.peer)
      .field("role", &self.role)
      .field("state", &self.state)
      .finish()
  }
}

pub(crate) struct CallManagerInner {
  pub(crate) sessions: HashMap<String, CallSession>,
  pub(crate) terminated: HashSet<String>,
}

impl CallManagerInner {
  /// One call at a time across the process; a second one is refused or
  /// auto-rejected busy.
  pub(crate) fn has_active_call(&self, exclude: Option<&str>) -> bool {
    self
      .sessions
      .iter()
      .any(|(sid, session)| Some(sid.as_str()) != exclude && !session.state.is_terminal())
  }
}

pub(crate) fn bare_peer(jid: &Jid) -> BareJid {
  match jid {
    Jid::Bare(bare) => bare.clone(),
    Jid::Full(full) => full.clone().into(),
  }
}

/// The call engine facade: owns the session table, talks Jingle on the
/// stanza channel, drives the media engine, and reports to the host over
/// the event channel.
#[derive(Clone)]
pub struct CallManager {
  pub(crate) jid: FullJid,
  pub(crate) xmpp_tx: mpsc::Sender<Element>,
  pub(crate) event_tx: mpsc::Sender<CallEvent>,
  pub(crate) engine: Arc<dyn MediaEngine>,
  pub(crate) config: CallConfig,
  pub(crate) inner: Arc<Mutex<CallManagerInner>>,
  pub(crate) outstanding_iqs: Arc<std::sync::Mutex<HashMap<String, (IqKind, String)>>>,
}

impl fmt::Debug for CallManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CallManager").field("jid", &self.jid).finish()
  }
}

impl CallManager {
  pub fn new(
    jid: FullJid,
    xmpp_tx: mpsc::Sender<Element>,
    event_tx: mpsc::Sender<CallEvent>,
    engine: Arc<dyn MediaEngine>,
    config: CallConfig,
  ) -> CallManager {
    CallManager {
      jid,
      xmpp_tx,
      event_tx,
      engine,
      config,
      inner: Arc::new(Mutex::new(CallManagerInner {
        sessions: HashMap::new(),
        terminated: HashSet::new(),
      })),
      outstanding_iqs: Arc::new(std::sync::Mutex::new(HashMap::new())),
    }
  }

  /// Start an outgoing call: propose to every device of the peer, then wait
  /// for one of them to proceed. Returns the new session id.
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn start_call(&self, peer: BareJid, media: Vec<MediaType>) -> Result<String> {
    let media = if media.is_empty() { vec![MediaType::Audio] } else { media };
    let sid = generate_id();

    {
      let mut inner = self.inner.lock().await;
      if inner.has_active_call(None) {
        bail!("another call is already in progress");
      }
      inner.sessions.insert(
        sid.clone(),
        CallSession::new(Jid::Bare(peer.clone()), Role::Initiator, media.clone()),
      );
    }

    if let Err(e) = self.send_propose(&peer, &sid, &media).await {
      self.inner.lock().await.sessions.remove(&sid);
      return Err(e);
    }
    info!("proposed call {} to {}: {:?}", sid, peer, media);

    let timer = self.start_ring_timer(&sid, Role::Initiator);
    self.store_ring_timer(&sid, timer).await;

    self
      .emit(CallEvent::CallInitiated {
        session_id: sid.clone(),
        peer: Jid::Bare(peer),
        media,
      })
      .await;
    Ok(sid)
  }

  /// Accept a ringing incoming call. Sends proceed (if the negotiation has
  /// not started yet) and answers as soon as the offer and its candidates
  /// allow.
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn accept_call(&self, session_id: &str) -> Result<()> {
    let (peer, needs_proceed) = {
      let mut inner = self.inner.lock().await;
      let session = inner
        .sessions
        .get_mut(session_id)
        .ok_or_else(|| anyhow!("unknown session: {}", session_id))?;
      if session.role != Role::Responder {
        bail!("cannot accept a call we initiated");
      }
      if session.accepted {
        return Ok(());
      }
      session.accepted = true;
      if let Some(timer) = session.ring_timer.take() {
        timer.abort();
      }
      let needs_proceed = session.state == SessionState::Proposed;
      if needs_proceed {
        session.state = SessionState::Proceeding;
      }
      (session.peer.clone(), needs_proceed)
    };

    if needs_proceed {
      self.send_proceed(&bare_peer(&peer), session_id).await?;
    }
    self.maybe_complete_acceptance(session_id).await
  }

  /// Hang up, decline or cancel, whatever the session's stage calls for.
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn hangup_call(&self, session_id: &str) -> Result<()> {
    let (role, state, accepted, peer) = {
      let mut inner = self.inner.lock().await;
      let session = inner
        .sessions
        .get_mut(session_id)
        .ok_or_else(|| anyhow!("unknown session: {}", session_id))?;
      if let Some(timer) = session.ring_timer.take() {
        timer.abort();
      }
      (session.role, session.state, session.accepted, session.peer.clone())
    };

    match (role, state) {
      (Role::Initiator, SessionState::Proposing) => {
        // Only the propose is on the wire; a retract stops the ringing on
        // every device.
        let retract = CallMessage::Retract {
          sid: session_id.to_owned(),
        };
        if let Err(e) = self.send_call_message(bare_peer(&peer), retract).await {
          warn!("failed to send retract for {}: {:?}", session_id, e);
        }
        self.end_call(session_id, "decline", false).await
      },
      (Role::Responder, SessionState::Proposed | SessionState::Proceeding) => {
        let reject = CallMessage::Reject {
          sid: session_id.to_owned(),
        };
        if let Err(e) = self.send_call_message(bare_peer(&peer), reject).await {
          warn!("failed to send reject for {}: {:?}", session_id, e);
        }
        self.end_call(session_id, "decline", false).await
      },
      (Role::Responder, SessionState::Incoming) if !accepted => {
        self.end_call(session_id, "decline", true).await
      },
      _ => self.end_call(session_id, "success", true).await,
    }
  }

  pub async fn set_mute(&self, session_id: &str, muted: bool) -> Result<()> {
    let engine_live = {
      let inner = self.inner.lock().await;
      inner
        .sessions
        .get(session_id)
        .map(|session| session.engine_live)
        .unwrap_or(false)
    };
    if !engine_live {
      bail!("no active media session: {}", session_id);
    }
    self.engine.set_mute(session_id, muted).await
  }

  pub async fn call_stats(&self, session_id: &str) -> Result<SessionStats> {
    self.engine.stats(session_id).await
  }

  pub async fn audio_devices(&self) -> Result<Vec<AudioDevice>> {
    self.engine.list_audio_devices().await
  }

  pub async fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
    let inner = self.inner.lock().await;
    inner.sessions.get(session_id).map(|session| SessionInfo {
      peer: session.peer.clone(),
      role: session.role,
      media: session.media.clone(),
      state: session.state,
      local_ufrag: session.local_ufrag.clone(),
      local_pwd: session.local_pwd.clone(),
      remote_ufrag: session.remote_ufrag.clone(),
      remote_pwd: session.remote_pwd.clone(),
      ice_stats: session.ice_stats,
    })
  }

  pub async fn ice_stats(&self, session_id: &str) -> Option<IceStats> {
    let inner = self.inner.lock().await;
    inner.sessions.get(session_id).map(|session| session.ice_stats)
  }

  /// Layered teardown, idempotent via the terminated-id set: engine session,
  /// optional terminate + finish announcements, session tables, queued
  /// candidates, and finally the terminated event.
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn end_call(&self, session_id: &str, reason: &str, send_terminate: bool) -> Result<()> {
    let mut session = {
      let mut inner = self.inner.lock().await;
      if inner.terminated.contains(session_id) {
        debug!("call {} already ended, skipping cleanup", session_id);
        return Ok(());
      }
      inner.terminated.insert(session_id.to_owned());
      match inner.sessions.remove(session_id) {
        Some(session) => session,
        None => return Ok(()),
      }
    };

    info!(
      "ending call {}: reason={} send_terminate={}",
      session_id, reason, send_terminate
    );

    if let Some(timer) = session.ring_timer.take() {
      timer.abort();
    }
    if let Some(timer) = session.trickle_timer.take() {
      timer.abort();
    }

    if session.engine_live {
      if let Err(e) = self.engine.end_session(session_id).await {
        warn!("failed to end engine session {}: {:?}", session_id, e);
      }
    }

    if send_terminate {
      if let Err(e) = self
        .send_session_terminate(session_id, &session.peer, reason)
        .await
      {
        warn!("failed to send session-terminate for {}: {:?}", session_id, e);
      }
      let finish = CallMessage::Finish {
        sid: session_id.to_owned(),
        reason: Some(ReasonElement::new(reason)),
      };
      if let Err(e) = self.send_call_message(bare_peer(&session.peer), finish).await {
        warn!("failed to send finish for {}: {:?}", session_id, e);
      }
    }

    session.pending_candidates.clear();
    session.remote_candidates.clear();

    self
      .emit(CallEvent::CallTerminated {
        session_id: session_id.to_owned(),
        reason: reason.to_owned(),
        peer: Jid::Bare(bare_peer(&session.peer)),
        outcome: CallOutcome::classify(reason),
      })
      .await;

    // Last: this may be our own task when the stream ended.
    if let Some(pump) = session.event_pump.take() {
      pump.abort();
    }
    Ok(())
  }

  /// Outgoing leg, entered when the peer's proceed arrives: engine session,
  /// offer, session-initiate.
  pub(crate) async fn initiate_session(&self, sid: &str) -> Result<()> {
    let peer = {
      let inner = self.inner.lock().await;
      match inner.sessions.get(sid) {
        Some(session) => session.peer.clone(),
        None => return Ok(()),
      }
    };
    if let Err(e) = self.try_initiate_session(sid, &peer).await {
      error!("failed to set up outgoing session {}: {:?}", sid, e);
      self.end_call(sid, "connectivity-error", false).await?;
    }
    Ok(())
  }

  async fn try_initiate_session(&self, sid: &str, peer: &Jid) -> Result<()> {
    self
      .engine
      .create_session(sid, &self.config.session_config(peer))
      .await?;
    let events = self.engine.events(sid).await?;
    let pump = self.spawn_event_pump(sid, events);
    {
      let mut inner = self.inner.lock().await;
      match inner.sessions.get_mut(sid) {
        Some(session) => {
          session.engine_live = true;
          session.event_pump = Some(pump);
        },
        None => {
          pump.abort();
          let _ = self.engine.end_session(sid).await;
          return Ok(());
        },
      }
    }

    let offer = self.engine.create_offer(sid).await?;
    let sdp = Sdp::parse(&offer);
    let (media, pending) = {
      let mut inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get_mut(sid) else {
        let _ = self.engine.end_session(sid).await;
        return Ok(());
      };
      session.local_ufrag = sdp.ufrag.clone();
      session.local_pwd = sdp.pwd.clone();
      (session.media.clone(), std::mem::take(&mut session.pending_candidates))
    };

    self.send_session_initiate(sid, peer, &sdp, &media, pending).await?;

    let mut inner = self.inner.lock().await;
    if let Some(session) = inner.sessions.get_mut(sid) {
      session.state = SessionState::Pending;
    }
    Ok(())
  }

  /// Responder leg: answer once the user accepted, the offer arrived, and
  /// trickle-only offers have seen their first candidates (or the safety
  /// timeout gave up waiting).
  pub(crate) async fn maybe_complete_acceptance(&self, sid: &str) -> Result<()> {
    let (peer, offer, details, media) = {
      let mut inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get_mut(sid) else {
        return Ok(());
      };
      if !session.accepted
        || session.answer_pending
        || session.waiting_for_candidates
        || session.state != SessionState::Incoming
      {
        return Ok(());
      }
      let Some(offer) = session.remote_offer.clone() else {
        return Ok(());
      };
      session.answer_pending = true;
      (
        session.peer.clone(),
        offer,
        session.offer_details.clone().unwrap_or_default(),
        session.media.clone(),
      )
    };

    if let Err(e) = self.answer_session(sid, &peer, &offer, &details, &media).await {
      error!("failed to answer call {}: {:?}", sid, e);
      self.end_call(sid, "connectivity-error", false).await?;
    }
    Ok(())
  }

  async fn answer_session(
    &self,
    sid: &str,
    peer: &Jid,
    offer: &str,
    details: &OfferDetails,
    media: &[MediaType],
  ) -> Result<()> {
    self
      .engine
      .create_session(sid, &self.config.session_config(peer))
      .await?;
    let events = self.engine.events(sid).await?;
    let pump = self.spawn_event_pump(sid, events);
    let buffered = {
      let mut inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get_mut(sid) else {
        pump.abort();
        let _ = self.engine.end_session(sid).await;
        return Ok(());
      };
      session.engine_live = true;
      session.event_pump = Some(pump);
      std::mem::take(&mut session.remote_candidates)
    };

    // Remote description first, then any candidates that trickled in while
    // the offer was parked, then the answer.
    self
      .engine
      .set_remote_description(sid, offer, SdpType::Offer)
      .await?;
    for candidate in &buffered {
      if let Err(e) = self.engine.add_ice_candidate(sid, candidate).await {
        warn!("failed to add buffered candidate for {}: {:?}", sid, e);
      }
    }
    let answer = self.engine.create_answer(sid).await?;
    let sdp = Sdp::parse(&answer);

    {
      let mut inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get_mut(sid) else {
        let _ = self.engine.end_session(sid).await;
        return Ok(());
      };
      session.local_ufrag = sdp.ufrag.clone();
      session.local_pwd = sdp.pwd.clone();
      // The answer SDP already carries the gathered candidates; dropping
      // the queue prevents double emission.
      session.pending_candidates.clear();
      session.state = SessionState::Accepted;
    }

    self.send_session_accept(sid, peer, &sdp, media, details).await?;
    info!("call {} answered", sid);
    Ok(())
  }

  fn spawn_event_pump(&self, sid: &str, mut events: mpsc::Receiver<EngineEvent>) -> JoinHandle<()> {
    let this = self.clone();
    let sid = sid.to_owned();
    tokio::spawn(async move {
      while let Some(event) = events.recv().await {
        let result = match event {
          EngineEvent::IceCandidate { candidate } => this.on_local_candidate(&sid, candidate).await,
          EngineEvent::ConnectionState { state } => this.on_connection_state(&sid, state).await,
        };
        if let Err(e) = result {
          warn!("failed to handle engine event for {}: {:?}", sid, e);
        }
      }
      let live = this.inner.lock().await.sessions.contains_key(&sid);
      if live {
        warn!("engine event stream ended for live session {}", sid);
        if let Err(e) = this.end_call(&sid, "connectivity-error", true).await {
          warn!("failed to clean up {} after stream loss: {:?}", sid, e);
        }
      }
    })
  }

  pub(crate) async fn on_local_candidate(&self, sid: &str, candidate: IceCandidate) -> Result<()> {
    let peer = {
      let mut inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get_mut(sid) else {
        debug!("local candidate for unknown session {}", sid);
        return Ok(());
      };
      if session.state.queues_candidates() {
        session.pending_candidates.push_back(candidate);
        debug!(
          "queued local candidate for {} (state {:?}, queue {})",
          sid,
          session.state,
          session.pending_candidates.len()
        );
        return Ok(());
      }
      session.peer.clone()
    };
    self.send_transport_info(sid, &peer, &candidate).await
  }

  pub(crate) async fn on_connection_state(&self, sid: &str, state: ConnectionState) -> Result<()> {
    info!("connection state for {}: {}", sid, state);
    if state == ConnectionState::Failed {
      return self.end_call(sid, "connectivity-error", true).await;
    }
    self
      .emit(CallEvent::CallStateChanged {
        session_id: sid.to_owned(),
        state,
      })
      .await;
    if state == ConnectionState::Connected {
      {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(sid) {
          if session.state == SessionState::Accepted {
            session.state = SessionState::Active;
          }
        }
      }
      self.flush_pending_candidates(sid).await;
    }
    Ok(())
  }

  /// Drain the queue in order. Candidates queued while the flush runs are
  /// drained by the same loop, so a flush always beats later live sends.
  pub(crate) async fn flush_pending_candidates(&self, sid: &str) {
    let mut flushed = 0usize;
    loop {
      let next = {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(sid) else {
          return;
        };
        session
          .pending_candidates
          .pop_front()
          .map(|candidate| (session.peer.clone(), candidate))
      };
      let Some((peer, candidate)) = next else {
        break;
      };
      flushed += 1;
      if let Err(e) = self.send_transport_info(sid, &peer, &candidate).await {
        // Best-effort: lost candidates only show up as failed connectivity.
        warn!("failed to send candidate for {}: {:?}", sid, e);
      }
    }
    if flushed > 0 {
      debug!("flushed {} queued candidates for {}", flushed, sid);
    }
  }

  pub(crate) fn start_ring_timer(&self, sid: &str, role: Role) -> JoinHandle<()> {
    let this = self.clone();
    let sid = sid.to_owned();
    tokio::spawn(async move {
      time::sleep(RING_TIMEOUT).await;
      if let Err(e) = this.on_ring_timeout(&sid, role).await {
        warn!("ring timeout handling failed for {}: {:?}", sid, e);
      }
    })
  }

  pub(crate) async fn store_ring_timer(&self, sid: &str, timer: JoinHandle<()>) {
    let mut inner = self.inner.lock().await;
    match inner.sessions.get_mut(sid) {
      Some(session) => {
        if let Some(old) = session.ring_timer.replace(timer) {
          old.abort();
        }
      },
      None => timer.abort(),
    }
  }

  async fn on_ring_timeout(&self, sid: &str, role: Role) -> Result<()> {
    let peer = {
      let inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get(sid) else {
        return Ok(());
      };
      let still_ringing = match role {
        Role::Initiator => session.state == SessionState::Proposing,
        Role::Responder => {
          !session.accepted
            && matches!(
              session.state,
              SessionState::Proposed | SessionState::Proceeding | SessionState::Incoming
            )
        },
      };
      if !still_ringing {
        return Ok(());
      }
      session.peer.clone()
    };

    warn!("call {} rang out after {:?}", sid, RING_TIMEOUT);
    let message = match role {
      // Stop the peer's devices ringing; we give up.
      Role::Initiator => CallMessage::Retract { sid: sid.to_owned() },
      // Free the line; the caller would otherwise ring us forever.
      Role::Responder => CallMessage::Reject { sid: sid.to_owned() },
    };
    if let Err(e) = self.send_call_message(bare_peer(&peer), message).await {
      warn!("failed to send timeout announcement for {}: {:?}", sid, e);
    }
    self.end_call(sid, "timeout", false).await
  }

  pub(crate) fn start_trickle_timer(&self, sid: &str) -> JoinHandle<()> {
    let this = self.clone();
    let sid = sid.to_owned();
    tokio::spawn(async move {
      time::sleep(TRICKLE_TIMEOUT).await;
      let fire = {
        let mut inner = this.inner.lock().await;
        match inner.sessions.get_mut(&sid) {
          Some(session) if session.waiting_for_candidates => {
            session.waiting_for_candidates = false;
            true
          },
          _ => false,
        }
      };
      if fire {
        warn!("timed out waiting for candidates on {}, answering anyway", sid);
        if let Err(e) = this.maybe_complete_acceptance(&sid).await {
          warn!("deferred answer failed for {}: {:?}", sid, e);
        }
      }
    })
  }

  pub(crate) async fn emit(&self, event: CallEvent) {
    if self.event_tx.send(event).await.is_err() {
      debug!("call event channel closed");
    }
  }

  pub(crate) fn track_iq(&self, id: String, kind: IqKind, sid: &str) {
    if let Ok(mut outstanding) = self.outstanding_iqs.lock() {
      outstanding.insert(id, (kind, sid.to_owned()));
    }
  }

  fn handle_iq_result(&self, id: &str) {
    if let Ok(mut outstanding) = self.outstanding_iqs.lock() {
      if let Some((kind, sid)) = outstanding.remove(id) {
        debug!("{:?} acknowledged for {}", kind, sid);
      }
    }
  }

  /// The peer could not process one of our IQs. transport-info is
  /// best-effort and never retried; a failed initiate or accept kills the
  /// session.
  async fn handle_iq_error(&self, id: &str, error: StanzaError) -> Result<()> {
    let entry = match self.outstanding_iqs.lock() {
      Ok(mut outstanding) => outstanding.remove(id),
      Err(_) => None,
    };
    let Some((kind, sid)) = entry else {
      return Ok(());
    };
    warn!("peer failed our {:?} for {}: {:?}", kind, sid, error);
    match kind {
      IqKind::SessionInitiate | IqKind::SessionAccept => self.end_call(&sid, "failed", false).await,
      IqKind::SessionTerminate | IqKind::TransportInfo => Ok(()),
    }
  }
}

#[async_trait]
impl StanzaFilter for CallManager {
  fn filter(&self, element: &Element) -> bool {
    if element.is("iq", ns::DEFAULT_NS) {
      if element.has_child("jingle", call_ns::JINGLE) {
        return true;
      }
      if matches!(element.attr("type"), Some("result") | Some("error")) {
        if let Some(id) = element.attr("id") {
          return self
            .outstanding_iqs
            .lock()
            .map(|outstanding| outstanding.contains_key(id))
            .unwrap_or(false);
        }
      }
      false
    }
    else if element.is("message", ns::DEFAULT_NS) {
      element
        .children()
        .any(|child| child.has_ns(call_ns::JINGLE_MESSAGE))
    }
    else {
      false
    }
  }

  async fn take(&self, element: Element) -> Result<()> {
    if element.is("iq", ns::DEFAULT_NS) {
      let iq = Iq::try_from(element)?;
      match iq.payload {
        IqType::Set(payload) => {
          let from = iq
            .from
            .clone()
            .ok_or_else(|| anyhow!("jingle iq missing from"))?;
          let outcome = match Jingle::try_from(payload) {
            Ok(jingle) => self.handle_jingle_iq(&from, jingle).await,
            Err(e) => Err(anyhow!("malformed jingle payload: {}", e)),
          };
          match outcome {
            Ok(()) => {
              let result_iq =
                Iq::empty_result(from, iq.id).with_from(Jid::Full(self.jid.clone()));
              self.xmpp_tx.send(result_iq.into()).await?;
            },
            Err(e) => {
              warn!("failed to handle jingle iq: {:?}", e);
              let error = StanzaError::new(
                ErrorType::Cancel,
                DefinedCondition::BadRequest,
                "en",
                e.to_string(),
              );
              let error_iq = Iq::from_error(iq.id, error)
                .with_to(from)
                .with_from(Jid::Full(self.jid.clone()));
              self.xmpp_tx.send(error_iq.into()).await?;
            },
          }
        },
        IqType::Result(_) => self.handle_iq_result(&iq.id),
        IqType::Error(error) => self.handle_iq_error(&iq.id, error).await?,
        IqType::Get(_) => {},
      }
      Ok(())
    }
    else {
      let message = Message::try_from(element)?;
      let from = message
        .from
        .clone()
        .ok_or_else(|| anyhow!("call message missing from"))?;
      if let Some(payload) = message
        .payloads
        .into_iter()
        .find(|payload| payload.has_ns(call_ns::JINGLE_MESSAGE))
      {
        let call_message = CallMessage::try_from(payload)?;
        return self.handle_call_message(from, call_message).await;
      }
      Ok(())
    }
  }
}
