//! XEP-0353 announcement layer: the message-based call notifications that
//! precede and follow the IQ-based Jingle negotiation. Announcements go to
//! the bare JID so every device of the peer rings or learns the outcome.

use anyhow::Result;
use peal_xmpp_parsers::jingle_message::{CallMessage, ProposeDescription};
use tracing::{debug, info, warn};
use xmpp_parsers::{
  message::{Message, MessageType},
  BareJid, Element, Jid,
};

use crate::{
  call::{bare_peer, CallEvent, CallManager, CallSession, Role, SessionState},
  sdp::MediaType,
  util::generate_id,
};

impl CallManager {
  pub(crate) async fn handle_call_message(&self, from: Jid, message: CallMessage) -> Result<()> {
    let own_bare: BareJid = self.jid.clone().into();
    let from_own_account = bare_peer(&from) == own_bare;

    match message {
      CallMessage::Propose { sid, descriptions } => {
        if from_own_account {
          debug!("ignoring propose carbon from our own account");
          return Ok(());
        }
        self.handle_propose(from, sid, descriptions).await
      },
      CallMessage::Proceed { sid } => {
        if from_own_account {
          return self.end_elsewhere(&sid, "answered_elsewhere").await;
        }
        self.handle_proceed(from, &sid).await
      },
      CallMessage::Accept { sid } => {
        if from_own_account {
          return self.end_elsewhere(&sid, "answered_elsewhere").await;
        }
        // Obsolete pre-acceptance notification; the session-accept IQ and
        // the engine's connection state carry the real signal.
        debug!("peer pre-accepted call {}, waiting for session-accept", sid);
        Ok(())
      },
      CallMessage::Reject { sid } => {
        if from_own_account {
          return self.end_elsewhere(&sid, "rejected_elsewhere").await;
        }
        self.handle_reject(from, &sid).await
      },
      CallMessage::Retract { sid } => {
        if from_own_account {
          debug!("ignoring retract carbon from our own account");
          return Ok(());
        }
        self.handle_retract(from, &sid).await
      },
      CallMessage::Finish { sid, reason } => {
        let reason = reason.map(|reason| reason.reason).unwrap_or_else(|| "success".to_owned());
        if from_own_account {
          return self.end_elsewhere(&sid, "finished").await;
        }
        self.handle_finish(from, &sid, &reason).await
      },
    }
  }

  /// A companion device of ours acted on the ringing call; stop it locally
  /// with the matching multi-device reason.
  async fn end_elsewhere(&self, sid: &str, reason: &str) -> Result<()> {
    let known = self.inner.lock().await.sessions.contains_key(sid);
    if !known {
      debug!("companion-device message for unknown session {}", sid);
      return Ok(());
    }
    info!("call {} handled on another device: {}", sid, reason);
    self.end_call(sid, reason, false).await
  }

  async fn handle_propose(
    &self,
    from: Jid,
    sid: String,
    descriptions: Vec<ProposeDescription>,
  ) -> Result<()> {
    let mut media: Vec<MediaType> = descriptions
      .iter()
      .filter_map(|description| description.media.parse().ok())
      .collect();
    if media.is_empty() {
      media.push(MediaType::Audio);
    }

    let busy = {
      let mut inner = self.inner.lock().await;
      if inner.sessions.contains_key(&sid) || inner.terminated.contains(&sid) {
        debug!("duplicate propose for {}", sid);
        return Ok(());
      }
      if inner.has_active_call(Some(&sid)) {
        true
      }
      else {
        let mut session = CallSession::new(from.clone(), Role::Responder, media.clone());
        session.state = SessionState::Proposed;
        inner.sessions.insert(sid.clone(), session);
        false
      }
    };

    if busy {
      warn!("auto-rejecting propose {} from {}: another call is active", sid, from);
      return self
        .send_call_message(bare_peer(&from), CallMessage::Reject { sid })
        .await;
    }

    info!("incoming call {} from {}: {:?}", sid, from, media);
    let timer = self.start_ring_timer(&sid, Role::Responder);
    self.store_ring_timer(&sid, timer).await;
    self
      .emit(CallEvent::IncomingCall {
        session_id: sid,
        peer: from,
        media,
      })
      .await;
    Ok(())
  }

  /// The peer accepted our propose: capture the answering device's full
  /// address and start the real negotiation. All session IQs from here on
  /// go to that exact address.
  async fn handle_proceed(&self, from: Jid, sid: &str) -> Result<()> {
    {
      let mut inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get_mut(sid) else {
        warn!("proceed for unknown session {}", sid);
        return Ok(());
      };
      if session.role != Role::Initiator || session.state != SessionState::Proposing {
        debug!("ignoring proceed in state {:?}", session.state);
        return Ok(());
      }
      if bare_peer(&session.peer) != bare_peer(&from) {
        warn!("proceed for {} from unexpected sender {}", sid, from);
        return Ok(());
      }
      if let Some(timer) = session.ring_timer.take() {
        timer.abort();
      }
      session.peer = from.clone();
      session.state = SessionState::Proceeding;
    }
    info!("call {} proceeding, peer answering at {}", sid, from);
    self.initiate_session(sid).await
  }

  async fn handle_reject(&self, from: Jid, sid: &str) -> Result<()> {
    {
      let inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get(sid) else {
        debug!("reject for unknown session {}", sid);
        return Ok(());
      };
      if session.role != Role::Initiator || bare_peer(&session.peer) != bare_peer(&from) {
        warn!("ignoring stray reject for {} from {}", sid, from);
        return Ok(());
      }
    }
    info!("call {} rejected by {}", sid, from);
    self.end_call(sid, "declined", false).await
  }

  async fn handle_retract(&self, from: Jid, sid: &str) -> Result<()> {
    {
      let inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get(sid) else {
        debug!("retract for unknown session {}", sid);
        return Ok(());
      };
      if session.role != Role::Responder || bare_peer(&session.peer) != bare_peer(&from) {
        warn!("ignoring stray retract for {} from {}", sid, from);
        return Ok(());
      }
    }
    info!("call {} retracted by {}", sid, from);
    self.end_call(sid, "retracted", false).await
  }

  async fn handle_finish(&self, from: Jid, sid: &str, reason: &str) -> Result<()> {
    {
      let inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get(sid) else {
        debug!("finish for unknown session {}", sid);
        return Ok(());
      };
      if bare_peer(&session.peer) != bare_peer(&from) {
        warn!("ignoring stray finish for {} from {}", sid, from);
        return Ok(());
      }
    }
    info!("call {} finished by {}: {}", sid, from, reason);
    self.end_call(sid, reason, false).await
  }

  pub(crate) async fn send_call_message(&self, to: BareJid, payload: CallMessage) -> Result<()> {
    let message = Message {
      from: Some(Jid::Full(self.jid.clone())),
      to: Some(Jid::Bare(to)),
      id: Some(generate_id()),
      type_: MessageType::Chat,
      bodies: Default::default(),
      subjects: Default::default(),
      thread: None,
      payloads: vec![Element::from(payload)],
    };
    self.xmpp_tx.send(message.into()).await?;
    Ok(())
  }

  pub(crate) async fn send_propose(
    &self,
    to: &BareJid,
    sid: &str,
    media: &[MediaType],
  ) -> Result<()> {
    let media: Vec<&str> = media.iter().map(MediaType::as_str).collect();
    self
      .send_call_message(to.clone(), CallMessage::propose(sid.to_owned(), &media))
      .await
  }

  pub(crate) async fn send_proceed(&self, to: &BareJid, sid: &str) -> Result<()> {
    self
      .send_call_message(to.clone(), CallMessage::Proceed { sid: sid.to_owned() })
      .await
  }
}
