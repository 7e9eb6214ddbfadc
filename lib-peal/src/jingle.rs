//! Jingle IQ dispatch and stanza building: the four session actions, their
//! acknowledgement, and the translation glue between stanzas, the session
//! table and the media engine.

use std::collections::VecDeque;

use anyhow::{bail, Result};
use peal_xmpp_parsers::{
  jingle::{Action, Content, Creator, Jingle, ReasonElement},
  jingle_ice_udp::Transport,
  jingle_message::CallMessage,
};
use tracing::{debug, error, info, warn};
use xmpp_parsers::{iq::Iq, Jid};

use crate::{
  call::{bare_peer, CallEvent, CallManager, CallSession, IqKind, Role, SessionState},
  ice::{candidate_from_line, candidate_to_line, IceCandidate},
  sdp::{jingle_to_sdp, sdp_to_jingle, MediaType, OfferDetails, Sdp, SdpType},
  util::generate_id,
};

fn remote_credentials(jingle: &Jingle) -> (Option<String>, Option<String>) {
  jingle
    .contents
    .iter()
    .filter_map(|content| content.transport.as_ref())
    .find_map(|transport| match (&transport.ufrag, &transport.pwd) {
      (Some(ufrag), Some(pwd)) => Some((Some(ufrag.clone()), Some(pwd.clone()))),
      _ => None,
    })
    .unwrap_or((None, None))
}

fn media_types(jingle: &Jingle) -> Vec<MediaType> {
  let mut media: Vec<MediaType> = jingle
    .contents
    .iter()
    .filter_map(|content| content.description.as_ref())
    .filter_map(|description| description.media.parse().ok())
    .collect();
  media.dedup();
  if media.is_empty() {
    media.push(MediaType::Audio);
  }
  media
}

impl CallManager {
  pub(crate) async fn handle_jingle_iq(&self, from: &Jid, jingle: Jingle) -> Result<()> {
    debug!(
      "jingle iq: action={} sid={} from={}",
      jingle.action, jingle.sid, from
    );
    match jingle.action {
      Action::SessionInitiate => self.handle_session_initiate(from, jingle).await,
      Action::SessionAccept => self.handle_session_accept(from, jingle).await,
      Action::SessionTerminate => self.handle_session_terminate(from, jingle).await,
      Action::TransportInfo => self.handle_transport_info(from, jingle).await,
    }
  }

  async fn handle_session_initiate(&self, from: &Jid, jingle: Jingle) -> Result<()> {
    let sid = jingle.sid.clone();
    let media = media_types(&jingle);
    let offer_details = OfferDetails::from_jingle(&jingle);
    let (remote_ufrag, remote_pwd) = remote_credentials(&jingle);
    let candidate_count: usize = jingle
      .contents
      .iter()
      .filter_map(|content| content.transport.as_ref())
      .map(|transport| transport.candidates.len())
      .sum();
    let sdp_offer = jingle_to_sdp(&jingle, SdpType::Offer);
    let trickle_only = candidate_count == 0;

    info!(
      "session-initiate for {} from {}: {:?}, {} candidates",
      sid, from, media, candidate_count
    );

    let is_new = {
      let mut inner = self.inner.lock().await;
      if inner.terminated.contains(&sid) {
        debug!("session-initiate for already-terminated session {}", sid);
        return Ok(());
      }
      match inner.sessions.get_mut(&sid) {
        Some(session) => {
          if session.role != Role::Initiator {
            if let Some(timer) = session.trickle_timer.take() {
              timer.abort();
            }
            session.peer = from.clone();
            session.state = SessionState::Incoming;
            session.media = media.clone();
            session.offer_details = Some(offer_details);
            session.remote_ufrag = remote_ufrag;
            session.remote_pwd = remote_pwd;
            session.remote_offer = Some(sdp_offer);
            session.waiting_for_candidates = trickle_only;
            false
          }
          else {
            bail!("session-initiate for a session we initiated");
          }
        },
        None => {
          // A peer skipping the announcement layer and opening with the IQ
          // directly; ring as if a propose had arrived.
          let mut session = CallSession::new(from.clone(), Role::Responder, media.clone());
          session.state = SessionState::Incoming;
          session.offer_details = Some(offer_details);
          session.remote_ufrag = remote_ufrag;
          session.remote_pwd = remote_pwd;
          session.remote_offer = Some(sdp_offer);
          session.waiting_for_candidates = trickle_only;
          inner.sessions.insert(sid.clone(), session);
          true
        },
      }
    };

    if trickle_only {
      // The engine would start connectivity checks against an empty remote
      // candidate set and race the ones trickling in; hold the answer until
      // they arrive or the safety timeout fires.
      info!("offer for {} carries no candidates, deferring answer", sid);
      let timer = self.start_trickle_timer(&sid);
      let mut inner = self.inner.lock().await;
      match inner.sessions.get_mut(&sid) {
        Some(session) => {
          if let Some(old) = session.trickle_timer.replace(timer) {
            old.abort();
          }
        },
        None => timer.abort(),
      }
    }

    if is_new {
      let timer = self.start_ring_timer(&sid, Role::Responder);
      self.store_ring_timer(&sid, timer).await;
      self
        .emit(CallEvent::IncomingCall {
          session_id: sid.clone(),
          peer: from.clone(),
          media,
        })
        .await;
    }

    self.maybe_complete_acceptance(&sid).await
  }

  async fn handle_session_accept(&self, from: &Jid, jingle: Jingle) -> Result<()> {
    let sid = jingle.sid.clone();
    let (remote_ufrag, remote_pwd) = remote_credentials(&jingle);
    let answer_sdp = jingle_to_sdp(&jingle, SdpType::Answer);

    {
      let mut inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get_mut(&sid) else {
        warn!("session-accept for unknown session {}", sid);
        return Ok(());
      };
      if session.role != Role::Initiator || session.state != SessionState::Pending {
        debug!("ignoring session-accept in state {:?}", session.state);
        return Ok(());
      }
      if bare_peer(&session.peer) != bare_peer(from) {
        warn!("session-accept for {} from unexpected sender {}", sid, from);
        return Ok(());
      }
      session.remote_ufrag = remote_ufrag;
      session.remote_pwd = remote_pwd;
      session.state = SessionState::Accepted;
    }

    info!("call {} accepted by peer", sid);

    // The remote description must reach the engine before the queued local
    // candidates leave, or remote candidates arriving during the flush
    // would be refused.
    if let Err(e) = self
      .engine
      .set_remote_description(&sid, &answer_sdp, SdpType::Answer)
      .await
    {
      error!("failed to apply remote answer for {}: {:?}", sid, e);
      return self.end_call(&sid, "connectivity-error", true).await;
    }

    self.flush_pending_candidates(&sid).await;

    {
      let mut inner = self.inner.lock().await;
      if let Some(session) = inner.sessions.get_mut(&sid) {
        session.state = SessionState::Active;
      }
    }
    self.emit(CallEvent::CallAccepted { session_id: sid }).await;
    Ok(())
  }

  async fn handle_session_terminate(&self, from: &Jid, jingle: Jingle) -> Result<()> {
    let sid = jingle.sid.clone();
    let reason = jingle
      .reason
      .as_ref()
      .map(|reason| reason.reason.clone())
      .unwrap_or_else(|| "unknown".to_owned());
    info!("call {} terminated by {}: {}", sid, from, reason);

    let peer = {
      let inner = self.inner.lock().await;
      inner.sessions.get(&sid).map(|session| session.peer.clone())
    };
    if let Some(peer) = peer {
      let finish = CallMessage::Finish {
        sid: sid.clone(),
        reason: Some(ReasonElement::new(&reason)),
      };
      if let Err(e) = self.send_call_message(bare_peer(&peer), finish).await {
        warn!("failed to send finish for {}: {:?}", sid, e);
      }
    }

    self.end_call(&sid, &reason, false).await
  }

  async fn handle_transport_info(&self, from: &Jid, jingle: Jingle) -> Result<()> {
    let sid = jingle.sid.clone();
    let mut received = Vec::new();
    for content in &jingle.contents {
      let Some(transport) = &content.transport else {
        continue;
      };
      // All components are taken, RTCP's component 2 included even under
      // rtcp-mux; the peer's nomination wants to see everything it sent.
      for candidate in &transport.candidates {
        debug!(
          "received candidate for {}: {}:{} ({})",
          sid,
          candidate.ip,
          candidate.port,
          candidate.type_.as_str()
        );
        received.push((
          IceCandidate {
            candidate: candidate_to_line(candidate),
            sdp_mid: content.name.clone(),
            sdp_mline_index: 0,
          },
          candidate.type_,
        ));
      }
    }

    let (was_waiting, engine_live) = {
      let mut inner = self.inner.lock().await;
      let Some(session) = inner.sessions.get_mut(&sid) else {
        warn!("transport-info for unknown session {} from {}", sid, from);
        return Ok(());
      };
      for (_, type_) in &received {
        session.ice_stats.record_received(*type_);
      }
      let was_waiting = session.waiting_for_candidates && !received.is_empty();
      if was_waiting {
        session.waiting_for_candidates = false;
        if let Some(timer) = session.trickle_timer.take() {
          timer.abort();
        }
      }
      if !session.engine_live {
        session
          .remote_candidates
          .extend(received.iter().map(|(candidate, _)| candidate.clone()));
      }
      (was_waiting, session.engine_live)
    };

    if engine_live {
      for (candidate, _) in &received {
        if let Err(e) = self.engine.add_ice_candidate(&sid, candidate).await {
          warn!("failed to add remote candidate for {}: {:?}", sid, e);
        }
      }
    }

    if was_waiting {
      debug!("first candidates arrived for {}, completing deferred answer", sid);
      self.maybe_complete_acceptance(&sid).await?;
    }
    Ok(())
  }

  pub(crate) async fn send_session_initiate(
    &self,
    sid: &str,
    peer: &Jid,
    sdp: &Sdp,
    media: &[MediaType],
    pending: VecDeque<IceCandidate>,
  ) -> Result<()> {
    let mut jingle =
      Jingle::new(Action::SessionInitiate, sid.to_owned()).with_initiator(Jid::Full(self.jid.clone()));
    sdp_to_jingle(sdp, &mut jingle, media, None, true);

    // Hybrid trickle: everything gathered so far rides along inline, the
    // rest streams as transport-info.
    let inline: Vec<_> = pending
      .iter()
      .filter_map(|candidate| candidate_from_line(&candidate.candidate))
      .filter(|candidate| candidate.protocol != "tcp")
      .collect();
    if !inline.is_empty() {
      info!(
        "including {} early candidates in session-initiate for {}",
        inline.len(),
        sid
      );
      for content in &mut jingle.contents {
        if let Some(transport) = content.transport.as_mut() {
          transport.candidates.extend(inline.iter().cloned());
        }
      }
    }

    let iq_id = generate_id();
    let iq = Iq::from_set(iq_id.clone(), jingle)
      .with_to(peer.clone())
      .with_from(Jid::Full(self.jid.clone()));
    self.track_iq(iq_id, IqKind::SessionInitiate, sid);
    self.xmpp_tx.send(iq.into()).await?;
    info!("sent session-initiate for {} to {}", sid, peer);
    Ok(())
  }

  pub(crate) async fn send_session_accept(
    &self,
    sid: &str,
    peer: &Jid,
    sdp: &Sdp,
    media: &[MediaType],
    details: &OfferDetails,
  ) -> Result<()> {
    let mut jingle =
      Jingle::new(Action::SessionAccept, sid.to_owned()).with_responder(Jid::Full(self.jid.clone()));
    sdp_to_jingle(sdp, &mut jingle, media, Some(details), false);

    let iq_id = generate_id();
    let iq = Iq::from_set(iq_id.clone(), jingle)
      .with_to(peer.clone())
      .with_from(Jid::Full(self.jid.clone()));
    self.track_iq(iq_id, IqKind::SessionAccept, sid);
    self.xmpp_tx.send(iq.into()).await?;
    info!("sent session-accept for {} to {}", sid, peer);
    Ok(())
  }

  pub(crate) async fn send_session_terminate(
    &self,
    sid: &str,
    peer: &Jid,
    reason: &str,
  ) -> Result<()> {
    let jingle =
      Jingle::new(Action::SessionTerminate, sid.to_owned()).set_reason(ReasonElement::new(reason));
    let iq_id = generate_id();
    let iq = Iq::from_set(iq_id.clone(), jingle)
      .with_to(peer.clone())
      .with_from(Jid::Full(self.jid.clone()));
    self.track_iq(iq_id, IqKind::SessionTerminate, sid);
    self.xmpp_tx.send(iq.into()).await?;
    info!("sent session-terminate for {}: {}", sid, reason);
    Ok(())
  }

  /// One candidate per stanza. TCP candidates are dropped outright; a
  /// widespread peer implementation answers them with service-unavailable.
  /// Credentials stay out: they were exchanged in initiate/accept.
  pub(crate) async fn send_transport_info(
    &self,
    sid: &str,
    peer: &Jid,
    candidate: &IceCandidate,
  ) -> Result<()> {
    let Some(parsed) = candidate_from_line(&candidate.candidate) else {
      warn!("invalid candidate line for {}: {}", sid, candidate.candidate);
      return Ok(());
    };
    if parsed.protocol == "tcp" {
      debug!("dropping TCP candidate for {}", sid);
      return Ok(());
    }

    {
      let mut inner = self.inner.lock().await;
      if let Some(session) = inner.sessions.get_mut(sid) {
        session.ice_stats.record_sent(parsed.type_);
      }
    }

    let transport = Transport::new().add_candidate(parsed);
    let content = Content::new(Creator::Initiator, candidate.sdp_mid.clone()).with_transport(transport);
    let jingle = Jingle::new(Action::TransportInfo, sid.to_owned()).add_content(content);

    let iq_id = generate_id();
    let iq = Iq::from_set(iq_id.clone(), jingle)
      .with_to(peer.clone())
      .with_from(Jid::Full(self.jid.clone()));
    self.track_iq(iq_id, IqKind::TransportInfo, sid);
    self.xmpp_tx.send(iq.into()).await?;
    debug!("sent candidate for {} to {}", sid, peer);
    Ok(())
  }
}
