mod call;
mod config;
mod engine;
mod ice;
mod jingle;
mod message;
mod sdp;
mod stanza_filter;
mod util;

pub use crate::{
  call::{CallEvent, CallManager, CallOutcome, Role, SessionInfo, SessionState},
  config::{AudioProcessing, CallConfig, ProxyConfig, ProxyType, SessionConfig, TurnConfig},
  engine::{
    AudioDevice, ConnectionState, Engine, EngineClient, EngineConfig, EngineEvent, MediaEngine,
    SessionStats,
  },
  ice::{CandidateCounts, IceCandidate, IceStats},
  sdp::{
    echo_offer_features, jingle_to_sdp, sdp_to_jingle, MediaSection, MediaType, OfferDetails,
    Rtpmap, Sdp, SdpType,
  },
  stanza_filter::StanzaFilter,
};

#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing(level: tracing::Level) {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
    .with_target(false)
    .init();
}
