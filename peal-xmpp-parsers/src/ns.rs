pub use xmpp_parsers::ns::{
  JINGLE, JINGLE_DTLS, JINGLE_GROUPING, JINGLE_ICE_UDP, JINGLE_MESSAGE, JINGLE_RTCP_FB,
  JINGLE_RTP, JINGLE_RTP_HDREXT, JINGLE_SSMA,
};

/// Non-standard ICE-UDP transport options advertising trickle and
/// renomination support. Several mobile clients require these markers.
pub const JINGLE_ICE_OPTION: &str =
  "http://gultsch.de/xmpp/drafts/jingle/transports/ice-udp/option";
