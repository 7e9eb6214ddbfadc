use std::{collections::HashMap, fmt, str::FromStr};

use itertools::Itertools;
use peal_xmpp_parsers::{
  jingle::{Content, Creator, Group, Jingle, Senders},
  jingle_dtls_srtp::Fingerprint,
  jingle_ice_udp::{Candidate, Transport},
  jingle_rtp::Description,
  jingle_ssma::{Parameter as SsmaParameter, Source},
};
use tracing::debug;
use xmpp_parsers::{
  jingle_rtcp_fb::RtcpFb,
  jingle_rtp::{Parameter, PayloadType},
  jingle_rtp_hdrext::RtpHdrext,
};

use crate::ice::{candidate_from_line, candidate_to_line};

/// Media types a call can carry. Only audio is negotiated today; video is
/// reserved in the data model.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum MediaType {
  Audio,
  Video,
}

impl MediaType {
  pub fn as_str(&self) -> &'static str {
    match self {
      MediaType::Audio => "audio",
      MediaType::Video => "video",
    }
  }
}

impl FromStr for MediaType {
  type Err = ();

  fn from_str(s: &str) -> Result<MediaType, ()> {
    match s {
      "audio" => Ok(MediaType::Audio),
      "video" => Ok(MediaType::Video),
      _ => Err(()),
    }
  }
}

impl fmt::Display for MediaType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Whether an SDP describes an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
  Offer,
  Answer,
}

impl SdpType {
  pub fn as_str(&self) -> &'static str {
    match self {
      SdpType::Offer => "offer",
      SdpType::Answer => "answer",
    }
  }
}

/// An rtpmap entry: one codec configuration bound to a payload id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rtpmap {
  pub id: u8,
  pub name: String,
  pub clockrate: u32,
  pub channels: u8,
}

/// One parsed `m=` section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaSection {
  /// "audio" or "video" (anything else is carried but filtered out during
  /// translation).
  pub media: String,

  /// The `a=mid:` value; Jingle content names map to this.
  pub mid: Option<String>,

  /// Payload ids listed on the `m=` line, in order.
  pub payload_ids: Vec<u8>,

  pub rtpmaps: Vec<Rtpmap>,

  /// fmtp parameters per payload id, in SDP order.
  pub fmtp: Vec<(u8, Vec<(String, String)>)>,

  pub rtcp_mux: bool,

  pub candidates: Vec<Candidate>,

  /// SSRC attributes, grouped by synchronization source, in SDP order.
  pub ssrcs: Vec<(String, Vec<(String, String)>)>,
}

impl MediaSection {
  fn fmtp_for(&self, id: u8) -> Option<&[(String, String)]> {
    self
      .fmtp
      .iter()
      .find(|(fmtp_id, _)| *fmtp_id == id)
      .map(|(_, params)| params.as_slice())
  }
}

/// A leniently parsed session description. Unknown lines are skipped; the
/// engine and peers routinely produce attributes this layer has no use for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sdp {
  pub ufrag: Option<String>,
  pub pwd: Option<String>,
  pub fingerprint_hash: Option<String>,
  pub fingerprint: Option<String>,
  pub setup: Option<String>,
  pub media: Vec<MediaSection>,
}

impl Sdp {
  pub fn parse(sdp: &str) -> Sdp {
    let mut parsed = Sdp::default();
    let mut current: Option<MediaSection> = None;

    for line in sdp.lines() {
      let line = line.trim_end_matches('\r');

      if let Some(m_line) = line.strip_prefix("m=") {
        if let Some(section) = current.take() {
          parsed.media.push(section);
        }
        let mut parts = m_line.split(' ');
        let media = parts.next().unwrap_or_default().to_owned();
        // Skip port and protocol; everything after is the payload list.
        let payload_ids = parts.skip(2).filter_map(|id| id.parse().ok()).collect();
        current = Some(MediaSection {
          media,
          payload_ids,
          ..Default::default()
        });
        continue;
      }

      // Credentials, fingerprint and setup can appear at session level or be
      // repeated per section; the last occurrence wins either way.
      if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
        parsed.ufrag = Some(ufrag.to_owned());
      }
      else if let Some(pwd) = line.strip_prefix("a=ice-pwd:") {
        parsed.pwd = Some(pwd.to_owned());
      }
      else if let Some(fingerprint) = line.strip_prefix("a=fingerprint:") {
        if let Some((hash, value)) = fingerprint.split_once(' ') {
          parsed.fingerprint_hash = Some(hash.to_owned());
          parsed.fingerprint = Some(value.to_owned());
        }
      }
      else if let Some(setup) = line.strip_prefix("a=setup:") {
        parsed.setup = Some(setup.to_owned());
      }

      let Some(section) = current.as_mut() else {
        continue;
      };

      if let Some(mid) = line.strip_prefix("a=mid:") {
        section.mid = Some(mid.to_owned());
      }
      else if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
        if let Some((id, codec)) = rtpmap.split_once(' ') {
          let Ok(id) = id.parse() else { continue };
          let mut codec = codec.split('/');
          let name = codec.next().unwrap_or_default().to_owned();
          let clockrate = codec.next().and_then(|rate| rate.parse().ok()).unwrap_or(48000);
          let channels = codec.next().and_then(|channels| channels.parse().ok()).unwrap_or(1);
          section.rtpmaps.push(Rtpmap {
            id,
            name,
            clockrate,
            channels,
          });
        }
      }
      else if let Some(fmtp) = line.strip_prefix("a=fmtp:") {
        if let Some((id, params)) = fmtp.split_once(' ') {
          let Ok(id) = id.parse() else { continue };
          let params = params
            .split(';')
            .filter_map(|param| param.trim().split_once('='))
            .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
            .collect();
          section.fmtp.push((id, params));
        }
      }
      else if line == "a=rtcp-mux" {
        section.rtcp_mux = true;
      }
      else if line.starts_with("a=candidate:") {
        if let Some(candidate) = candidate_from_line(line) {
          section.candidates.push(candidate);
        }
        else {
          debug!("skipping malformed candidate line: {}", line);
        }
      }
      else if let Some(ssrc) = line.strip_prefix("a=ssrc:") {
        if let Some((id, attr)) = ssrc.split_once(' ') {
          let (name, value) = match attr.split_once(':') {
            Some((name, value)) => (name.to_owned(), value.to_owned()),
            None => (attr.to_owned(), String::new()),
          };
          match section.ssrcs.iter_mut().find(|(ssrc_id, _)| ssrc_id == id) {
            Some((_, attrs)) => attrs.push((name, value)),
            None => section.ssrcs.push((id.to_owned(), vec![(name, value)])),
          }
        }
      }
    }

    if let Some(section) = current.take() {
      parsed.media.push(section);
    }
    parsed
  }

  /// Total candidate count across all media sections. A zero here on an
  /// offer marks it as trickle-only.
  pub fn candidate_count(&self) -> usize {
    self.media.iter().map(|section| section.candidates.len()).sum()
  }
}

/// The digest of a remote offer needed to build a compatible answer.
///
/// WebRTC expects features present in the offer to be echoed in the answer;
/// anything beyond that (extra SSRC parameters in particular) confuses some
/// peers, so the answer is filtered against this digest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfferDetails {
  /// Content names of the offer's BUNDLE group.
  pub bundle_group: Option<Vec<String>>,

  /// RTP header extensions, shared across bundled media.
  pub rtp_extensions: Vec<RtpHdrext>,

  /// Whether the offer allowed mixed one/two-byte extension headers.
  pub extmap_allow_mixed: bool,

  /// Codec parameters per payload id.
  pub codec_params: HashMap<u8, Vec<(String, String)>>,

  /// Feedback types per payload id.
  pub rtcp_fb: HashMap<u8, Vec<String>>,

  /// Whether the offer carried a synchronization source.
  pub has_ssrc: bool,

  /// SSRC parameter names used by the offer; the answer may not use others.
  pub ssrc_params: Vec<String>,
}

impl OfferDetails {
  pub fn from_jingle(jingle: &Jingle) -> OfferDetails {
    let mut details = OfferDetails::default();

    if let Some(group) = &jingle.group {
      if group.semantics == "BUNDLE" {
        details.bundle_group = Some(group.contents.clone());
      }
    }

    for content in &jingle.contents {
      let Some(description) = &content.description else {
        continue;
      };
      details.rtp_extensions.extend(description.hdrexts.iter().cloned());
      if description.extmap_allow_mixed {
        details.extmap_allow_mixed = true;
      }
      for source in &description.ssrcs {
        details.has_ssrc = true;
        for parameter in &source.parameters {
          if !details.ssrc_params.contains(&parameter.name) {
            details.ssrc_params.push(parameter.name.clone());
          }
        }
      }
      for payload_type in &description.payload_types {
        if !payload_type.parameters.is_empty() {
          details.codec_params.insert(
            payload_type.id,
            payload_type
              .parameters
              .iter()
              .map(|parameter| (parameter.name.clone(), parameter.value.clone()))
              .collect(),
          );
        }
        if !payload_type.rtcp_fbs.is_empty() {
          details.rtcp_fb.insert(
            payload_type.id,
            payload_type.rtcp_fbs.iter().map(|fb| fb.type_.clone()).collect(),
          );
        }
      }
    }

    details
  }
}

/// Translate a session description into Jingle contents appended to
/// `jingle`, one per media section matching `media_filter`.
///
/// `offer_details` is the stored digest of the remote offer when building an
/// answer; its features are echoed after the contents are built. SSRC
/// sources are emitted only when the offer carried one and `include_ssrc`
/// is set.
pub fn sdp_to_jingle(
  sdp: &Sdp,
  jingle: &mut Jingle,
  media_filter: &[MediaType],
  offer_details: Option<&OfferDetails>,
  include_ssrc: bool,
) {
  let include_ssrc = include_ssrc && offer_details.map_or(false, |details| details.has_ssrc);
  let allowed_ssrc_params: &[String] =
    offer_details.map_or(&[], |details| details.ssrc_params.as_slice());

  for section in &sdp.media {
    let Ok(media) = section.media.parse::<MediaType>() else {
      continue;
    };
    if !media_filter.contains(&media) {
      continue;
    }

    let content_name = section.mid.clone().unwrap_or_else(|| section.media.clone());

    let mut description = Description::new(section.media.clone());
    for rtpmap in &section.rtpmaps {
      if !section.payload_ids.contains(&rtpmap.id) {
        continue;
      }
      // Opus is always stereo, whatever the SDP says; several peers refuse
      // the payload type otherwise.
      let channels = if rtpmap.name.eq_ignore_ascii_case("opus") {
        2
      }
      else {
        rtpmap.channels
      };
      let mut payload_type =
        PayloadType::new(rtpmap.id, rtpmap.name.clone(), rtpmap.clockrate, channels);
      if let Some(params) = section.fmtp_for(rtpmap.id) {
        payload_type.parameters = params
          .iter()
          .map(|(name, value)| Parameter {
            name: name.clone(),
            value: value.clone(),
          })
          .collect();
      }
      description.payload_types.push(payload_type);
    }

    if include_ssrc {
      for (ssrc, attrs) in &section.ssrcs {
        let mut source = Source::new(ssrc.clone());
        for (name, value) in attrs {
          if allowed_ssrc_params.is_empty() || allowed_ssrc_params.contains(name) {
            source.parameters.push(SsmaParameter {
              name: name.clone(),
              value: Some(value.clone()),
            });
          }
        }
        description.ssrcs.push(source);
      }
    }

    description.rtcp_mux = section.rtcp_mux;

    let mut transport = Transport {
      ufrag: sdp.ufrag.clone(),
      pwd: sdp.pwd.clone(),
      trickle: true,
      renomination: true,
      ..Default::default()
    };
    transport.candidates = section.candidates.clone();
    if let (Some(hash), Some(value)) = (&sdp.fingerprint_hash, &sdp.fingerprint) {
      transport.fingerprint = Some(Fingerprint {
        hash: hash.clone(),
        setup: sdp.setup.clone(),
        value: value.clone(),
      });
    }

    jingle.contents.push(
      Content::new(Creator::Initiator, content_name)
        .with_senders(Senders::Both)
        .with_description(description)
        .with_transport(transport),
    );
  }

  if let Some(details) = offer_details {
    echo_offer_features(jingle, details);
  }
}

/// Echo the offer's WebRTC features into an answer Jingle: header extensions
/// (first content only, per BUNDLE), codec parameters for payload types that
/// have none yet, feedback types, and the BUNDLE group itself.
pub fn echo_offer_features(jingle: &mut Jingle, details: &OfferDetails) {
  if !details.rtp_extensions.is_empty() {
    if let Some(description) = jingle
      .contents
      .iter_mut()
      .find_map(|content| content.description.as_mut())
    {
      description.hdrexts = details.rtp_extensions.clone();
      if details.extmap_allow_mixed {
        description.extmap_allow_mixed = true;
      }
    }
  }

  for content in &mut jingle.contents {
    let Some(description) = content.description.as_mut() else {
      continue;
    };
    for payload_type in &mut description.payload_types {
      if payload_type.parameters.is_empty() {
        if let Some(params) = details.codec_params.get(&payload_type.id) {
          payload_type.parameters = params
            .iter()
            .map(|(name, value)| Parameter {
              name: name.clone(),
              value: value.clone(),
            })
            .collect();
        }
      }
      if let Some(fb_types) = details.rtcp_fb.get(&payload_type.id) {
        payload_type.rtcp_fbs = fb_types
          .iter()
          .map(|type_| RtcpFb {
            type_: type_.clone(),
            subtype: None,
          })
          .collect();
      }
    }
  }

  if details.bundle_group.is_some() {
    let names = jingle
      .contents
      .iter()
      .map(|content| content.name.clone())
      .collect();
    jingle.group = Some(Group::bundle(names));
  }
}

/// Render a Jingle session as a normalized SDP for the media engine.
///
/// rtcp-mux is deliberately never emitted even when the Jingle carries it:
/// the engine then gathers both RTP and RTCP components, which peers that
/// predate mux-only still require, and re-negotiates mux in its answer.
pub fn jingle_to_sdp(jingle: &Jingle, sdp_type: SdpType) -> String {
  let mut lines: Vec<String> = vec![
    "v=0".to_owned(),
    "o=- 0 0 IN IP4 0.0.0.0".to_owned(),
    "s=-".to_owned(),
    "t=0 0".to_owned(),
  ];

  for content in &jingle.contents {
    let Some(description) = &content.description else {
      continue;
    };

    let payload_ids = if description.payload_types.is_empty() {
      "111".to_owned()
    }
    else {
      description
        .payload_types
        .iter()
        .map(|payload_type| payload_type.id.to_string())
        .join(" ")
    };
    lines.push(format!("m={} 9 UDP/TLS/RTP/SAVPF {}", description.media, payload_ids));
    lines.push("c=IN IP4 0.0.0.0".to_owned());
    lines.push("a=rtcp:9 IN IP4 0.0.0.0".to_owned());
    // The engine matches offer and answer sections by mid.
    lines.push(format!("a=mid:{}", content.name));

    if description.payload_types.is_empty() && description.media == "audio" {
      lines.push("a=rtpmap:111 opus/48000/2".to_owned());
    }
    for payload_type in &description.payload_types {
      let name = payload_type.name.as_deref().unwrap_or("opus");
      let clockrate = payload_type.clockrate.unwrap_or(48000);
      if payload_type.channels.0 > 1 {
        lines.push(format!(
          "a=rtpmap:{} {}/{}/{}",
          payload_type.id, name, clockrate, payload_type.channels.0
        ));
      }
      else {
        lines.push(format!("a=rtpmap:{} {}/{}", payload_type.id, name, clockrate));
      }
      if !payload_type.parameters.is_empty() {
        let params = payload_type
          .parameters
          .iter()
          .map(|parameter| format!("{}={}", parameter.name, parameter.value))
          .join(";");
        lines.push(format!("a=fmtp:{} {}", payload_type.id, params));
      }
    }

    if let Some(transport) = &content.transport {
      if let Some(ufrag) = &transport.ufrag {
        lines.push(format!("a=ice-ufrag:{}", ufrag));
      }
      if let Some(pwd) = &transport.pwd {
        lines.push(format!("a=ice-pwd:{}", pwd));
      }
      lines.push("a=ice-options:trickle".to_owned());
      if let Some(fingerprint) = &transport.fingerprint {
        lines.push(format!(
          "a=setup:{}",
          fingerprint.setup.as_deref().unwrap_or("actpass")
        ));
        lines.push(format!("a=fingerprint:{} {}", fingerprint.hash, fingerprint.value));
      }
      for candidate in &transport.candidates {
        lines.push(format!("a={}", candidate_to_line(candidate)));
      }
    }

    let _ = sdp_type; // direction is sendrecv for both offers and answers
    lines.push("a=sendrecv".to_owned());
  }

  let mut sdp = lines.join("\r\n");
  sdp.push_str("\r\n");
  sdp
}

#[cfg(test)]
mod tests {
  use super::*;
  use peal_xmpp_parsers::jingle::Action;

  const OFFER_SDP: &str = "v=0\r\n\
    o=- 633516308735837856 1681295469 IN IP4 0.0.0.0\r\n\
    s=-\r\n\
    t=0 0\r\n\
    a=fingerprint:sha-256 0F:74:31:28:1C:B8:BD:E9:B3:17:C1:62:19:95:F0:45:73:15:04:8E:FF:97:41:17:D1:34:09:3B:20:9B:D1:0F\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=setup:actpass\r\n\
    a=mid:0\r\n\
    a=ice-ufrag:TpaLsgvFYjmV\r\n\
    a=ice-pwd:tllfbzSGNeNmGFrLpctttiXPdJyvifMn\r\n\
    a=rtcp-mux\r\n\
    a=rtpmap:111 opus/48000/2\r\n\
    a=fmtp:111 minptime=10;useinbandfec=1\r\n\
    a=rtpmap:0 PCMU/8000\r\n\
    a=ssrc:3535502179 cname:peal-audio\r\n\
    a=ssrc:3535502179 msid:stream track\r\n\
    a=sendrecv\r\n\
    a=candidate:1966762133 1 udp 2130706431 192.0.2.10 41925 typ host\r\n\
    a=candidate:1966762134 1 tcp 1671430143 192.0.2.10 9 typ host\r\n\
    a=candidate:2130706431 1 udp 1694498815 203.0.113.5 41925 typ srflx raddr 0.0.0.0 rport 41925\r\n";

  fn audio_filter() -> Vec<MediaType> {
    vec![MediaType::Audio]
  }

  #[test]
  fn parse_offer() {
    let sdp = Sdp::parse(OFFER_SDP);
    assert_eq!(sdp.ufrag.as_deref(), Some("TpaLsgvFYjmV"));
    assert_eq!(sdp.pwd.as_deref(), Some("tllfbzSGNeNmGFrLpctttiXPdJyvifMn"));
    assert_eq!(sdp.fingerprint_hash.as_deref(), Some("sha-256"));
    assert_eq!(sdp.setup.as_deref(), Some("actpass"));
    assert_eq!(sdp.media.len(), 1);
    let section = &sdp.media[0];
    assert_eq!(section.media, "audio");
    assert_eq!(section.mid.as_deref(), Some("0"));
    assert_eq!(section.payload_ids, [111, 0]);
    assert_eq!(section.rtpmaps.len(), 2);
    assert!(section.rtcp_mux);
    assert_eq!(section.candidates.len(), 3);
    assert_eq!(section.ssrcs.len(), 1);
    assert_eq!(section.ssrcs[0].1.len(), 2);
    assert_eq!(sdp.candidate_count(), 3);
  }

  #[test]
  fn zero_candidate_offer_is_trickle_only() {
    let sdp = Sdp::parse("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n");
    assert_eq!(sdp.candidate_count(), 0);
  }

  #[test]
  fn opus_is_always_stereo() {
    let mut sdp = Sdp::parse(OFFER_SDP);
    // Claim mono opus; the translation must still emit channels="2".
    sdp.media[0].rtpmaps[0].channels = 1;
    let mut jingle = Jingle::new(Action::SessionInitiate, "sid".to_owned());
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), None, true);
    let description = jingle.contents[0].description.as_ref().unwrap();
    let opus = &description.payload_types[0];
    assert_eq!(opus.name.as_deref(), Some("opus"));
    assert_eq!(opus.channels.0, 2);
    // PCMU stays mono and emits no channels attribute at all.
    let pcmu = &description.payload_types[1];
    assert_eq!(pcmu.channels.0, 1);
    let element = xmpp_parsers::Element::from(pcmu.clone());
    assert_eq!(element.attr("channels"), None);
  }

  #[test]
  fn fmtp_parameters_are_carried() {
    let sdp = Sdp::parse(OFFER_SDP);
    let mut jingle = Jingle::new(Action::SessionInitiate, "sid".to_owned());
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), None, true);
    let description = jingle.contents[0].description.as_ref().unwrap();
    let opus = &description.payload_types[0];
    assert_eq!(opus.parameters.len(), 2);
    assert_eq!(opus.parameters[0].name, "minptime");
    assert_eq!(opus.parameters[0].value, "10");
  }

  #[test]
  fn transport_carries_credentials_candidates_and_options() {
    let sdp = Sdp::parse(OFFER_SDP);
    let mut jingle = Jingle::new(Action::SessionInitiate, "sid".to_owned());
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), None, true);
    let transport = jingle.contents[0].transport.as_ref().unwrap();
    assert_eq!(transport.ufrag.as_deref(), Some("TpaLsgvFYjmV"));
    assert_eq!(transport.candidates.len(), 3);
    assert!(transport.trickle);
    assert!(transport.renomination);
    let fingerprint = transport.fingerprint.as_ref().unwrap();
    assert_eq!(fingerprint.hash, "sha-256");
    assert_eq!(fingerprint.setup.as_deref(), Some("actpass"));
  }

  #[test]
  fn ssrc_needs_offer_details() {
    let sdp = Sdp::parse(OFFER_SDP);
    let mut jingle = Jingle::new(Action::SessionInitiate, "sid".to_owned());
    // No stored offer digest: no source element, even with include_ssrc.
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), None, true);
    assert!(jingle.contents[0].description.as_ref().unwrap().ssrcs.is_empty());
  }

  #[test]
  fn ssrc_parameters_are_filtered_against_offer() {
    let sdp = Sdp::parse(OFFER_SDP);
    let details = OfferDetails {
      has_ssrc: true,
      ssrc_params: vec!["cname".to_owned()],
      ..Default::default()
    };
    let mut jingle = Jingle::new(Action::SessionAccept, "sid".to_owned());
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), Some(&details), true);
    let sources = &jingle.contents[0].description.as_ref().unwrap().ssrcs;
    assert_eq!(sources.len(), 1);
    // msid was not in the offer, so only cname survives.
    assert_eq!(sources[0].parameters.len(), 1);
    assert_eq!(sources[0].parameters[0].name, "cname");
  }

  #[test]
  fn include_ssrc_false_suppresses_sources() {
    let sdp = Sdp::parse(OFFER_SDP);
    let details = OfferDetails {
      has_ssrc: true,
      ..Default::default()
    };
    let mut jingle = Jingle::new(Action::SessionAccept, "sid".to_owned());
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), Some(&details), false);
    assert!(jingle.contents[0].description.as_ref().unwrap().ssrcs.is_empty());
  }

  #[test]
  fn bundle_and_extensions_are_echoed() {
    let sdp = Sdp::parse(OFFER_SDP);
    let details = OfferDetails {
      bundle_group: Some(vec!["0".to_owned()]),
      rtp_extensions: vec![RtpHdrext::new(
        1,
        "urn:ietf:params:rtp-hdrext:ssrc-audio-level".to_owned(),
      )],
      extmap_allow_mixed: true,
      ..Default::default()
    };
    let mut jingle = Jingle::new(Action::SessionAccept, "sid".to_owned());
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), Some(&details), false);
    let group = jingle.group.as_ref().unwrap();
    assert_eq!(group.semantics, "BUNDLE");
    assert_eq!(group.contents, ["0"]);
    let description = jingle.contents[0].description.as_ref().unwrap();
    assert_eq!(description.hdrexts.len(), 1);
    assert!(description.extmap_allow_mixed);
  }

  #[test]
  fn echo_does_not_duplicate_existing_fmtp() {
    let sdp = Sdp::parse(OFFER_SDP);
    let mut details = OfferDetails::default();
    details.codec_params.insert(
      111,
      vec![("minptime".to_owned(), "20".to_owned())],
    );
    let mut jingle = Jingle::new(Action::SessionAccept, "sid".to_owned());
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), Some(&details), false);
    let opus = &jingle.contents[0].description.as_ref().unwrap().payload_types[0];
    // The engine's SDP already carried fmtp for opus; the offer's copy must
    // not replace or duplicate it.
    assert_eq!(opus.parameters.len(), 2);
    assert_eq!(opus.parameters[0].value, "10");
  }

  #[test]
  fn echo_fills_missing_params_and_feedback() {
    let sdp = Sdp::parse(
      "v=0\r\na=ice-ufrag:u\r\na=ice-pwd:p\r\n\
       m=audio 9 UDP/TLS/RTP/SAVPF 0\r\na=mid:0\r\na=rtpmap:0 PCMU/8000\r\n",
    );
    let mut details = OfferDetails::default();
    details
      .codec_params
      .insert(0, vec![("annexb".to_owned(), "no".to_owned())]);
    details.rtcp_fb.insert(0, vec!["transport-cc".to_owned()]);
    let mut jingle = Jingle::new(Action::SessionAccept, "sid".to_owned());
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), Some(&details), false);
    let pcmu = &jingle.contents[0].description.as_ref().unwrap().payload_types[0];
    assert_eq!(pcmu.parameters.len(), 1);
    assert_eq!(pcmu.parameters[0].name, "annexb");
    assert_eq!(pcmu.rtcp_fbs.len(), 1);
    assert_eq!(pcmu.rtcp_fbs[0].type_, "transport-cc");
  }

  #[test]
  fn generated_sdp_omits_rtcp_mux() {
    let sdp = Sdp::parse(OFFER_SDP);
    let mut jingle = Jingle::new(Action::SessionInitiate, "sid".to_owned());
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), None, true);
    assert!(jingle.contents[0].description.as_ref().unwrap().rtcp_mux);
    let rendered = jingle_to_sdp(&jingle, SdpType::Offer);
    assert!(!rendered.contains("a=rtcp-mux"));
    assert!(rendered.contains("a=mid:0"));
    assert!(rendered.contains("a=ice-options:trickle"));
  }

  #[test]
  fn round_trip_preserves_the_wire_facts() {
    let sdp = Sdp::parse(OFFER_SDP);
    let mut jingle = Jingle::new(Action::SessionInitiate, "sid".to_owned());
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), None, true);

    let rendered = jingle_to_sdp(&jingle, SdpType::Offer);
    let mut round_tripped = Jingle::new(Action::SessionInitiate, "sid".to_owned());
    sdp_to_jingle(&Sdp::parse(&rendered), &mut round_tripped, &audio_filter(), None, true);

    let before = &jingle.contents[0];
    let after = &round_tripped.contents[0];
    assert_eq!(before.name, after.name);
    let (description_before, description_after) = (
      before.description.as_ref().unwrap(),
      after.description.as_ref().unwrap(),
    );
    assert_eq!(description_before.payload_types, description_after.payload_types);
    let (transport_before, transport_after) = (
      before.transport.as_ref().unwrap(),
      after.transport.as_ref().unwrap(),
    );
    assert_eq!(transport_before.ufrag, transport_after.ufrag);
    assert_eq!(transport_before.pwd, transport_after.pwd);
    assert_eq!(transport_before.fingerprint, transport_after.fingerprint);
    assert_eq!(transport_before.candidates, transport_after.candidates);
  }

  #[test]
  fn media_filter_drops_video_sections() {
    let sdp = Sdp::parse(
      "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\na=rtpmap:96 VP8/90000\r\n\
       m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=rtpmap:111 opus/48000/2\r\n",
    );
    let mut jingle = Jingle::new(Action::SessionInitiate, "sid".to_owned());
    sdp_to_jingle(&sdp, &mut jingle, &audio_filter(), None, true);
    assert_eq!(jingle.contents.len(), 1);
    assert_eq!(jingle.contents[0].name, "0");
  }
}
