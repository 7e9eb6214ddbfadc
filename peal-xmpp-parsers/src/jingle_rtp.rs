use std::convert::TryFrom;

use xmpp_parsers::{jingle_rtp::PayloadType, jingle_rtp_hdrext::RtpHdrext, Element, Error};

use crate::{
  jingle_ssma::Source,
  ns::{JINGLE_RTP, JINGLE_RTP_HDREXT, JINGLE_SSMA},
};

/// Wrapper element describing an RTP session (XEP-0167).
///
/// Compared to the stock xmpp-parsers description this one carries the
/// `extmap-allow-mixed` marker (RFC 8285) which WebRTC offers routinely
/// include and which must be echoed back in answers.
///
/// On emission the mandated child order is payload-types, header extensions,
/// sources, rtcp-mux.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Description {
  /// Media type of this stream ("audio", "video").
  pub media: String,

  /// List of encodings that can be used for this RTP stream.
  pub payload_types: Vec<PayloadType>,

  /// List of header extensions negotiated for this stream.
  pub hdrexts: Vec<RtpHdrext>,

  /// Whether one-byte and two-byte header extensions may be mixed.
  pub extmap_allow_mixed: bool,

  /// List of synchronization sources.
  pub ssrcs: Vec<Source>,

  /// Whether RTP and RTCP are multiplexed on a single port (RFC 5761).
  pub rtcp_mux: bool,
}

impl Description {
  /// Create a new RTP description.
  pub fn new(media: String) -> Description {
    Description {
      media,
      ..Default::default()
    }
  }
}

impl TryFrom<Element> for Description {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Description, Error> {
    if !elem.is("description", JINGLE_RTP) {
      return Err(Error::ParseError("This is not an RTP description element."));
    }
    let mut description = Description::new(
      elem
        .attr("media")
        .ok_or(Error::ParseError("RTP description has no media."))?
        .to_owned(),
    );
    for child in elem.children() {
      if child.is("payload-type", JINGLE_RTP) {
        description
          .payload_types
          .push(PayloadType::try_from(child.clone())?);
      }
      else if child.is("rtp-hdrext", JINGLE_RTP_HDREXT) {
        description.hdrexts.push(RtpHdrext::try_from(child.clone())?);
      }
      else if child.is("extmap-allow-mixed", JINGLE_RTP_HDREXT) {
        description.extmap_allow_mixed = true;
      }
      else if child.is("source", JINGLE_SSMA) {
        description.ssrcs.push(Source::try_from(child.clone())?);
      }
      else if child.is("rtcp-mux", JINGLE_RTP) {
        description.rtcp_mux = true;
      }
    }
    Ok(description)
  }
}

impl From<Description> for Element {
  fn from(description: Description) -> Element {
    let mut builder = Element::builder("description", JINGLE_RTP).attr("media", description.media);
    for payload_type in description.payload_types {
      builder = builder.append(Element::from(payload_type));
    }
    for hdrext in description.hdrexts {
      builder = builder.append(Element::from(hdrext));
    }
    if description.extmap_allow_mixed {
      builder = builder.append(Element::builder("extmap-allow-mixed", JINGLE_RTP_HDREXT).build());
    }
    for ssrc in description.ssrcs {
      builder = builder.append(Element::from(ssrc));
    }
    if description.rtcp_mux {
      builder = builder.append(Element::builder("rtcp-mux", JINGLE_RTP).build());
    }
    builder.build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_description() {
    let elem: Element = "
      <description xmlns='urn:xmpp:jingle:apps:rtp:1' media='audio'>
        <payload-type channels='2' clockrate='48000' id='111' name='opus'>
          <parameter name='minptime' value='10'/>
          <parameter name='useinbandfec' value='1'/>
        </payload-type>
        <payload-type clockrate='8000' id='0' name='PCMU'/>
        <rtp-hdrext xmlns='urn:xmpp:jingle:apps:rtp:rtp-hdrext:0' id='1' uri='urn:ietf:params:rtp-hdrext:ssrc-audio-level'/>
        <extmap-allow-mixed xmlns='urn:xmpp:jingle:apps:rtp:rtp-hdrext:0'/>
        <source xmlns='urn:xmpp:jingle:apps:rtp:ssma:0' ssrc='123456'>
          <parameter name='cname' value='abc'/>
        </source>
        <rtcp-mux/>
      </description>"
      .trim().parse()
      .unwrap();
    let description = Description::try_from(elem).unwrap();
    assert_eq!(description.media, "audio");
    assert_eq!(description.payload_types.len(), 2);
    assert_eq!(description.payload_types[0].id, 111);
    assert_eq!(description.payload_types[0].parameters.len(), 2);
    assert_eq!(description.hdrexts.len(), 1);
    assert!(description.extmap_allow_mixed);
    assert_eq!(description.ssrcs.len(), 1);
    assert!(description.rtcp_mux);
  }

  #[test]
  fn emission_order() {
    let mut description = Description::new("audio".to_owned());
    description
      .payload_types
      .push(PayloadType::new(111, "opus".to_owned(), 48000, 2));
    description.ssrcs.push(Source::new("42".to_owned()));
    description.rtcp_mux = true;
    let elem = Element::from(description);
    let names: Vec<_> = elem.children().map(|child| child.name().to_owned()).collect();
    assert_eq!(names, ["payload-type", "source", "rtcp-mux"]);
  }
}
