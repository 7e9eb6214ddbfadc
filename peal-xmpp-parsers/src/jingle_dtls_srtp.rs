use std::convert::TryFrom;

use xmpp_parsers::{Element, Error};

use crate::ns::JINGLE_DTLS;

/// Fingerprint of the key used for a DTLS handshake (XEP-0320).
///
/// The hash name, setup role and colon-separated hex value are kept verbatim
/// as they appear in SDP, so translation never normalizes what the peer sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
  /// The hash algorithm, e.g. "sha-256".
  pub hash: String,

  /// Which end initiates the DTLS handshake ("active", "passive", "actpass").
  pub setup: Option<String>,

  /// Colon-separated hex digest.
  pub value: String,
}

impl TryFrom<Element> for Fingerprint {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Fingerprint, Error> {
    if !elem.is("fingerprint", JINGLE_DTLS) {
      return Err(Error::ParseError("This is not a DTLS fingerprint element."));
    }
    let hash = elem
      .attr("hash")
      .ok_or(Error::ParseError("Fingerprint element has no hash."))?
      .to_owned();
    let value = elem.text().trim().to_owned();
    if value.is_empty() {
      return Err(Error::ParseError("Fingerprint element has no value."));
    }
    Ok(Fingerprint {
      hash,
      setup: elem.attr("setup").map(str::to_owned),
      value,
    })
  }
}

impl From<Fingerprint> for Element {
  fn from(fingerprint: Fingerprint) -> Element {
    Element::builder("fingerprint", JINGLE_DTLS)
      .attr("hash", fingerprint.hash)
      .attr("setup", fingerprint.setup)
      .append(fingerprint.value)
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_fingerprint() {
    let elem: Element = "<fingerprint xmlns='urn:xmpp:jingle:apps:dtls:0' hash='sha-256' setup='actpass'>02:1A:CC:54:27:AB:EB:9C:53:3F:3E:4B:65:2E:7D:46:3F:54:42:CD:54:F1:7A:03:A2:7D:F9:B0:7F:46:19:B2</fingerprint>"
      .parse()
      .unwrap();
    let fingerprint = Fingerprint::try_from(elem).unwrap();
    assert_eq!(fingerprint.hash, "sha-256");
    assert_eq!(fingerprint.setup.as_deref(), Some("actpass"));
    assert!(fingerprint.value.starts_with("02:1A:CC"));
  }

  #[test]
  fn round_trip() {
    let fingerprint = Fingerprint {
      hash: "sha-256".to_owned(),
      setup: Some("active".to_owned()),
      value: "AA:BB:CC".to_owned(),
    };
    let elem = Element::from(fingerprint.clone());
    assert_eq!(Fingerprint::try_from(elem).unwrap(), fingerprint);
  }

  #[test]
  fn missing_value() {
    let elem: Element = "<fingerprint xmlns='urn:xmpp:jingle:apps:dtls:0' hash='sha-256'/>"
      .parse()
      .unwrap();
    assert!(Fingerprint::try_from(elem).is_err());
  }
}
