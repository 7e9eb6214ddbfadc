use std::{convert::TryFrom, str::FromStr};

use xmpp_parsers::{Element, Error};

use crate::{
  jingle_dtls_srtp::Fingerprint,
  ns::{JINGLE_DTLS, JINGLE_ICE_OPTION, JINGLE_ICE_UDP},
};

/// Wrapper element for an ICE-UDP transport (XEP-0176).
///
/// Children are emitted in the order candidates, fingerprint, option markers;
/// some peers reject transports with any other layout.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transport {
  /// A User Fragment as defined in ICE-CORE.
  pub ufrag: Option<String>,

  /// A Password as defined in ICE-CORE.
  pub pwd: Option<String>,

  /// List of candidates for this ICE-UDP session.
  pub candidates: Vec<Candidate>,

  /// Fingerprint of the key used for the DTLS handshake.
  pub fingerprint: Option<Fingerprint>,

  /// Marker advertising incremental candidate delivery.
  pub trickle: bool,

  /// Marker advertising ICE renomination support.
  pub renomination: bool,
}

impl Transport {
  /// Create a new ICE-UDP transport.
  pub fn new() -> Transport {
    Default::default()
  }

  /// Add a candidate to this transport.
  pub fn add_candidate(mut self, candidate: Candidate) -> Self {
    self.candidates.push(candidate);
    self
  }

  /// Set the DTLS-SRTP fingerprint of this transport.
  pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
    self.fingerprint = Some(fingerprint);
    self
  }
}

impl TryFrom<Element> for Transport {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Transport, Error> {
    if !elem.is("transport", JINGLE_ICE_UDP) {
      return Err(Error::ParseError("This is not an ICE-UDP transport element."));
    }
    let mut transport = Transport {
      ufrag: elem.attr("ufrag").map(str::to_owned),
      pwd: elem.attr("pwd").map(str::to_owned),
      ..Default::default()
    };
    for child in elem.children() {
      if child.is("candidate", JINGLE_ICE_UDP) {
        transport.candidates.push(Candidate::try_from(child.clone())?);
      }
      else if child.is("fingerprint", JINGLE_DTLS) {
        transport.fingerprint = Some(Fingerprint::try_from(child.clone())?);
      }
      else if child.is("trickle", JINGLE_ICE_OPTION) {
        transport.trickle = true;
      }
      else if child.is("renomination", JINGLE_ICE_OPTION) {
        transport.renomination = true;
      }
    }
    Ok(transport)
  }
}

impl From<Transport> for Element {
  fn from(transport: Transport) -> Element {
    let mut builder = Element::builder("transport", JINGLE_ICE_UDP)
      .attr("ufrag", transport.ufrag)
      .attr("pwd", transport.pwd);
    for candidate in transport.candidates {
      builder = builder.append(Element::from(candidate));
    }
    if let Some(fingerprint) = transport.fingerprint {
      builder = builder.append(Element::from(fingerprint));
    }
    if transport.trickle {
      builder = builder.append(Element::builder("trickle", JINGLE_ICE_OPTION).build());
    }
    if transport.renomination {
      builder = builder.append(Element::builder("renomination", JINGLE_ICE_OPTION).build());
    }
    builder.build()
  }
}

/// A Candidate Type as defined in ICE-CORE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
  /// Host candidate.
  Host,

  /// Peer reflexive candidate.
  Prflx,

  /// Relayed candidate.
  Relay,

  /// Server reflexive candidate.
  Srflx,
}

impl Type {
  pub fn as_str(&self) -> &'static str {
    match self {
      Type::Host => "host",
      Type::Prflx => "prflx",
      Type::Relay => "relay",
      Type::Srflx => "srflx",
    }
  }
}

impl FromStr for Type {
  type Err = Error;

  fn from_str(s: &str) -> Result<Type, Error> {
    Ok(match s {
      "host" => Type::Host,
      "prflx" => Type::Prflx,
      "relay" => Type::Relay,
      "srflx" => Type::Srflx,
      _ => return Err(Error::ParseError("Unknown ICE candidate type.")),
    })
  }
}

/// A candidate for an ICE-UDP session.
///
/// The address is kept as a string: browser-family peers emit mDNS `.local`
/// hostnames that must be relayed to the media engine untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
  /// A Component ID as defined in ICE-CORE.
  pub component: u8,

  /// A Foundation as defined in ICE-CORE.
  pub foundation: String,

  /// An index enabling the parties to track updates to the candidate.
  pub generation: u8,

  /// A unique identifier for the candidate.
  pub id: Option<String>,

  /// The address of the candidate transport: an IP address or mDNS hostname.
  pub ip: String,

  /// The port at the candidate address.
  pub port: u16,

  /// A Priority as defined in ICE-CORE.
  pub priority: u32,

  /// The transport protocol, lowercase ("udp", "tcp").
  pub protocol: String,

  /// A Candidate Type as defined in ICE-CORE.
  pub type_: Type,

  /// A related address for reflexive or relayed candidates.
  pub rel_addr: Option<String>,

  /// A related port for reflexive or relayed candidates.
  pub rel_port: Option<u16>,

  /// An index of the network this candidate was gathered on.
  pub network: Option<u8>,
}

fn parse_attr<T: FromStr>(elem: &Element, name: &'static str, err: &'static str) -> Result<T, Error> {
  elem
    .attr(name)
    .ok_or(Error::ParseError(err))?
    .parse()
    .map_err(|_| Error::ParseError(err))
}

impl TryFrom<Element> for Candidate {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Candidate, Error> {
    if !elem.is("candidate", JINGLE_ICE_UDP) {
      return Err(Error::ParseError("This is not an ICE-UDP candidate element."));
    }
    Ok(Candidate {
      component: parse_attr(&elem, "component", "Invalid candidate component.")?,
      foundation: elem
        .attr("foundation")
        .ok_or(Error::ParseError("Candidate element has no foundation."))?
        .to_owned(),
      generation: match elem.attr("generation") {
        Some(generation) => generation
          .parse()
          .map_err(|_| Error::ParseError("Invalid candidate generation."))?,
        None => 0,
      },
      id: elem.attr("id").map(str::to_owned),
      ip: elem
        .attr("ip")
        .ok_or(Error::ParseError("Candidate element has no ip."))?
        .to_owned(),
      port: parse_attr(&elem, "port", "Invalid candidate port.")?,
      priority: parse_attr(&elem, "priority", "Invalid candidate priority.")?,
      protocol: elem
        .attr("protocol")
        .ok_or(Error::ParseError("Candidate element has no protocol."))?
        .to_lowercase(),
      type_: parse_attr(&elem, "type", "Invalid candidate type.")?,
      rel_addr: elem.attr("rel-addr").map(str::to_owned),
      rel_port: match elem.attr("rel-port") {
        Some(port) => Some(
          port
            .parse()
            .map_err(|_| Error::ParseError("Invalid candidate rel-port."))?,
        ),
        None => None,
      },
      network: match elem.attr("network") {
        Some(network) => Some(
          network
            .parse()
            .map_err(|_| Error::ParseError("Invalid candidate network."))?,
        ),
        None => None,
      },
    })
  }
}

impl From<Candidate> for Element {
  fn from(candidate: Candidate) -> Element {
    Element::builder("candidate", JINGLE_ICE_UDP)
      .attr("component", candidate.component.to_string())
      .attr("foundation", candidate.foundation)
      .attr("generation", candidate.generation.to_string())
      .attr("id", candidate.id)
      .attr("ip", candidate.ip)
      .attr("port", candidate.port.to_string())
      .attr("priority", candidate.priority.to_string())
      .attr("protocol", candidate.protocol)
      .attr("type", candidate.type_.as_str())
      .attr("rel-addr", candidate.rel_addr)
      .attr("rel-port", candidate.rel_port.map(|port| port.to_string()))
      .attr("network", candidate.network.map(|network| network.to_string()))
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_candidate() {
    let elem: Element = "<candidate xmlns='urn:xmpp:jingle:transports:ice-udp:1' component='1' foundation='842163049' generation='0' id='3bf6cbd0' ip='192.0.2.10' port='41925' priority='1677729535' protocol='udp' type='srflx' rel-addr='0.0.0.0' rel-port='41925'/>"
      .parse()
      .unwrap();
    let candidate = Candidate::try_from(elem).unwrap();
    assert_eq!(candidate.component, 1);
    assert_eq!(candidate.type_, Type::Srflx);
    assert_eq!(candidate.rel_addr.as_deref(), Some("0.0.0.0"));
    assert_eq!(candidate.rel_port, Some(41925));
  }

  #[test]
  fn parse_mdns_candidate() {
    let elem: Element = "<candidate xmlns='urn:xmpp:jingle:transports:ice-udp:1' component='1' foundation='1' ip='52ccebc5-98e9-4a46-a8eb-3fbd0e2e2f47.local' port='9' priority='2130706431' protocol='udp' type='host'/>"
      .parse()
      .unwrap();
    let candidate = Candidate::try_from(elem).unwrap();
    assert!(candidate.ip.ends_with(".local"));
    assert_eq!(candidate.generation, 0);
    assert_eq!(candidate.id, None);
  }

  #[test]
  fn transport_round_trip_keeps_child_order() {
    let transport = Transport {
      ufrag: Some("ufrag".to_owned()),
      pwd: Some("pwd".to_owned()),
      candidates: vec![Candidate {
        component: 1,
        foundation: "1".to_owned(),
        generation: 0,
        id: None,
        ip: "198.51.100.7".to_owned(),
        port: 10000,
        priority: 2130706431,
        protocol: "udp".to_owned(),
        type_: Type::Host,
        rel_addr: None,
        rel_port: None,
        network: None,
      }],
      fingerprint: Some(Fingerprint {
        hash: "sha-256".to_owned(),
        setup: Some("actpass".to_owned()),
        value: "AA:BB".to_owned(),
      }),
      trickle: true,
      renomination: true,
    };
    let elem = Element::from(transport.clone());
    let names: Vec<_> = elem.children().map(|child| child.name().to_owned()).collect();
    assert_eq!(names, ["candidate", "fingerprint", "trickle", "renomination"]);
    assert_eq!(Transport::try_from(elem).unwrap(), transport);
  }
}
