use std::{convert::TryFrom, fmt, str::FromStr};

use xmpp_parsers::{iq::IqSetPayload, Element, Error, Jid};

use crate::{
  jingle_ice_udp::Transport as IceUdpTransport,
  jingle_rtp::Description as RtpDescription,
  ns::{JINGLE, JINGLE_GROUPING, JINGLE_ICE_UDP, JINGLE_RTP},
};

/// The session actions exchanged during call negotiation. Anything else on
/// the wire is answered with an IQ error by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  /// Definitively accept a session negotiation.
  SessionAccept,

  /// Request negotiation of a new Jingle session.
  SessionInitiate,

  /// End an existing session.
  SessionTerminate,

  /// Exchange transport candidates.
  TransportInfo,
}

impl Action {
  pub fn as_str(&self) -> &'static str {
    match self {
      Action::SessionAccept => "session-accept",
      Action::SessionInitiate => "session-initiate",
      Action::SessionTerminate => "session-terminate",
      Action::TransportInfo => "transport-info",
    }
  }
}

impl FromStr for Action {
  type Err = Error;

  fn from_str(s: &str) -> Result<Action, Error> {
    Ok(match s {
      "session-accept" => Action::SessionAccept,
      "session-initiate" => Action::SessionInitiate,
      "session-terminate" => Action::SessionTerminate,
      "transport-info" => Action::TransportInfo,
      _ => return Err(Error::ParseError("Unknown jingle action.")),
    })
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Which party originally generated a content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Creator {
  Initiator,
  Responder,
}

impl Creator {
  pub fn as_str(&self) -> &'static str {
    match self {
      Creator::Initiator => "initiator",
      Creator::Responder => "responder",
    }
  }
}

impl FromStr for Creator {
  type Err = Error;

  fn from_str(s: &str) -> Result<Creator, Error> {
    Ok(match s {
      "initiator" => Creator::Initiator,
      "responder" => Creator::Responder,
      _ => return Err(Error::ParseError("Unknown content creator.")),
    })
  }
}

/// Which parties are allowed to send data for a content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Senders {
  #[default]
  Both,
  Initiator,
  Responder,
  None,
}

impl Senders {
  pub fn as_str(&self) -> &'static str {
    match self {
      Senders::Both => "both",
      Senders::Initiator => "initiator",
      Senders::Responder => "responder",
      Senders::None => "none",
    }
  }
}

impl FromStr for Senders {
  type Err = Error;

  fn from_str(s: &str) -> Result<Senders, Error> {
    Ok(match s {
      "both" => Senders::Both,
      "initiator" => Senders::Initiator,
      "responder" => Senders::Responder,
      "none" => Senders::None,
      _ => return Err(Error::ParseError("Unknown content senders.")),
    })
  }
}

/// The main Jingle container, to be included in an iq stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Jingle {
  /// The action to execute on both ends.
  pub action: Action,

  /// Who the initiator is.
  pub initiator: Option<Jid>,

  /// Who the responder is.
  pub responder: Option<Jid>,

  /// Unique session identifier between two entities.
  pub sid: String,

  /// A list of contents to be negotiated in this session.
  pub contents: Vec<Content>,

  /// An optional reason.
  pub reason: Option<ReasonElement>,

  /// An optional BUNDLE grouping.
  pub group: Option<Group>,
}

impl IqSetPayload for Jingle {}

impl Jingle {
  /// Create a new Jingle element.
  pub fn new(action: Action, sid: String) -> Jingle {
    Jingle {
      action,
      sid,
      initiator: None,
      responder: None,
      contents: Vec::new(),
      reason: None,
      group: None,
    }
  }

  /// Set the initiator's JID.
  pub fn with_initiator(mut self, initiator: Jid) -> Jingle {
    self.initiator = Some(initiator);
    self
  }

  /// Set the responder's JID.
  pub fn with_responder(mut self, responder: Jid) -> Jingle {
    self.responder = Some(responder);
    self
  }

  /// Add a content to this Jingle container.
  pub fn add_content(mut self, content: Content) -> Jingle {
    self.contents.push(content);
    self
  }

  /// Set the reason in this Jingle container.
  pub fn set_reason(mut self, reason: ReasonElement) -> Jingle {
    self.reason = Some(reason);
    self
  }

  /// Set the grouping in this Jingle container.
  pub fn set_group(mut self, group: Group) -> Jingle {
    self.group = Some(group);
    self
  }
}

impl TryFrom<Element> for Jingle {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Jingle, Error> {
    if !elem.is("jingle", JINGLE) {
      return Err(Error::ParseError("This is not a Jingle element."));
    }
    let mut jingle = Jingle {
      action: elem
        .attr("action")
        .ok_or(Error::ParseError("Jingle element has no action."))?
        .parse()?,
      initiator: parse_jid(&elem, "initiator")?,
      responder: parse_jid(&elem, "responder")?,
      sid: elem
        .attr("sid")
        .ok_or(Error::ParseError("Jingle element has no sid."))?
        .to_owned(),
      contents: Vec::new(),
      reason: None,
      group: None,
    };
    for child in elem.children() {
      if child.is("content", JINGLE) {
        jingle.contents.push(Content::try_from(child.clone())?);
      }
      else if child.is("reason", JINGLE) {
        if jingle.reason.is_some() {
          return Err(Error::ParseError("Jingle must not have more than one reason."));
        }
        jingle.reason = Some(ReasonElement::try_from(child.clone())?);
      }
      else if child.is("group", JINGLE_GROUPING) {
        if jingle.group.is_some() {
          return Err(Error::ParseError("Jingle must not have more than one grouping."));
        }
        jingle.group = Some(Group::try_from(child.clone())?);
      }
    }
    Ok(jingle)
  }
}

impl From<Jingle> for Element {
  fn from(jingle: Jingle) -> Element {
    let mut builder = Element::builder("jingle", JINGLE)
      .attr("action", jingle.action.as_str())
      .attr("initiator", jingle.initiator.map(|jid| jid.to_string()))
      .attr("responder", jingle.responder.map(|jid| jid.to_string()))
      .attr("sid", jingle.sid);
    for content in jingle.contents {
      builder = builder.append(Element::from(content));
    }
    if let Some(reason) = jingle.reason {
      builder = builder.append(Element::from(reason));
    }
    if let Some(group) = jingle.group {
      builder = builder.append(Element::from(group));
    }
    builder.build()
  }
}

fn parse_jid(elem: &Element, name: &'static str) -> Result<Option<Jid>, Error> {
  elem
    .attr(name)
    .map(|jid| {
      jid
        .parse()
        .map_err(|_| Error::ParseError("Invalid JID in jingle attribute."))
    })
    .transpose()
}

/// Describes a session's content; a session can have several, one per media
/// section.
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
  /// Who created this content.
  pub creator: Option<Creator>,

  /// A per-session unique identifier for this content, matching the SDP mid.
  pub name: String,

  /// Who can send data for this content.
  pub senders: Senders,

  /// What to send.
  pub description: Option<RtpDescription>,

  /// How to send it.
  pub transport: Option<IceUdpTransport>,
}

impl Content {
  /// Create a new content.
  pub fn new(creator: Creator, name: String) -> Content {
    Content {
      creator: Some(creator),
      name,
      senders: Senders::Both,
      description: None,
      transport: None,
    }
  }

  /// Specify who can send data for this content.
  pub fn with_senders(mut self, senders: Senders) -> Content {
    self.senders = senders;
    self
  }

  /// Set the description of this content.
  pub fn with_description(mut self, description: RtpDescription) -> Content {
    self.description = Some(description);
    self
  }

  /// Set the transport of this content.
  pub fn with_transport(mut self, transport: IceUdpTransport) -> Content {
    self.transport = Some(transport);
    self
  }
}

impl TryFrom<Element> for Content {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Content, Error> {
    if !elem.is("content", JINGLE) {
      return Err(Error::ParseError("This is not a content element."));
    }
    let mut content = Content {
      creator: elem
        .attr("creator")
        .map(|creator| creator.parse::<Creator>())
        .transpose()?,
      name: elem
        .attr("name")
        .ok_or(Error::ParseError("Content element has no name."))?
        .to_owned(),
      senders: match elem.attr("senders") {
        Some(senders) => senders.parse()?,
        None => Senders::Both,
      },
      description: None,
      transport: None,
    };
    for child in elem.children() {
      if child.is("description", JINGLE_RTP) {
        content.description = Some(RtpDescription::try_from(child.clone())?);
      }
      else if child.is("transport", JINGLE_ICE_UDP) {
        content.transport = Some(IceUdpTransport::try_from(child.clone())?);
      }
    }
    Ok(content)
  }
}

impl From<Content> for Element {
  fn from(content: Content) -> Element {
    let mut builder = Element::builder("content", JINGLE)
      .attr("creator", content.creator.map(|creator| creator.as_str()))
      .attr("name", content.name)
      .attr("senders", content.senders.as_str());
    if let Some(description) = content.description {
      builder = builder.append(Element::from(description));
    }
    if let Some(transport) = content.transport {
      builder = builder.append(Element::from(transport));
    }
    builder.build()
  }
}

/// The reason attached to a session-terminate or finish element.
///
/// The reason is the namespace-stripped name of the first child, kept as a
/// string so nonstandard reasons pass through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonElement {
  /// Machine-readable reason name, e.g. "success" or "decline".
  pub reason: String,

  /// Optional human-readable text.
  pub text: Option<String>,
}

impl ReasonElement {
  /// Create a new reason element.
  pub fn new(reason: &str) -> ReasonElement {
    ReasonElement {
      reason: reason.to_owned(),
      text: None,
    }
  }
}

impl TryFrom<Element> for ReasonElement {
  type Error = Error;

  fn try_from(elem: Element) -> Result<ReasonElement, Error> {
    if !elem.is("reason", JINGLE) {
      return Err(Error::ParseError("This is not a reason element."));
    }
    let mut reason = None;
    let mut text = None;
    for child in elem.children() {
      if child.name() == "text" {
        text = Some(child.text());
      }
      else if reason.is_none() {
        reason = Some(child.name().to_owned());
      }
    }
    Ok(ReasonElement {
      reason: reason.ok_or(Error::ParseError("Reason element has no condition."))?,
      text,
    })
  }
}

impl From<ReasonElement> for Element {
  fn from(reason: ReasonElement) -> Element {
    let mut builder = Element::builder("reason", JINGLE)
      .append(Element::builder(reason.reason.as_str(), JINGLE).build());
    if let Some(text) = reason.text {
      builder = builder.append(Element::builder("text", JINGLE).append(text).build());
    }
    builder.build()
  }
}

/// A grouping of contents sharing a transport (RFC 5888 / XEP-0338).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
  /// The semantics of the grouping, e.g. "BUNDLE".
  pub semantics: String,

  /// Names of the grouped contents.
  pub contents: Vec<String>,
}

impl Group {
  /// Create a BUNDLE group over the given content names.
  pub fn bundle(contents: Vec<String>) -> Group {
    Group {
      semantics: "BUNDLE".to_owned(),
      contents,
    }
  }
}

impl TryFrom<Element> for Group {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Group, Error> {
    if !elem.is("group", JINGLE_GROUPING) {
      return Err(Error::ParseError("This is not a group element."));
    }
    let semantics = elem
      .attr("semantics")
      .ok_or(Error::ParseError("Group element has no semantics."))?
      .to_owned();
    let mut contents = Vec::new();
    for child in elem.children() {
      if child.is("content", JINGLE_GROUPING) {
        contents.push(
          child
            .attr("name")
            .ok_or(Error::ParseError("Group content has no name."))?
            .to_owned(),
        );
      }
    }
    Ok(Group { semantics, contents })
  }
}

impl From<Group> for Element {
  fn from(group: Group) -> Element {
    let mut builder = Element::builder("group", JINGLE_GROUPING).attr("semantics", group.semantics);
    for name in group.contents {
      builder = builder.append(Element::builder("content", JINGLE_GROUPING).attr("name", name).build());
    }
    builder.build()
  }
}
