use std::convert::TryFrom;

use xmpp_parsers::{Element, Error};

use crate::{
  jingle::ReasonElement,
  ns::{JINGLE, JINGLE_MESSAGE, JINGLE_RTP},
};

/// Media advertised by a propose element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposeDescription {
  /// Media type of the proposed stream ("audio", "video").
  pub media: String,
}

impl From<ProposeDescription> for Element {
  fn from(description: ProposeDescription) -> Element {
    Element::builder("description", JINGLE_RTP)
      .attr("media", description.media)
      .build()
  }
}

/// The announcement messages broadcast to all of a user's devices before and
/// after the IQ-based Jingle negotiation (XEP-0353).
#[derive(Debug, Clone, PartialEq)]
pub enum CallMessage {
  /// Indicates we want to start a call.
  Propose {
    sid: String,
    descriptions: Vec<ProposeDescription>,
  },

  /// Cancels a previously proposed call.
  Retract { sid: String },

  /// Obsolete pre-acceptance notification. Parsed for compatibility but
  /// never emitted; peers treat an early accept as "connected".
  Accept { sid: String },

  /// Asks the proposing party to go ahead with session-initiate.
  Proceed { sid: String },

  /// Declines a proposed call.
  Reject { sid: String },

  /// Announces the end of a finished call, with the terminate reason.
  Finish {
    sid: String,
    reason: Option<ReasonElement>,
  },
}

impl CallMessage {
  /// Propose a call carrying the given media types.
  pub fn propose(sid: String, media: &[&str]) -> CallMessage {
    CallMessage::Propose {
      sid,
      descriptions: media
        .iter()
        .map(|media| ProposeDescription {
          media: (*media).to_owned(),
        })
        .collect(),
    }
  }

  /// The session identifier this message refers to.
  pub fn sid(&self) -> &str {
    match self {
      CallMessage::Propose { sid, .. }
      | CallMessage::Retract { sid }
      | CallMessage::Accept { sid }
      | CallMessage::Proceed { sid }
      | CallMessage::Reject { sid }
      | CallMessage::Finish { sid, .. } => sid,
    }
  }
}

fn get_sid(elem: &Element) -> Result<String, Error> {
  Ok(
    elem
      .attr("id")
      .ok_or(Error::ParseError("Jingle message has no id."))?
      .to_owned(),
  )
}

impl TryFrom<Element> for CallMessage {
  type Error = Error;

  fn try_from(elem: Element) -> Result<CallMessage, Error> {
    if !elem.has_ns(JINGLE_MESSAGE) {
      return Err(Error::ParseError("This is not a Jingle message element."));
    }
    Ok(match elem.name() {
      "propose" => {
        let mut descriptions = Vec::new();
        for child in elem.children() {
          if child.name() == "description" {
            if let Some(media) = child.attr("media") {
              descriptions.push(ProposeDescription {
                media: media.to_owned(),
              });
            }
          }
        }
        CallMessage::Propose {
          sid: get_sid(&elem)?,
          descriptions,
        }
      },
      "retract" => CallMessage::Retract { sid: get_sid(&elem)? },
      "accept" => CallMessage::Accept { sid: get_sid(&elem)? },
      "proceed" => CallMessage::Proceed { sid: get_sid(&elem)? },
      "reject" => CallMessage::Reject { sid: get_sid(&elem)? },
      "finish" => {
        let reason = elem
          .children()
          .find(|child| child.is("reason", JINGLE))
          .map(|child| ReasonElement::try_from(child.clone()))
          .transpose()?;
        CallMessage::Finish {
          sid: get_sid(&elem)?,
          reason,
        }
      },
      _ => return Err(Error::ParseError("This is not a Jingle message element.")),
    })
  }
}

impl From<CallMessage> for Element {
  fn from(message: CallMessage) -> Element {
    match message {
      CallMessage::Propose { sid, descriptions } => {
        let mut builder = Element::builder("propose", JINGLE_MESSAGE).attr("id", sid);
        for description in descriptions {
          builder = builder.append(Element::from(description));
        }
        builder.build()
      },
      CallMessage::Retract { sid } => Element::builder("retract", JINGLE_MESSAGE)
        .attr("id", sid)
        .build(),
      CallMessage::Accept { sid } => Element::builder("accept", JINGLE_MESSAGE)
        .attr("id", sid)
        .build(),
      CallMessage::Proceed { sid } => Element::builder("proceed", JINGLE_MESSAGE)
        .attr("id", sid)
        .build(),
      CallMessage::Reject { sid } => Element::builder("reject", JINGLE_MESSAGE)
        .attr("id", sid)
        .build(),
      CallMessage::Finish { sid, reason } => {
        let mut builder = Element::builder("finish", JINGLE_MESSAGE).attr("id", sid);
        if let Some(reason) = reason {
          builder = builder.append(Element::from(reason));
        }
        builder.build()
      },
    }
  }
}
