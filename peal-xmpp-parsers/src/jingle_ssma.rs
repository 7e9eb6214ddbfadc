use std::convert::TryFrom;

use xmpp_parsers::{Element, Error};

use crate::ns::JINGLE_SSMA;

/// Source element for the ssrc SDP attribute (XEP-0294).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
  /// The synchronization source identifier.
  pub id: String,

  /// List of attributes for this source.
  pub parameters: Vec<Parameter>,
}

impl Source {
  /// Create a new SSMA source element.
  pub fn new(id: String) -> Source {
    Source {
      id,
      parameters: Vec::new(),
    }
  }
}

impl TryFrom<Element> for Source {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Source, Error> {
    if !elem.is("source", JINGLE_SSMA) {
      return Err(Error::ParseError("This is not a ssma source element."));
    }
    let id = elem
      .attr("ssrc")
      .ok_or(Error::ParseError("Source element has no ssrc."))?
      .to_owned();
    let mut parameters = Vec::new();
    for child in elem.children() {
      // Matched by name only: some servers stamp parameters with the wrong
      // namespace.
      if child.name() == "parameter" {
        parameters.push(Parameter::try_from(child.clone())?);
      }
    }
    Ok(Source { id, parameters })
  }
}

impl From<Source> for Element {
  fn from(source: Source) -> Element {
    let mut builder = Element::builder("source", JINGLE_SSMA).attr("ssrc", source.id);
    for parameter in source.parameters {
      builder = builder.append(Element::from(parameter));
    }
    builder.build()
  }
}

/// Parameter associated with a ssrc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
  /// The name of the parameter.
  pub name: String,

  /// The optional value of the parameter.
  pub value: Option<String>,
}

impl TryFrom<Element> for Parameter {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Parameter, Error> {
    if elem.name() != "parameter" {
      return Err(Error::ParseError("This is not a ssma parameter element."));
    }
    Ok(Parameter {
      name: elem
        .attr("name")
        .ok_or(Error::ParseError("Parameter element has no name."))?
        .to_owned(),
      value: elem.attr("value").map(str::to_owned),
    })
  }
}

impl From<Parameter> for Element {
  fn from(parameter: Parameter) -> Element {
    Element::builder("parameter", JINGLE_SSMA)
      .attr("name", parameter.name)
      .attr("value", parameter.value)
      .build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_source() {
    let elem: Element = "
      <source xmlns='urn:xmpp:jingle:apps:rtp:ssma:0' ssrc='2485877649'>
        <parameter xmlns='urn:xmpp:jingle:apps:rtp:ssma:0' name='cname' value='peal-audio'/>
        <parameter xmlns='urn:xmpp:jingle:apps:rtp:ssma:0' name='msid' value='stream track'/>
      </source>"
      .trim().parse()
      .unwrap();
    let source = Source::try_from(elem).unwrap();
    assert_eq!(source.id, "2485877649");
    assert_eq!(source.parameters.len(), 2);
    assert_eq!(source.parameters[0].name, "cname");
    assert_eq!(source.parameters[0].value.as_deref(), Some("peal-audio"));
  }

  #[test]
  fn round_trip() {
    let source = Source {
      id: "1234".to_owned(),
      parameters: vec![Parameter {
        name: "cname".to_owned(),
        value: Some("abc".to_owned()),
      }],
    };
    let elem = Element::from(source.clone());
    assert_eq!(Source::try_from(elem).unwrap(), source);
  }
}
