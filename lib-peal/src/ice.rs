use peal_xmpp_parsers::jingle_ice_udp::{Candidate, Type};
use serde::{Deserialize, Serialize};

/// An ICE candidate as exchanged with the media engine: the raw SDP
/// attribute line plus the media section it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
  /// The candidate line, "candidate:..." form without the "a=" prefix.
  pub candidate: String,

  /// The mid of the media section, matching the Jingle content name.
  pub sdp_mid: String,

  /// Index of the media section within the SDP.
  pub sdp_mline_index: u32,
}

/// Per-session candidate counters bucketed by type, kept for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateCounts {
  pub host: u64,
  pub srflx: u64,
  pub relay: u64,
  pub other: u64,
}

impl CandidateCounts {
  fn record(&mut self, type_: Type) {
    match type_ {
      Type::Host => self.host += 1,
      Type::Srflx => self.srflx += 1,
      Type::Relay => self.relay += 1,
      Type::Prflx => self.other += 1,
    }
  }

  pub fn total(&self) -> u64 {
    self.host + self.srflx + self.relay + self.other
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IceStats {
  pub sent: CandidateCounts,
  pub received: CandidateCounts,
}

impl IceStats {
  pub(crate) fn record_sent(&mut self, type_: Type) {
    self.sent.record(type_);
  }

  pub(crate) fn record_received(&mut self, type_: Type) {
    self.received.record(type_);
  }
}

/// Parse a candidate attribute line into a Jingle candidate element.
///
/// Accepts both "a=candidate:..." and "candidate:..." forms. Returns None
/// for lines that are malformed or carry an unknown candidate type; ICE is
/// best-effort and a skipped candidate only narrows the pair search.
pub(crate) fn candidate_from_line(line: &str) -> Option<Candidate> {
  let line = line.strip_prefix("a=").unwrap_or(line);
  let line = line.strip_prefix("candidate:")?;
  let parts: Vec<&str> = line.split_whitespace().collect();
  if parts.len() < 8 || parts[6] != "typ" {
    return None;
  }
  let mut candidate = Candidate {
    component: parts[1].parse().ok()?,
    foundation: parts[0].to_owned(),
    generation: 0,
    id: None,
    ip: parts[4].to_owned(),
    port: parts[5].parse().ok()?,
    priority: parts[3].parse().ok()?,
    protocol: parts[2].to_lowercase(),
    type_: parts[7].parse().ok()?,
    rel_addr: None,
    rel_port: None,
    network: None,
  };
  let mut rest = parts[8..].chunks_exact(2);
  for pair in &mut rest {
    match pair[0] {
      "raddr" => candidate.rel_addr = Some(pair[1].to_owned()),
      "rport" => candidate.rel_port = pair[1].parse().ok(),
      "generation" => candidate.generation = pair[1].parse().unwrap_or(0),
      _ => {},
    }
  }
  Some(candidate)
}

/// Render a Jingle candidate as an SDP candidate attribute line
/// ("candidate:..." form, uppercase protocol as WebRTC stacks emit it).
pub(crate) fn candidate_to_line(candidate: &Candidate) -> String {
  let mut line = format!(
    "candidate:{} {} {} {} {} {} typ {}",
    candidate.foundation,
    candidate.component,
    candidate.protocol.to_uppercase(),
    candidate.priority,
    candidate.ip,
    candidate.port,
    candidate.type_.as_str(),
  );
  if let (Some(rel_addr), Some(rel_port)) = (&candidate.rel_addr, candidate.rel_port) {
    line.push_str(&format!(" raddr {} rport {}", rel_addr, rel_port));
  }
  line
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_host_candidate() {
    let candidate =
      candidate_from_line("candidate:842163049 1 udp 2130706431 192.0.2.10 54321 typ host").unwrap();
    assert_eq!(candidate.foundation, "842163049");
    assert_eq!(candidate.component, 1);
    assert_eq!(candidate.protocol, "udp");
    assert_eq!(candidate.priority, 2130706431);
    assert_eq!(candidate.ip, "192.0.2.10");
    assert_eq!(candidate.port, 54321);
    assert_eq!(candidate.type_, Type::Host);
    assert_eq!(candidate.rel_addr, None);
  }

  #[test]
  fn parse_srflx_with_related() {
    let candidate = candidate_from_line(
      "a=candidate:1 1 UDP 1677729535 203.0.113.5 41925 typ srflx raddr 10.0.0.2 rport 41925 generation 0",
    )
    .unwrap();
    assert_eq!(candidate.type_, Type::Srflx);
    assert_eq!(candidate.protocol, "udp");
    assert_eq!(candidate.rel_addr.as_deref(), Some("10.0.0.2"));
    assert_eq!(candidate.rel_port, Some(41925));
  }

  #[test]
  fn malformed_lines_are_skipped() {
    assert_eq!(candidate_from_line("candidate:1 1 udp"), None);
    assert_eq!(candidate_from_line("a=mid:0"), None);
    assert_eq!(
      candidate_from_line("candidate:1 1 udp 1 192.0.2.1 1 typ banana"),
      None
    );
  }

  #[test]
  fn line_round_trip() {
    let line = "candidate:1 1 UDP 1677729535 203.0.113.5 41925 typ srflx raddr 10.0.0.2 rport 41925";
    let candidate = candidate_from_line(line).unwrap();
    assert_eq!(candidate_to_line(&candidate), line);
  }

  #[test]
  fn stats_buckets() {
    let mut stats = IceStats::default();
    stats.record_sent(Type::Host);
    stats.record_sent(Type::Host);
    stats.record_sent(Type::Relay);
    stats.record_received(Type::Srflx);
    stats.record_received(Type::Prflx);
    assert_eq!(stats.sent.host, 2);
    assert_eq!(stats.sent.relay, 1);
    assert_eq!(stats.sent.total(), 3);
    assert_eq!(stats.received.srflx, 1);
    assert_eq!(stats.received.other, 1);
  }
}
