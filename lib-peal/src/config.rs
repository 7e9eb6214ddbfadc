use serde::Serialize;
use xmpp_parsers::Jid;

/// Host-facing call configuration, applied to every session the manager
/// creates on the media engine.
#[derive(Debug, Clone, Default)]
pub struct CallConfig {
  /// Microphone device name; empty string selects the system default.
  pub microphone_device: String,

  /// Speakers device name; empty string selects the system default.
  pub speakers_device: String,

  /// Optional proxy the media engine should route through.
  pub proxy: Option<ProxyConfig>,

  /// Optional TURN server with credentials (e.g. from XEP-0215 discovery,
  /// done by the host).
  pub turn: Option<TurnConfig>,

  /// Audio processing knobs forwarded to the engine.
  pub audio_processing: AudioProcessing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
  Socks5,
  Http,
}

impl ProxyType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ProxyType::Socks5 => "SOCKS5",
      ProxyType::Http => "HTTP",
    }
  }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
  pub type_: ProxyType,
  pub host: String,
  pub port: u16,
  pub username: String,
  pub password: String,
}

#[derive(Debug, Clone)]
pub struct TurnConfig {
  /// TURN server URL, e.g. "turn:turn.example.org:3478".
  pub server: String,
  pub username: String,
  pub credential: String,
}

/// Echo/noise/gain processing levels, matching the engine's scale.
#[derive(Debug, Clone)]
pub struct AudioProcessing {
  pub echo_cancel: bool,
  /// 0 = low, 1 = moderate, 2 = high.
  pub echo_suppression_level: u8,
  pub noise_suppression: bool,
  /// 0 = low, 1 = moderate, 2 = high, 3 = very high.
  pub noise_suppression_level: u8,
  pub gain_control: bool,
}

impl Default for AudioProcessing {
  fn default() -> AudioProcessing {
    AudioProcessing {
      echo_cancel: true,
      echo_suppression_level: 1,
      noise_suppression: true,
      noise_suppression_level: 1,
      gain_control: true,
    }
  }
}

/// Per-session options sent to the media engine on create-session. Empty
/// strings mean "unset", mirroring the engine's wire contract.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
  pub peer: String,
  pub microphone_device: String,
  pub speakers_device: String,
  pub proxy_type: String,
  pub proxy_host: String,
  pub proxy_port: u16,
  pub proxy_username: String,
  pub proxy_password: String,
  pub turn_server: String,
  pub turn_username: String,
  pub turn_password: String,
  /// Always true: host candidates would leak addresses to the peer.
  pub relay_only: bool,
  pub echo_cancel: bool,
  pub echo_suppression_level: u8,
  pub noise_suppression: bool,
  pub noise_suppression_level: u8,
  pub gain_control: bool,
}

impl CallConfig {
  pub(crate) fn session_config(&self, peer: &Jid) -> SessionConfig {
    let audio = &self.audio_processing;
    SessionConfig {
      peer: peer.to_string(),
      microphone_device: self.microphone_device.clone(),
      speakers_device: self.speakers_device.clone(),
      proxy_type: self
        .proxy
        .as_ref()
        .map(|proxy| proxy.type_.as_str().to_owned())
        .unwrap_or_default(),
      proxy_host: self
        .proxy
        .as_ref()
        .map(|proxy| proxy.host.clone())
        .unwrap_or_default(),
      proxy_port: self.proxy.as_ref().map(|proxy| proxy.port).unwrap_or_default(),
      proxy_username: self
        .proxy
        .as_ref()
        .map(|proxy| proxy.username.clone())
        .unwrap_or_default(),
      proxy_password: self
        .proxy
        .as_ref()
        .map(|proxy| proxy.password.clone())
        .unwrap_or_default(),
      turn_server: self
        .turn
        .as_ref()
        .map(|turn| turn.server.clone())
        .unwrap_or_default(),
      turn_username: self
        .turn
        .as_ref()
        .map(|turn| turn.username.clone())
        .unwrap_or_default(),
      turn_password: self
        .turn
        .as_ref()
        .map(|turn| turn.credential.clone())
        .unwrap_or_default(),
      relay_only: true,
      echo_cancel: audio.echo_cancel,
      echo_suppression_level: audio.echo_suppression_level,
      noise_suppression: audio.noise_suppression,
      noise_suppression_level: audio.noise_suppression_level,
      gain_control: audio.gain_control,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn relay_only_is_forced() {
    let config = CallConfig::default();
    let peer: Jid = "bob@example.org/phone".parse().unwrap();
    let session = config.session_config(&peer);
    assert!(session.relay_only);
    assert_eq!(session.peer, "bob@example.org/phone");
    assert_eq!(session.proxy_type, "");
    assert_eq!(session.turn_server, "");
  }

  #[test]
  fn proxy_and_turn_flatten() {
    let config = CallConfig {
      proxy: Some(ProxyConfig {
        type_: ProxyType::Socks5,
        host: "127.0.0.1".to_owned(),
        port: 9050,
        username: String::new(),
        password: String::new(),
      }),
      turn: Some(TurnConfig {
        server: "turn:turn.example.org:3478".to_owned(),
        username: "u".to_owned(),
        credential: "c".to_owned(),
      }),
      ..Default::default()
    };
    let peer: Jid = "bob@example.org".parse().unwrap();
    let session = config.session_config(&peer);
    assert_eq!(session.proxy_type, "SOCKS5");
    assert_eq!(session.proxy_port, 9050);
    assert_eq!(session.turn_server, "turn:turn.example.org:3478");
    assert_eq!(session.turn_password, "c");
  }
}
