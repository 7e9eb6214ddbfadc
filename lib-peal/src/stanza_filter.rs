use anyhow::Result;
use async_trait::async_trait;
use xmpp_parsers::Element;

/// Inbound stanza dispatch. The host's XMPP connection offers each received
/// element to its registered filters and hands it to the first that claims it.
#[async_trait]
pub trait StanzaFilter {
  fn filter(&self, element: &Element) -> bool;
  async fn take(&self, element: Element) -> Result<()>;
}
