/// Outbound side of the transport boundary
use tokio::sync::mpsc;

use crate::{CollabError, OutboundMessage, Result};

/// Channel a session transmits through. Sends must not block; delivery is
/// fire-and-forget from the session's point of view.
pub trait Transport: Send {
    fn send(&self, message: OutboundMessage) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// In-process transport backed by an unbounded channel. The receiving half
/// is drained by whatever owns the real network connection.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: OutboundMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|e| CollabError::Transport(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}
