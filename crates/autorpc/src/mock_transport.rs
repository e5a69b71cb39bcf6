//! In-memory transports for the test suite. Not part of the public API.

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::transport;
use crate::transport::Transport;

/// A transport backed by unbounded in-memory channels.
///
/// [`endpoint`](Self::endpoint) hands back the raw channel ends so a
/// test can script the peer byte-for-byte; [`pair`](Self::pair) wires
/// two transports back to back when both sides run real dispatch loops.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// One transport plus the peer-side ends that drive it: what the
    /// peer sends arrives on `recv`, what `send` writes arrives at the
    /// peer's receiver.
    pub fn endpoint() -> (
        Self,
        mpsc::UnboundedSender<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (peer_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, peer_rx) = mpsc::unbounded_channel();

        let transport = Self {
            outbound,
            inbound: Mutex::new(inbound),
        };
        (transport, peer_tx, peer_rx)
    }

    /// Two transports wired back to back.
    pub fn pair() -> (Self, Self) {
        let (left, right_tx, right_rx) = Self::endpoint();
        let right = Self {
            outbound: right_tx,
            inbound: Mutex::new(right_rx),
        };
        (left, right)
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if self.outbound.send(payload.to_vec()).is_err() {
            return Err(transport::Error::ConnectionLost(
                "peer receiver dropped".into(),
            ));
        }
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        // A closed channel is EOF, not an error.
        Ok(self.inbound.lock().await.recv().await)
    }
}
