use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, TextChannel, SYNC_BYTE};
use crate::error::TransportError;
use crate::reliable_udp::ReliableUdpSocket;

/// A channel to a single peer on top of a [ReliableUdpSocket]. Every text unit and every
///  binary item is a message of its own. Messages from other addresses are ignored.
pub struct UdpChannel {
    socket: Arc<ReliableUdpSocket>,
    peer_addr: SocketAddr,
    send_timeout: Duration,
}

impl UdpChannel {
    /// The socket must be started. `send_timeout` bounds the wait for a free window credit
    ///  when sending text and numbers; chunk sends have their own timeout.
    pub fn new(socket: Arc<ReliableUdpSocket>, peer_addr: SocketAddr, send_timeout: Duration) -> UdpChannel {
        UdpChannel {
            socket,
            peer_addr,
            send_timeout,
        }
    }

    async fn receive_from_peer(&self, timeout: Duration) -> anyhow::Result<Bytes> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout.into());
            }

            let msg = self.socket.receive(Some(remaining)).await?;
            if msg.from == self.peer_addr {
                return Ok(msg.payload);
            }
            warn!("ignoring message from {:?}: session peer is {:?}", msg.from, self.peer_addr);
        }
    }

    async fn send(&self, payload: &[u8], timeout: Duration) -> anyhow::Result<()> {
        self.socket.send(payload, self.peer_addr, Some(timeout)).await
    }
}

#[async_trait]
impl TextChannel for UdpChannel {
    async fn read_unit(&mut self, timeout: Duration) -> anyhow::Result<String> {
        let payload = self.receive_from_peer(timeout).await?;
        let text = String::from_utf8_lossy(&payload).into_owned();
        trace!("received text from {:?}: {:?}", self.peer_addr, text);
        Ok(text)
    }

    async fn write_text(&mut self, text: &str) -> anyhow::Result<()> {
        trace!("sending text to {:?}: {:?}", self.peer_addr, text);
        self.send(text.as_bytes(), self.send_timeout).await
    }

    fn check_channel(&self) -> bool {
        self.socket.is_running()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Waits (bounded by the send timeout) for everything sent so far to be acknowledged, and
    ///  stops the socket.
    async fn close(&mut self) {
        if let Err(e) = self.socket.flush(self.send_timeout).await {
            debug!("closing channel to {:?} with unacknowledged messages: {}", self.peer_addr, e);
        }
        self.socket.stop().await;
    }
}

#[async_trait]
impl Channel for UdpChannel {
    fn max_chunk_len(&self) -> usize {
        self.socket.max_payload_len()
    }

    async fn write_sync(&mut self) -> anyhow::Result<()> {
        self.send(&[SYNC_BYTE], self.send_timeout).await
    }

    async fn read_sync(&mut self, timeout: Duration) -> anyhow::Result<()> {
        self.receive_from_peer(timeout).await?;
        Ok(())
    }

    async fn write_u64(&mut self, value: u64) -> anyhow::Result<()> {
        self.send(&value.to_be_bytes(), self.send_timeout).await
    }

    async fn read_u64(&mut self, timeout: Duration) -> anyhow::Result<u64> {
        let payload = self.receive_from_peer(timeout).await?;
        let raw: [u8; 8] = payload.as_ref().try_into()
            .map_err(|_| TransportError::Malformed(format!("expected an 8 byte number, got {} bytes", payload.len())))?;
        Ok(u64::from_be_bytes(raw))
    }

    async fn send_chunk(&mut self, chunk: &[u8], timeout: Duration) -> anyhow::Result<()> {
        self.send(chunk, timeout).await
    }

    /// a chunk is always a single message, `max_len` is not checked
    async fn recv_chunk(&mut self, _max_len: usize, timeout: Duration) -> anyhow::Result<Bytes> {
        let payload = self.receive_from_peer(timeout).await?;
        if payload.is_empty() {
            return Err(TransportError::Malformed("empty chunk".to_string()).into());
        }
        Ok(payload)
    }
}
