//! The session and the transfer engine talk to the peer through these traits, which hide the
//!  differences between the two transports:
//!
//! * On a stream (TCP), a text unit is a line terminated by `\n`, and binary data is just a
//!    sequence of bytes in between.
//! * On reliable UDP, every text unit and every binary item (synchronization unit, number,
//!    chunk of file contents) is a message of its own.

pub mod stream_channel;
pub mod udp_channel;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time;

use crate::error::TransportError;
use crate::status::{Status, HEARTBEAT_REQUEST, HEARTBEAT_RESPONSE};

pub use stream_channel::StreamChannel;
pub use udp_channel::UdpChannel;


/// The text part of the protocol: commands, response lines and heartbeats.
#[async_trait]
pub trait TextChannel: Send {
    /// Reads the next text unit. Fails with [TransportError::Timeout] if nothing arrives in time,
    ///  and with [TransportError::Closed] if the peer closed the channel.
    async fn read_unit(&mut self, timeout: Duration) -> anyhow::Result<String>;

    async fn write_text(&mut self, text: &str) -> anyhow::Result<()>;

    /// `false` once the channel is known to be unusable
    fn check_channel(&self) -> bool;

    fn peer_addr(&self) -> SocketAddr;

    async fn close(&mut self);

    async fn write_message(&mut self, status: Status, text: &str) -> anyhow::Result<()> {
        self.write_text(&status.line(text)).await
    }

    async fn write_end_message(&mut self) -> anyhow::Result<()> {
        self.write_text(&Status::end_line()).await
    }

    async fn write_heartbeat_request(&mut self) -> anyhow::Result<()> {
        self.write_text(HEARTBEAT_REQUEST).await
    }

    async fn write_heartbeat_response(&mut self) -> anyhow::Result<()> {
        self.write_text(HEARTBEAT_RESPONSE).await
    }
}

/// Binary primitives for moving file contents, interleaved with text units on the same channel.
///  Numbers are transmitted as 8 bytes in network byte order.
#[async_trait]
pub trait Channel: TextChannel {
    /// the maximum number of bytes a single chunk may carry
    fn max_chunk_len(&self) -> usize;

    /// The synchronization unit is sent by the receiving side of a transfer when it is ready
    ///  for binary data.
    async fn write_sync(&mut self) -> anyhow::Result<()>;

    async fn read_sync(&mut self, timeout: Duration) -> anyhow::Result<()>;

    async fn write_u64(&mut self, value: u64) -> anyhow::Result<()>;

    async fn read_u64(&mut self, timeout: Duration) -> anyhow::Result<u64>;

    async fn send_chunk(&mut self, chunk: &[u8], timeout: Duration) -> anyhow::Result<()>;

    /// Receives the next chunk of binary data, at most `max_len` bytes on stream channels. The
    ///  result is never empty.
    async fn recv_chunk(&mut self, max_len: usize, timeout: Duration) -> anyhow::Result<Bytes>;
}

/// the single byte sent as a synchronization unit
pub const SYNC_BYTE: u8 = 1;

/// runs a future with a timeout, failing with [TransportError::Timeout] if it elapses
pub(crate) async fn with_timeout<T>(timeout: Duration, f: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    match time::timeout(timeout, f).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout.into()),
    }
}
