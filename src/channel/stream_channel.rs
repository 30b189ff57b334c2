use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::channel::{with_timeout, Channel, TextChannel, SYNC_BYTE};
use crate::error::TransportError;

/// A channel on top of a byte stream, typically a TCP connection.
pub struct StreamChannel<R, W> {
    reader: BufReader<R>,
    writer: W,
    peer_addr: SocketAddr,
    chunk_size: usize,
    /// Holds a partially read line across read timeouts. `read_until` appends to it, so reading
    ///  can continue where it stopped.
    line_buf: Vec<u8>,
    is_open: bool,
}

impl StreamChannel<OwnedReadHalf, OwnedWriteHalf> {
    pub fn from_tcp(stream: TcpStream, chunk_size: usize) -> anyhow::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(StreamChannel::new(reader, writer, peer_addr, chunk_size))
    }
}

impl<R, W> StreamChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, peer_addr: SocketAddr, chunk_size: usize) -> StreamChannel<R, W> {
        StreamChannel {
            reader: BufReader::new(reader),
            writer,
            peer_addr,
            chunk_size,
            line_buf: Vec::new(),
            is_open: true,
        }
    }

    fn on_io_error(&mut self, e: io::Error) -> anyhow::Error {
        self.is_open = false;
        match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                debug!("stream to {:?} closed: {}", self.peer_addr, e);
                TransportError::Closed.into()
            }
            _ => e.into(),
        }
    }

    async fn write_bytes(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        let result = async {
            self.writer.write_all(buf).await?;
            self.writer.flush().await
        }.await;
        result.map_err(|e| self.on_io_error(e))
    }
}

#[async_trait]
impl<R, W> TextChannel for StreamChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_unit(&mut self, timeout: Duration) -> anyhow::Result<String> {
        let read = with_timeout(timeout, async {
            Ok(self.reader.read_until(b'\n', &mut self.line_buf).await)
        }).await?;

        let num_read = read.map_err(|e| self.on_io_error(e))?;
        if num_read == 0 && self.line_buf.is_empty() {
            self.is_open = false;
            return Err(TransportError::Closed.into());
        }

        let line = String::from_utf8_lossy(&self.line_buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.line_buf.clear();

        trace!("received line from {:?}: {:?}", self.peer_addr, line);
        Ok(line)
    }

    async fn write_text(&mut self, text: &str) -> anyhow::Result<()> {
        trace!("sending line to {:?}: {:?}", self.peer_addr, text);
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.write_bytes(line.as_bytes()).await
    }

    fn check_channel(&self) -> bool {
        self.is_open
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("error shutting down stream to {:?}: {}", self.peer_addr, e);
        }
        self.is_open = false;
    }
}

#[async_trait]
impl<R, W> Channel for StreamChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn max_chunk_len(&self) -> usize {
        self.chunk_size
    }

    async fn write_sync(&mut self) -> anyhow::Result<()> {
        self.write_bytes(&[SYNC_BYTE]).await
    }

    async fn read_sync(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let read = with_timeout(timeout, async { Ok(self.reader.read_u8().await) }).await?;
        read.map_err(|e| self.on_io_error(e))?;
        Ok(())
    }

    async fn write_u64(&mut self, value: u64) -> anyhow::Result<()> {
        self.write_bytes(&value.to_be_bytes()).await
    }

    async fn read_u64(&mut self, timeout: Duration) -> anyhow::Result<u64> {
        let read = with_timeout(timeout, async { Ok(self.reader.read_u64().await) }).await?;
        read.map_err(|e| self.on_io_error(e))
    }

    async fn send_chunk(&mut self, chunk: &[u8], timeout: Duration) -> anyhow::Result<()> {
        with_timeout(timeout, self.write_bytes(chunk)).await
    }

    async fn recv_chunk(&mut self, max_len: usize, timeout: Duration) -> anyhow::Result<Bytes> {
        let mut buf = vec![0u8; max_len.min(self.chunk_size).max(1)];
        let read = with_timeout(timeout, async { Ok(self.reader.read(&mut buf).await) }).await?;

        let num_read = read.map_err(|e| self.on_io_error(e))?;
        if num_read == 0 {
            self.is_open = false;
            return Err(TransportError::Closed.into());
        }
        buf.truncate(num_read);
        Ok(Bytes::from(buf))
    }
}
