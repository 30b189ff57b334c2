//! The client side of the protocol, for both transports.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use anyhow::{anyhow, bail, Context};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::channel::{Channel, StreamChannel, UdpChannel};
use crate::config::ClientConfig;
use crate::error::{ServerError, TransportError};
use crate::reliable_udp::ReliableUdpSocket;
use crate::status::{Status, ACCEPT_TEXT, CONNECT_TEXT, HEARTBEAT_REQUEST, HEARTBEAT_RESPONSE};


pub struct Client {
    channel: Box<dyn Channel>,
    config: Arc<ClientConfig>,
}

impl Client {
    pub fn new(channel: Box<dyn Channel>, config: Arc<ClientConfig>) -> Client {
        Client { channel, config }
    }

    pub async fn connect_tcp(server_addr: SocketAddr, config: Arc<ClientConfig>) -> anyhow::Result<Client> {
        config.validate()?;
        let stream = TcpStream::connect(server_addr).await
            .with_context(|| format!("connecting to {:?}", server_addr))?;
        info!("connected to {:?} via TCP", server_addr);

        let channel = StreamChannel::from_tcp(stream, config.stream_chunk_size)?;
        Ok(Client::new(Box::new(channel), config))
    }

    /// Performs the UDP connect handshake: the server answers `100 CONNECT` with `200 ACCEPT`
    ///  and the port of a socket dedicated to this client's session.
    pub async fn connect_udp(server_addr: SocketAddr, config: Arc<ClientConfig>) -> anyhow::Result<Client> {
        config.validate()?;
        let local_addr: SocketAddr = if server_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        }
        else {
            ([0u16; 8], 0).into()
        };

        let socket = Arc::new(ReliableUdpSocket::bind(local_addr, Arc::new(config.udp.clone())).await?);
        socket.start().await;

        let timeout = config.response_timeout;
        socket.send_text(&Status::Connect.line(CONNECT_TEXT), server_addr, Some(timeout)).await?;

        let accept = socket.receive(Some(timeout)).await
            .context("waiting for the server to accept the connection")?;
        if accept.text() != Status::accept_line() {
            bail!("unexpected answer to connect request: {:?}", accept.text());
        }
        let port_msg = socket.receive(Some(timeout)).await?;
        let port: u16 = port_msg.text().trim().parse()
            .map_err(|_| TransportError::Malformed(format!("invalid session port {:?}", port_msg.text())))?;

        // the session socket on the server starts with fresh sequence numbers, so we do as well
        socket.flush(timeout).await?;
        socket.start().await;

        let session_addr = SocketAddr::new(server_addr.ip(), port);
        info!("connected to {:?} via UDP, session at {:?}", server_addr, session_addr);

        let channel = UdpChannel::new(socket, session_addr, config.chunk_send_timeout);
        Ok(Client::new(Box::new(channel), config))
    }

    pub fn channel(&mut self) -> &mut dyn Channel {
        self.channel.as_mut()
    }

    /// Reads the next response line, answering heartbeat requests along the way
    async fn read_response_line(&mut self) -> anyhow::Result<String> {
        loop {
            let line = self.channel.read_unit(self.config.response_timeout).await?;
            match line.as_str() {
                HEARTBEAT_REQUEST => self.channel.write_heartbeat_response().await?,
                HEARTBEAT_RESPONSE => {}
                _ => return Ok(line),
            }
        }
    }

    /// Sends a command line and collects the text of its response lines up to (and excluding)
    ///  the end-of-response line. An error status line becomes a [ServerError].
    pub async fn command(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        self.channel.write_text(line).await?;

        let mut result = Vec::new();
        let mut error = None;
        loop {
            let response = self.read_response_line().await?;
            match Status::parse_line(&response) {
                Some((Status::End, _)) => break,
                Some((Status::Error, text)) => error = Some(text.to_string()),
                Some((_, text)) => result.push(text.to_string()),
                None => bail!("malformed response line {:?}", response),
            }
        }

        match error {
            Some(text) => Err(ServerError(text).into()),
            None => Ok(result),
        }
    }

    /// sends `close` and closes the channel
    pub async fn close(mut self) -> anyhow::Result<()> {
        let result = self.command("close").await;
        self.channel.close().await;
        result.map(|_| ())
    }

    /// A transfer command has an empty response. After its end-of-response line, the server
    ///  either accepts or refuses the transfer.
    async fn await_acceptance(&mut self) -> anyhow::Result<()> {
        let response = self.read_response_line().await?;
        if !matches!(Status::parse_line(&response), Some((Status::End, _))) {
            bail!("unexpected response {:?}", response);
        }

        let response = self.read_response_line().await?;
        match Status::parse_line(&response) {
            Some((Status::Success, ACCEPT_TEXT)) => Ok(()),
            Some((Status::Error, text)) => Err(ServerError(text.to_string()).into()),
            _ => bail!("unexpected response {:?}", response),
        }
    }

    /// Downloads a file. When resuming, the bytes already present in `local_path` are kept and
    ///  only the rest is requested. Returns the number of bytes received.
    pub async fn download(&mut self, remote_name: &str, local_path: &Path, resume: bool) -> anyhow::Result<u64> {
        let local_name = local_path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| remote_name.to_string());
        let mut line = format!("download {} {}", remote_name, local_name);
        if resume {
            line.push_str(" continue");
        }

        self.channel.write_text(&line).await?;
        self.await_acceptance().await?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resume)
            .truncate(!resume)
            .open(local_path).await
            .with_context(|| format!("opening {:?}", local_path))?;

        if resume {
            let already_received = file.metadata().await?.len();
            debug!("resuming download of {} at byte {}", remote_name, already_received);
            self.channel.write_u64(already_received).await?;
        }
        self.channel.write_sync().await?;
        let expected = self.channel.read_u64(self.config.chunk_receive_timeout).await?;

        let max_chunk_len = self.channel.max_chunk_len();
        let mut received = 0;
        while received < expected {
            let max_len = max_chunk_len.min((expected - received) as usize);
            let chunk = self.channel.recv_chunk(max_len, self.config.chunk_receive_timeout).await?;
            if chunk.len() as u64 > expected - received {
                return Err(TransportError::Malformed("received more bytes than announced".to_string()).into());
            }
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
        }
        file.flush().await?;

        info!("downloaded {} bytes of {} to {:?}", received, remote_name, local_path);
        Ok(received)
    }

    /// Uploads a file, storing it as `remote_name` on the server. When resuming, the server
    ///  reports how much it already has, and only the rest is sent. Returns the number of bytes
    ///  sent.
    pub async fn upload(&mut self, local_path: &Path, remote_name: &str, resume: bool) -> anyhow::Result<u64> {
        let mut file = File::open(local_path).await
            .with_context(|| format!("opening {:?}", local_path))?;
        let file_len = fs::metadata(local_path).await?.len();

        let local_name = local_path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("{:?} has no file name", local_path))?;
        let mut line = format!("upload {} {}", local_name, remote_name);
        if resume {
            line.push_str(" continue");
        }

        self.channel.write_text(&line).await?;
        self.await_acceptance().await?;
        self.channel.write_sync().await?;

        let offset = if resume {
            self.channel.read_u64(self.config.chunk_receive_timeout).await?
        }
        else {
            0
        };
        if offset > file_len {
            bail!("server has {} bytes of {}, more than the local file's {}", offset, remote_name, file_len);
        }
        debug!("uploading {:?} from byte {}", local_path, offset);

        let remaining = file_len - offset;
        self.channel.write_u64(remaining).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; self.channel.max_chunk_len()];
        let mut sent = 0;
        while sent < remaining {
            let max_read = buf.len().min((remaining - sent) as usize);
            let num_read = file.read(&mut buf[..max_read]).await?;
            if num_read == 0 {
                bail!("{:?} shrank while it was being sent", local_path);
            }
            self.channel.send_chunk(&buf[..num_read], self.config.chunk_send_timeout).await?;
            sent += num_read as u64;
        }

        info!("uploaded {} bytes of {:?} as {}", sent, local_path, remote_name);
        Ok(sent)
    }
}
