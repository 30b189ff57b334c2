use std::path::PathBuf;
use std::time::Duration;
use anyhow::bail;
use crate::reliable_udp::config::ReliableUdpConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// A session waits this long for the next command before it challenges the peer with a
    ///  heartbeat request.
    pub read_timeout: Duration,
    /// number of heartbeat requests sent on consecutive read timeouts. The next timeout after
    ///  that closes the session.
    pub heartbeat_limit: u32,

    /// `download` commands serve files from this directory
    pub download_dir: PathBuf,
    /// `upload` commands store files in this directory
    pub upload_dir: PathBuf,

    /// chunk size for file contents on stream (TCP) channels. On reliable UDP channels, chunks
    ///  are bounded by the maximum packet payload instead.
    pub stream_chunk_size: usize,
    pub chunk_send_timeout: Duration,
    pub chunk_receive_timeout: Duration,

    /// how long the UDP listener waits for a connecting client to acknowledge the session port
    pub handshake_timeout: Duration,

    pub udp: ReliableUdpConfig,
}

impl ServerConfig {
    pub fn new() -> ServerConfig {
        ServerConfig {
            read_timeout: Duration::from_secs(40),
            heartbeat_limit: 3,
            download_dir: PathBuf::from("download"),
            upload_dir: PathBuf::from("upload"),
            stream_chunk_size: 8192,
            chunk_send_timeout: Duration::from_secs(120),
            chunk_receive_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(5),
            udp: ReliableUdpConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_limit == 0 {
            bail!("heartbeat limit must be positive");
        }
        if self.read_timeout.is_zero() {
            bail!("read timeout must be positive");
        }
        if self.stream_chunk_size == 0 {
            bail!("stream chunk size must be positive");
        }
        self.udp.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::new()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// maximum wait for each line of a command's response
    pub response_timeout: Duration,
    pub stream_chunk_size: usize,
    pub chunk_send_timeout: Duration,
    pub chunk_receive_timeout: Duration,
    pub udp: ReliableUdpConfig,
}

impl ClientConfig {
    pub fn new() -> ClientConfig {
        ClientConfig {
            response_timeout: Duration::from_secs(40),
            stream_chunk_size: 8192,
            chunk_send_timeout: Duration::from_secs(120),
            chunk_receive_timeout: Duration::from_secs(120),
            udp: ReliableUdpConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stream_chunk_size == 0 {
            bail!("stream chunk size must be positive");
        }
        self.udp.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::new()
    }
}
