//! Accept loops for both transports. Every client gets a [Session] running in a task of its
//!  own. Transfer engines (and with them the state for resuming transfers) are kept per client
//!  IP address, so a client can resume a transfer after reconnecting.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{StreamChannel, UdpChannel};
use crate::config::ServerConfig;
use crate::reliable_udp::ReliableUdpSocket;
use crate::session::commands::CommandRegistry;
use crate::session::Session;
use crate::status::{Status, CONNECT_TEXT};
use crate::transfer::TransferEngine;


/// one [TransferEngine] per client IP address
struct TransferEngines {
    config: Arc<ServerConfig>,
    engines: Mutex<FxHashMap<IpAddr, Arc<tokio::sync::Mutex<TransferEngine>>>>,
}

impl TransferEngines {
    fn new(config: Arc<ServerConfig>) -> TransferEngines {
        TransferEngines {
            config,
            engines: Mutex::new(FxHashMap::default()),
        }
    }

    fn for_peer(&self, peer: IpAddr) -> Arc<tokio::sync::Mutex<TransferEngine>> {
        let mut engines = self.engines.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        engines.entry(peer)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(TransferEngine::new(&self.config))))
            .clone()
    }
}


/// Accepts TCP connections until `shutdown` is cancelled. Sessions that are running at that
///  point continue until they end.
pub async fn serve_tcp(listener: TcpListener, config: Arc<ServerConfig>, shutdown: CancellationToken) -> anyhow::Result<()> {
    config.validate()?;
    info!("serving TCP on {:?}", listener.local_addr()?);

    let engines = TransferEngines::new(config.clone());
    let commands = Arc::new(CommandRegistry::default());

    loop {
        let (stream, peer_addr) = select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(x) => x,
                Err(e) => {
                    error!("error accepting TCP connection: {}", e);
                    continue;
                }
            },
        };
        info!("accepted TCP connection from {:?}", peer_addr);

        let channel = match StreamChannel::from_tcp(stream, config.stream_chunk_size) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("dropping connection from {:?}: {}", peer_addr, e);
                continue;
            }
        };

        let mut session = Session::with_commands(Box::new(channel), engines.for_peer(peer_addr.ip()), config.clone(), commands.clone());
        tokio::spawn(async move { session.communicate().await });
    }

    info!("TCP server shut down");
    Ok(())
}

/// Listens for UDP connect requests until `shutdown` is cancelled. For every request, a new
///  reliable UDP socket is bound to an ephemeral port for the session, and its port is sent to
///  the client.
///
/// The listener's sequencing state is reset after every handshake, so clients are handled one
///  at a time here. A client connecting while another handshake is in progress may lose its
///  request and has to retry. A repeated connect request from a client that was accepted less
///  than a handshake timeout ago is a retransmission and is ignored.
pub async fn serve_udp(listener: ReliableUdpSocket, config: Arc<ServerConfig>, shutdown: CancellationToken) -> anyhow::Result<()> {
    config.validate()?;
    let listen_addr = listener.local_addr()?;
    info!("serving UDP on {:?}", listen_addr);

    let engines = TransferEngines::new(config.clone());
    let commands = Arc::new(CommandRegistry::default());
    let udp_config = Arc::new(config.udp.clone());

    let mut recently_accepted: FxHashMap<SocketAddr, Instant> = FxHashMap::default();

    listener.start().await;

    loop {
        let request = select! {
            _ = shutdown.cancelled() => break,
            received = listener.receive(None) => received?,
        };

        let text = request.text();
        if text.trim() != Status::Connect.line(CONNECT_TEXT) {
            warn!("ignoring {:?} from {:?}: expected a connect request", text, request.from);
            continue;
        }
        let peer_addr = request.from;

        recently_accepted.retain(|_, accepted_at| accepted_at.elapsed() < config.handshake_timeout);
        if recently_accepted.contains_key(&peer_addr) {
            debug!("ignoring repeated connect request from {:?}", peer_addr);
            continue;
        }

        let session_socket = match ReliableUdpSocket::bind(SocketAddr::new(listen_addr.ip(), 0), udp_config.clone()).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!("failed to bind a session socket for {:?}: {}", peer_addr, e);
                listener.start().await;
                continue;
            }
        };
        session_socket.start().await;
        let session_port = session_socket.local_addr()?.port();

        if let Err(e) = accept_udp_client(&listener, peer_addr, session_port, &config).await {
            warn!("handshake with {:?} failed: {}", peer_addr, e);
            session_socket.stop().await;
            listener.start().await;
            continue;
        }
        info!("accepted UDP client {:?}, session on port {}", peer_addr, session_port);
        recently_accepted.insert(peer_addr, Instant::now());

        // fresh sequence numbers for the next client
        listener.start().await;

        let channel = UdpChannel::new(session_socket, peer_addr, config.chunk_send_timeout);
        let mut session = Session::with_commands(Box::new(channel), engines.for_peer(peer_addr.ip()), config.clone(), commands.clone());
        tokio::spawn(async move { session.communicate().await });
    }

    listener.stop().await;
    info!("UDP server shut down");
    Ok(())
}

async fn accept_udp_client(listener: &ReliableUdpSocket, peer_addr: SocketAddr, session_port: u16, config: &ServerConfig) -> anyhow::Result<()> {
    let timeout = Some(config.handshake_timeout);
    listener.send_text(&Status::accept_line(), peer_addr, timeout).await?;
    listener.send_text(&session_port.to_string(), peer_addr, timeout).await?;

    // the client restarts its socket after the handshake, so there is no point in re-sending
    //  beyond this
    if let Err(e) = listener.flush(config.handshake_timeout).await {
        debug!("handshake with {:?} not acknowledged: {}", peer_addr, e);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use crate::client::Client;
    use crate::config::{ClientConfig, ServerConfig};
    use crate::error::ServerError;
    use bytes::Bytes;
    use crate::reliable_udp::config::ReliableUdpConfig;
    use crate::reliable_udp::packet::Packet;
    use crate::reliable_udp::ReliableUdpSocket;
    use super::*;

    struct TestServer {
        dir: tempfile::TempDir,
        addr: SocketAddr,
        shutdown: CancellationToken,
    }

    impl TestServer {
        fn download_dir(&self) -> std::path::PathBuf {
            self.dir.path().join("download")
        }

        fn upload_dir(&self) -> std::path::PathBuf {
            self.dir.path().join("upload")
        }

        fn local_dir(&self) -> std::path::PathBuf {
            self.dir.path().join("local")
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn udp_config() -> ReliableUdpConfig {
        ReliableUdpConfig {
            base_retry_timeout: Duration::from_millis(50),
            retry_check_interval: Duration::from_millis(10),
            ..ReliableUdpConfig::new(512)
        }
    }

    fn server_config(dir: &Path) -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            read_timeout: Duration::from_secs(5),
            download_dir: dir.join("download"),
            upload_dir: dir.join("upload"),
            chunk_send_timeout: Duration::from_secs(1),
            chunk_receive_timeout: Duration::from_secs(5),
            udp: udp_config(),
            ..Default::default()
        })
    }

    fn client_config() -> Arc<ClientConfig> {
        Arc::new(ClientConfig {
            response_timeout: Duration::from_secs(5),
            chunk_send_timeout: Duration::from_secs(5),
            chunk_receive_timeout: Duration::from_secs(5),
            udp: udp_config(),
            ..Default::default()
        })
    }

    fn prepare_dirs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["download", "upload", "local"] {
            std::fs::create_dir(dir.path().join(sub)).unwrap();
        }
        dir
    }

    async fn tcp_server() -> TestServer {
        let dir = prepare_dirs();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_tcp(listener, server_config(dir.path()), shutdown.clone()));
        TestServer { dir, addr, shutdown }
    }

    async fn udp_server() -> TestServer {
        let dir = prepare_dirs();
        let config = server_config(dir.path());
        let listener = ReliableUdpSocket::bind("127.0.0.1:0".parse().unwrap(), Arc::new(config.udp.clone())).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_udp(listener, config, shutdown.clone()));
        TestServer { dir, addr, shutdown }
    }

    fn file_content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn check_commands(client: &mut Client) {
        assert_eq!(client.command("echo hello world").await.unwrap(), vec!["hello world"]);
        assert_eq!(client.command("time").await.unwrap().len(), 1);
        assert!(client.command("help").await.unwrap().len() > 1);

        let e = client.command("nonsense").await.unwrap_err();
        assert_eq!(e.downcast_ref::<ServerError>(), Some(&ServerError("No such command: nonsense".to_string())));
    }

    async fn check_transfers(server: &TestServer, client: &mut Client) {
        let content = file_content(5000);
        std::fs::write(server.download_dir().join("data.bin"), &content).unwrap();

        let local = server.local_dir().join("data.bin");
        assert_eq!(client.download("data.bin", &local, false).await.unwrap(), 5000);
        assert_eq!(std::fs::read(&local).unwrap(), content);

        assert_eq!(client.upload(&local, "copy.bin", false).await.unwrap(), 5000);
        assert_eq!(client.command("echo done").await.unwrap(), vec!["done"]);
        assert_eq!(std::fs::read(server.upload_dir().join("copy.bin")).unwrap(), content);

        let e = client.download("missing.bin", &server.local_dir().join("missing.bin"), false).await.unwrap_err();
        assert_eq!(e.downcast_ref::<ServerError>(), Some(&ServerError("File missing.bin not found".to_string())));

        // the session is still usable
        assert_eq!(client.command("list").await.unwrap(), vec!["Contents of the download directory:", "File: data.bin"]);
    }

    #[tokio::test]
    async fn test_tcp() {
        let server = tcp_server().await;
        let mut client = Client::connect_tcp(server.addr, client_config()).await.unwrap();

        check_commands(&mut client).await;
        check_transfers(&server, &mut client).await;
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp() {
        let server = udp_server().await;
        let mut client = Client::connect_udp(server.addr, client_config()).await.unwrap();

        check_commands(&mut client).await;
        check_transfers(&server, &mut client).await;
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_clients_one_after_another() {
        let server = udp_server().await;

        for i in 0..3 {
            let mut client = Client::connect_udp(server.addr, client_config()).await.unwrap();
            let text = format!("client {}", i);
            assert_eq!(client.command(&format!("echo {}", text)).await.unwrap(), vec![text]);
            client.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_repeated_connect_request_is_ignored() {
        let server = udp_server().await;
        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = Packet::data(0, Bytes::from_static(b"100 CONNECT")).to_bytes();
        client.send_to(&connect, server.addr).await.unwrap();

        // acknowledge the listener's ACCEPT and port messages
        let mut buf = [0u8; 1024];
        let mut data_received = Vec::new();
        while data_received.len() < 2 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf)).await.unwrap().unwrap();
            let packet = Packet::deser(&buf[..len]).unwrap();
            if !packet.is_ack {
                client.send_to(&Packet::ack(packet.sequence_number).to_bytes(), server.addr).await.unwrap();
                if !data_received.contains(&packet.sequence_number) {
                    data_received.push(packet.sequence_number);
                }
            }
        }

        // the listener restarts after the handshake. The connect request arrives again, as if
        //  the listener's ACK had been lost.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while client.try_recv_from(&mut buf).is_ok() {}
        client.send_to(&connect, server.addr).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(500);
        while let Ok(received) = tokio::time::timeout_at(deadline, client.recv_from(&mut buf)).await {
            let (len, _) = received.unwrap();
            let packet = Packet::deser(&buf[..len]).unwrap();
            assert!(packet.is_ack, "unexpected {:?}", packet);
        }
    }

    #[tokio::test]
    async fn test_tcp_clients_in_parallel() {
        let server = tcp_server().await;
        let mut first = Client::connect_tcp(server.addr, client_config()).await.unwrap();
        let mut second = Client::connect_tcp(server.addr, client_config()).await.unwrap();

        assert_eq!(first.command("echo 1").await.unwrap(), vec!["1"]);
        assert_eq!(second.command("echo 2").await.unwrap(), vec!["2"]);
        first.close().await.unwrap();
        assert_eq!(second.command("echo 2 again").await.unwrap(), vec!["2 again"]);
    }

    #[tokio::test]
    async fn test_upload_resumes_after_reconnect() {
        let server = tcp_server().await;
        let content = file_content(20_000);
        let local = server.local_dir().join("big.bin");
        std::fs::write(&local, &content).unwrap();

        // an upload that breaks off after 7000 bytes
        {
            let mut client = Client::connect_tcp(server.addr, client_config()).await.unwrap();
            let channel = client.channel();
            channel.write_text("upload big.bin big.bin").await.unwrap();
            assert_eq!(channel.read_unit(Duration::from_secs(5)).await.unwrap(), "300 END");
            assert_eq!(channel.read_unit(Duration::from_secs(5)).await.unwrap(), "200 ACCEPT");
            channel.write_sync().await.unwrap();
            channel.write_u64(content.len() as u64).await.unwrap();
            channel.send_chunk(&content[..7000], Duration::from_secs(5)).await.unwrap();
            channel.close().await;
        }

        let uploaded = server.upload_dir().join("big.bin");
        let mut waited = 0;
        while std::fs::metadata(&uploaded).map(|m| m.len()).unwrap_or(0) < 7000 && waited < 100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 1;
        }

        let mut client = Client::connect_tcp(server.addr, client_config()).await.unwrap();
        assert_eq!(client.upload(&local, "big.bin", true).await.unwrap(), 13_000);
        assert_eq!(client.command("echo done").await.unwrap(), vec!["done"]);
        assert_eq!(std::fs::read(&uploaded).unwrap(), content);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_download_resumes_after_reconnect() {
        let server = udp_server().await;
        let content = file_content(20_000);
        std::fs::write(server.download_dir().join("big.bin"), &content).unwrap();
        let local = server.local_dir().join("big.bin");

        // a download that breaks off after some chunks
        {
            let mut client = Client::connect_udp(server.addr, client_config()).await.unwrap();
            let channel = client.channel();
            channel.write_text("download big.bin big.bin").await.unwrap();
            assert_eq!(channel.read_unit(Duration::from_secs(5)).await.unwrap(), "300 END");
            assert_eq!(channel.read_unit(Duration::from_secs(5)).await.unwrap(), "200 ACCEPT");
            channel.write_sync().await.unwrap();
            assert_eq!(channel.read_u64(Duration::from_secs(5)).await.unwrap(), 20_000);

            let mut partial = Vec::new();
            for _ in 0..10 {
                partial.extend_from_slice(&channel.recv_chunk(usize::MAX, Duration::from_secs(5)).await.unwrap());
            }
            std::fs::write(&local, &partial).unwrap();
            channel.close().await;
        }

        let mut client = Client::connect_udp(server.addr, client_config()).await.unwrap();
        let partial_len = std::fs::metadata(&local).unwrap().len();

        // the server notices the broken session only after its send timeout, and the new
        //  session waits for the transfer engine until then
        let received = client.download("big.bin", &local, true).await.unwrap();
        assert_eq!(received, 20_000 - partial_len);
        assert_eq!(std::fs::read(&local).unwrap(), content);

        // resuming a completed download is rejected, downloading it again starts from scratch
        let e = client.download("big.bin", &local, true).await.unwrap_err();
        assert!(e.downcast_ref::<ServerError>().is_some());
        assert_eq!(client.download("big.bin", &local, false).await.unwrap(), 20_000);
        assert_eq!(std::fs::read(&local).unwrap(), content);
        client.close().await.unwrap();
    }
}
