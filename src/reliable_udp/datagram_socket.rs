use std::net::SocketAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending and receiving raw datagrams, introduced to facilitate
///  mocking the I/O part away (or injecting loss, duplication and reordering) for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<()>;

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        UdpSocket::send_to(self, buf, to).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
