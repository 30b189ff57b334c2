use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::trace;

use crate::reliable_udp::datagram_socket::DatagramSocket;

/// Misbehavior of a simulated network link. The random number generator is seeded, so a
///  given seed always produces the same sequence of loss / duplication / reordering decisions
///  for the same sequence of sends.
#[derive(Debug, Clone)]
pub struct LinkConditions {
    pub drop_probability: f64,
    pub duplicate_probability: f64,
    /// probability that a datagram is held back and delivered after the next one
    pub reorder_probability: f64,
    pub seed: u64,
}

impl LinkConditions {
    pub fn perfect() -> LinkConditions {
        LinkConditions {
            drop_probability: 0.0,
            duplicate_probability: 0.0,
            reorder_probability: 0.0,
            seed: 0,
        }
    }

    pub fn dropping_everything() -> LinkConditions {
        LinkConditions {
            drop_probability: 1.0,
            ..Self::perfect()
        }
    }
}

type Datagram = (Bytes, SocketAddr);

struct LinkState {
    rng: StdRng,
    /// a datagram held back for reordering
    held_back: Option<Bytes>,
}

/// One end of an in-memory datagram link. Datagrams sent to any address other than the other
///  end's are silently discarded, as a real network would do for an address nobody listens on.
pub struct LossyDatagramSocket {
    self_addr: SocketAddr,
    peer_addr: SocketAddr,
    conditions: LinkConditions,
    state: Mutex<LinkState>,
    to_peer: mpsc::UnboundedSender<Datagram>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

/// Creates two connected ends of a simulated link, with the same link conditions in both
///  directions (but independent random sequences).
pub fn lossy_link_pair(conditions: LinkConditions) -> (LossyDatagramSocket, LossyDatagramSocket) {
    let addr_a = SocketAddr::from(([127, 0, 0, 1], 40001));
    let addr_b = SocketAddr::from(([127, 0, 0, 2], 40002));

    let (to_b, from_a) = mpsc::unbounded_channel();
    let (to_a, from_b) = mpsc::unbounded_channel();

    let conditions_b = LinkConditions {
        seed: conditions.seed.wrapping_add(1),
        ..conditions.clone()
    };

    let a = LossyDatagramSocket::new(addr_a, addr_b, conditions, to_b, from_b);
    let b = LossyDatagramSocket::new(addr_b, addr_a, conditions_b, to_a, from_a);
    (a, b)
}

impl LossyDatagramSocket {
    fn new(self_addr: SocketAddr, peer_addr: SocketAddr, conditions: LinkConditions, to_peer: mpsc::UnboundedSender<Datagram>, incoming: mpsc::UnboundedReceiver<Datagram>) -> LossyDatagramSocket {
        LossyDatagramSocket {
            self_addr,
            peer_addr,
            state: Mutex::new(LinkState {
                rng: StdRng::seed_from_u64(conditions.seed),
                held_back: None,
            }),
            conditions,
            to_peer,
            incoming: tokio::sync::Mutex::new(incoming),
        }
    }

    /// decides the fate of a datagram, returning the datagrams to put on the wire right now
    fn transmit(&self, buf: Bytes) -> Vec<Bytes> {
        let mut state = self.state.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.rng.gen_bool(self.conditions.drop_probability) {
            trace!("lossy link: dropping datagram");
            return Vec::new();
        }

        let mut result = Vec::new();
        if state.held_back.is_none() && state.rng.gen_bool(self.conditions.reorder_probability) {
            trace!("lossy link: holding back datagram");
            state.held_back = Some(buf);
            return result;
        }

        if state.rng.gen_bool(self.conditions.duplicate_probability) {
            trace!("lossy link: duplicating datagram");
            result.push(buf.clone());
        }
        result.push(buf);
        if let Some(held_back) = state.held_back.take() {
            result.push(held_back);
        }
        result
    }
}

#[async_trait]
impl DatagramSocket for LossyDatagramSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        if to != self.peer_addr {
            trace!("lossy link: no receiver at {:?}", to);
            return Ok(());
        }

        for datagram in self.transmit(Bytes::copy_from_slice(buf)) {
            // the other end being gone is no error for a datagram sender
            let _ = self.to_peer.send((datagram, self.self_addr));
        }
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some((datagram, from)) => {
                // like real UDP, excess bytes are truncated
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            None => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "link closed")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.self_addr)
    }
}
