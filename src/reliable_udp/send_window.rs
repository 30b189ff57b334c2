use std::collections::BTreeMap;
use std::net::SocketAddr;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::reliable_udp::config::ReliableUdpConfig;

/// an unacknowledged data packet, kept for re-sending until a cumulative ACK covers it
#[derive(Debug, Clone)]
pub struct PendingSend {
    /// the serialized packet, ready to go on the wire as is
    pub packet_buf: Bytes,
    pub to: SocketAddr,
    pub retries: u32,
    pub last_sent: Instant,
}

/// Sender side bookkeeping: sequence numbers, the sliding window and the retransmission table.
///
/// The window is credit based: each transmitted data packet takes one credit, and a cumulative
///  ACK for `N` returns one credit for each packet it newly covers. The number of available
///  credits is `window_size - (next_seq - last_acked - 1)`.
///
/// NB: Sequence numbers wrap around after `u32::MAX`, but comparisons do not account for that.
///      Once a sender has sent 2^32 packets, ACKs are no longer matched and the window stalls.
pub struct SendWindow {
    window_size: u32,
    next_seq: u32,
    last_acked: Option<u32>,
    pending: BTreeMap<u32, PendingSend>,
}

impl SendWindow {
    pub fn new(window_size: u32) -> SendWindow {
        SendWindow {
            window_size,
            next_seq: 0,
            last_acked: None,
            pending: BTreeMap::default(),
        }
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn last_acked(&self) -> Option<u32> {
        self.last_acked
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn first_unacked(&self) -> u32 {
        self.last_acked
            .map(|seq| seq.wrapping_add(1))
            .unwrap_or(0)
    }

    pub fn in_flight(&self) -> u32 {
        self.next_seq.wrapping_sub(self.first_unacked())
    }

    pub fn window_available(&self) -> u32 {
        self.window_size.saturating_sub(self.in_flight())
    }

    /// Registers a data packet after it was transmitted successfully for the first time,
    ///  advancing the next sequence number. The caller is responsible for having reserved a
    ///  window credit.
    pub fn on_sent(&mut self, sequence_number: u32, packet_buf: Bytes, to: SocketAddr, now: Instant) {
        debug_assert_eq!(sequence_number, self.next_seq);
        debug_assert!(self.in_flight() < self.window_size);

        self.pending.insert(sequence_number, PendingSend {
            packet_buf,
            to,
            retries: 0,
            last_sent: now,
        });
        self.next_seq = self.next_seq.wrapping_add(1);
    }

    /// Handles a cumulative ACK, retiring all pending packets up to and including
    ///  `sequence_number`. Returns the number of window credits to give back, which is zero for
    ///  stale or duplicate ACKs, for ACKs of packets that were never sent, and for ACKs from an
    ///  address that some of the covered packets were not sent to.
    #[must_use]
    pub fn on_ack(&mut self, sequence_number: u32, from: SocketAddr) -> u32 {
        if sequence_number >= self.next_seq {
            debug!("ACK {} for a packet that was not sent yet (next is {}) - ignoring", sequence_number, self.next_seq);
            return 0;
        }
        if let Some(last_acked) = self.last_acked {
            if sequence_number <= last_acked {
                trace!("stale ACK {} (last acked {})", sequence_number, last_acked);
                return 0;
            }
        }

        if let Some((seq, pending)) = self.pending.range(..=sequence_number).find(|(_, p)| p.to != from) {
            debug!("ACK {} from {:?}, but packet {} was sent to {:?} - ignoring", sequence_number, from, seq, pending.to);
            return 0;
        }

        let credits = sequence_number - self.first_unacked() + 1;
        self.pending = self.pending.split_off(&(sequence_number + 1));
        self.last_acked = Some(sequence_number);

        trace!("ACK {} retired {} packet(s)", sequence_number, credits);
        credits
    }

    /// Collects all packets that waited for their ACK longer than their (exponentially growing)
    ///  retry timeout, marking them as re-sent at `now`.
    pub fn due_for_retry(&mut self, now: Instant, config: &ReliableUdpConfig) -> Vec<(u32, PendingSend)> {
        let mut result = Vec::new();
        for (&seq, pending) in self.pending.iter_mut() {
            if now.saturating_duration_since(pending.last_sent) > config.retry_timeout(pending.retries) {
                pending.retries += 1;
                pending.last_sent = now;
                result.push((seq, pending.clone()));
            }
        }
        result
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
