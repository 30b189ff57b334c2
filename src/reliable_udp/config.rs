use std::time::Duration;
use anyhow::bail;
use crate::reliable_udp::packet::Packet;

/// The largest payload that fits into a single UDP datagram over IP V4
pub const MAX_UDP_PAYLOAD: usize = 65507;

#[derive(Debug, Clone)]
pub struct ReliableUdpConfig {
    /// This is the maximum size of a datagram on the wire, *including* the packet header. It
    ///  bounds the size of messages passed to [crate::reliable_udp::ReliableUdpSocket::send],
    ///  and it is the receive buffer size - both ends must agree on it.
    pub packet_size: usize,

    /// maximum number of unacknowledged data packets in flight
    pub window_size: u32,

    /// A packet is re-sent if it is not acknowledged for `base_retry_timeout * 2^retries`.
    pub base_retry_timeout: Duration,

    /// how often the background task scans the pending table for packets to re-send
    pub retry_check_interval: Duration,

    /// used by `receive(None)`; `None` means waiting forever
    pub default_receive_timeout: Option<Duration>,
}

impl ReliableUdpConfig {
    pub fn new(packet_size: usize) -> ReliableUdpConfig {
        ReliableUdpConfig {
            packet_size,
            window_size: 5,
            base_retry_timeout: Duration::from_secs(1),
            retry_check_interval: Duration::from_millis(100),
            default_receive_timeout: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.packet_size <= Packet::HEADER_LEN || self.packet_size > MAX_UDP_PAYLOAD {
            bail!("packet size must be between {} and {}, was {}", Packet::HEADER_LEN + 1, MAX_UDP_PAYLOAD, self.packet_size);
        }
        if self.window_size == 0 {
            bail!("window size must be positive");
        }
        if self.base_retry_timeout.is_zero() || self.retry_check_interval.is_zero() {
            bail!("retry timeouts must be positive");
        }
        Ok(())
    }

    pub fn max_payload_len(&self) -> usize {
        self.packet_size - Packet::HEADER_LEN
    }

    /// Exponential backoff: the time a packet with a given number of retries waits for its ACK
    ///  before it is re-sent. The exponent is capped so the result does not overflow, there is
    ///  no upper bound on the number of retries.
    pub fn retry_timeout(&self, retries: u32) -> Duration {
        self.base_retry_timeout.saturating_mul(1 << retries.min(16))
    }
}

impl Default for ReliableUdpConfig {
    fn default() -> Self {
        // 1024 bytes of payload per packet
        ReliableUdpConfig::new(1024 + Packet::HEADER_LEN)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::default(ReliableUdpConfig::default(), true)]
    #[case::tiny(ReliableUdpConfig::new(Packet::HEADER_LEN + 1), true)]
    #[case::header_only(ReliableUdpConfig::new(Packet::HEADER_LEN), false)]
    #[case::max(ReliableUdpConfig::new(MAX_UDP_PAYLOAD), true)]
    #[case::too_big(ReliableUdpConfig::new(MAX_UDP_PAYLOAD + 1), false)]
    #[case::no_window(ReliableUdpConfig { window_size: 0, ..Default::default() }, false)]
    #[case::no_timeout(ReliableUdpConfig { base_retry_timeout: Duration::ZERO, ..Default::default() }, false)]
    fn test_validate(#[case] config: ReliableUdpConfig, #[case] expected_valid: bool) {
        assert_eq!(config.validate().is_ok(), expected_valid);
    }

    #[rstest]
    #[case(0, 100)]
    #[case(1, 200)]
    #[case(2, 400)]
    #[case(5, 3200)]
    #[case(16, 6553600)]
    #[case(40, 6553600)]
    fn test_retry_timeout(#[case] retries: u32, #[case] expected_millis: u64) {
        let config = ReliableUdpConfig {
            base_retry_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(config.retry_timeout(retries), Duration::from_millis(expected_millis));
    }

    #[test]
    fn test_max_payload_len() {
        assert_eq!(ReliableUdpConfig::default().max_payload_len(), 1024);
    }
}
