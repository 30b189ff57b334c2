use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::net::SocketAddr;
use bytes::Bytes;
use tracing::{debug, trace};

/// a message that was received in sequence and is ready for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub payload: Bytes,
    pub from: SocketAddr,
}

impl ReceivedMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SequencerResult {
    /// cumulative ACK to send back to the peer, if any
    pub ack: Option<u32>,
    /// messages that became deliverable in sequence, in order
    pub deliverable: Vec<ReceivedMessage>,
}

/// Receiver side of the protocol: puts data packets back into sequence, drops duplicates and
///  decides what to acknowledge.
///
/// Packets arriving ahead of a gap are buffered until the gap is filled. They are *not*
///  acknowledged: ACKs are cumulative, so the receiver only ever acknowledges the highest
///  sequence number up to which it received everything. A packet at or below the expected
///  sequence number (including re-sent duplicates) always triggers an ACK so the sender stops
///  re-sending it.
pub struct ReceiveSequencer {
    expected: u32,
    reorder_buffer: BTreeMap<u32, ReceivedMessage>,
}

impl ReceiveSequencer {
    pub fn new() -> ReceiveSequencer {
        ReceiveSequencer {
            expected: 0,
            reorder_buffer: BTreeMap::default(),
        }
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn buffered_count(&self) -> usize {
        self.reorder_buffer.len()
    }

    pub fn on_data_packet(&mut self, sequence_number: u32, payload: Bytes, from: SocketAddr) -> SequencerResult {
        let acknowledge = sequence_number <= self.expected;

        if sequence_number < self.expected {
            debug!("received duplicate of packet {} (expecting {}) - dropping", sequence_number, self.expected);
        }
        else {
            match self.reorder_buffer.entry(sequence_number) {
                Entry::Occupied(_) => {
                    debug!("received duplicate of buffered packet {} - dropping", sequence_number);
                }
                Entry::Vacant(e) => {
                    e.insert(ReceivedMessage { payload, from });
                }
            }
        }

        let deliverable = self.flush();

        SequencerResult {
            ack: acknowledge.then(|| self.expected.wrapping_sub(1)),
            deliverable,
        }
    }

    fn flush(&mut self) -> Vec<ReceivedMessage> {
        let mut result = Vec::new();

        while let Some(entry) = self.reorder_buffer.first_entry() {
            if *entry.key() == self.expected {
                result.push(entry.remove());
                self.expected = self.expected.wrapping_add(1);
            }
            else if *entry.key() < self.expected {
                trace!("dropping stale buffered packet {}", entry.key());
                entry.remove();
            }
            else {
                trace!("gap before packet {} - waiting for {}", entry.key(), self.expected);
                break;
            }
        }

        result
    }
}

impl Default for ReceiveSequencer {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7))
    }

    fn payload(seq: u32) -> Bytes {
        Bytes::from(format!("msg-{}", seq))
    }

    #[rstest]
    #[case::in_order(vec![0,1,2], vec![Some(0), Some(1), Some(2)], vec![0,1,2])]
    #[case::swapped(vec![1,0,2], vec![None, Some(1), Some(2)], vec![0,1,2])]
    #[case::reversed(vec![3,2,1,0], vec![None, None, None, Some(3)], vec![0,1,2,3])]
    #[case::duplicate_delivered(vec![0,0,1], vec![Some(0), Some(0), Some(1)], vec![0,1])]
    #[case::duplicate_buffered(vec![2,2,0,1], vec![None, None, Some(0), Some(2)], vec![0,1,2])]
    #[case::gap(vec![0,2,3], vec![Some(0), None, None], vec![0])]
    #[case::old_duplicate_after_gap(vec![0,1,3,0], vec![Some(0), Some(1), None, Some(1)], vec![0,1])]
    fn test_sequencing(#[case] arrivals: Vec<u32>, #[case] expected_acks: Vec<Option<u32>>, #[case] expected_delivered: Vec<u32>) {
        let mut sequencer = ReceiveSequencer::new();
        let mut acks = Vec::new();
        let mut delivered = Vec::new();

        for seq in arrivals {
            let result = sequencer.on_data_packet(seq, payload(seq), addr());
            acks.push(result.ack);
            delivered.extend(result.deliverable);
        }

        assert_eq!(acks, expected_acks);
        assert_eq!(delivered, expected_delivered.iter()
            .map(|&seq| ReceivedMessage { payload: payload(seq), from: addr() })
            .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_gap_is_buffered_until_filled() {
        let mut sequencer = ReceiveSequencer::new();
        assert!(sequencer.on_data_packet(1, payload(1), addr()).deliverable.is_empty());
        assert!(sequencer.on_data_packet(2, payload(2), addr()).deliverable.is_empty());
        assert_eq!(sequencer.buffered_count(), 2);
        assert_eq!(sequencer.expected(), 0);

        let result = sequencer.on_data_packet(0, payload(0), addr());
        assert_eq!(result.ack, Some(2));
        assert_eq!(result.deliverable.len(), 3);
        assert_eq!(sequencer.buffered_count(), 0);
        assert_eq!(sequencer.expected(), 3);
    }

    #[test]
    fn test_text() {
        let msg = ReceivedMessage { payload: Bytes::from_static(b"200 ACCEPT"), from: addr() };
        assert_eq!(msg.text(), "200 ACCEPT");
    }
}
