use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::error::TransportError;

/// A single datagram of the reliable UDP protocol. All numbers are in network byte order (BE):
///
/// ```ascii
/// 0: sequence number (u32)
/// 4: ACK flag (u8) - 1 for an acknowledgement, 0 for a data packet
/// 5: payload length (u32)
/// 9: payload
/// ```
///
/// An ACK has an empty payload, and its sequence number is the (cumulative) sequence number
///  being acknowledged.
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    pub sequence_number: u32,
    pub is_ack: bool,
    pub payload: Bytes,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_ack {
            write!(f, "ACK{{{}}}", self.sequence_number)
        }
        else {
            write!(f, "DATA{{{}:{} bytes}}", self.sequence_number, self.payload.len())
        }
    }
}

impl Packet {
    pub const HEADER_LEN: usize = size_of::<u32>() + size_of::<u8>() + size_of::<u32>();

    pub fn data(sequence_number: u32, payload: Bytes) -> Packet {
        Packet { sequence_number, is_ack: false, payload }
    }

    pub fn ack(sequence_number: u32) -> Packet {
        Packet { sequence_number, is_ack: true, payload: Bytes::new() }
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sequence_number);
        buf.put_u8(if self.is_ack { 1 } else { 0 });
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Trailing bytes after the declared payload are ignored, a payload that is shorter than
    ///  declared makes the packet malformed.
    pub fn deser(mut buf: &[u8]) -> Result<Packet, TransportError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(TransportError::Malformed(format!("packet of {} bytes is shorter than the header", buf.len())));
        }

        let sequence_number = buf.get_u32();
        let is_ack = match buf.get_u8() {
            0 => false,
            1 => true,
            other => return Err(TransportError::Malformed(format!("invalid ACK flag {}", other))),
        };
        let payload_len = buf.get_u32() as usize;
        if payload_len > buf.remaining() {
            return Err(TransportError::Malformed(format!("declared payload length {} exceeds remaining {} bytes", payload_len, buf.remaining())));
        }
        if is_ack && payload_len != 0 {
            return Err(TransportError::Malformed("ACK with payload".to_string()));
        }

        Ok(Packet {
            sequence_number,
            is_ack,
            payload: Bytes::copy_from_slice(&buf[..payload_len]),
        })
    }
}
