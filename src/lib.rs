//! File transfer server and client speaking a small line-based command protocol over either a
//!  plain stream socket (TCP) or a reliable-delivery protocol built on top of UDP.
//!
//! The crate is layered bottom-up:
//!
//! * [reliable_udp] is an ARQ engine over unordered, lossy UDP datagrams: sequencing, a fixed
//!    sliding window, retransmission with exponential backoff, reordering and duplicate
//!    suppression on the receiving side.
//! * [channel] abstracts over the two transports, exposing exactly what the session and the
//!    transfer engine need (text units, heartbeats, binary framing).
//! * [transfer] moves file contents in both directions, resuming interrupted transfers.
//! * [session] is the per-peer protocol state machine with command dispatch and heartbeat
//!    based liveness detection.
//! * [client] and [server] put it all together.

pub mod error;
pub mod status;
pub mod config;
pub mod reliable_udp;
pub mod channel;
pub mod transfer;
pub mod session;
pub mod client;
pub mod server;
pub mod test_util;
