//! Utilities for testing code that sits on top of the transports. They are part of the regular
//!  (non-#[cfg(test)]) code so applications can use them for their own tests.

pub mod lossy_link;

pub use lossy_link::{lossy_link_pair, LinkConditions, LossyDatagramSocket};
