//! Reliable and unreliable packet exchange between peers on a broadcast-capable medium, driven by
//!  a single [comm::connection_manager::ConnectionManager] that the application polls once per
//!  loop iteration.
//!
//! There is one *global channel* for broadcasts and one-off packets to arbitrary peers, and any
//!  number of *private connections*, each talking to a single known peer. Every packet starts
//!  with a header (all numbers BE):
//!
//! ```ascii
//! 0:  magic number (u16) - the global magic number, or the product id for private packets
//! 2:  packet code (u8) - 0: data with ack, 1: data without ack, 2: ack
//! 3:  packet id (u32)
//! 7:  (global channel only) the sender's product id (u16)
//! *:  payload
//! ```
//!
//! The medium itself is abstracted as a [transport::PacketTransport].

pub mod comm;
pub mod transport;
pub mod util;
pub mod test_util;
