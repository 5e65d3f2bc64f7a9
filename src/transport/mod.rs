pub mod serial;
pub mod tunnel;
pub mod udp;

#[cfg(test)] use mockall::automock;
use bytes::Bytes;

use crate::comm::address::{Address, Destination};

/// A raw buffer as received from the medium, together with the address the medium reports as
///  its sender
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundPacket {
    pub sender: Address,
    pub payload: Bytes,
}

/// This is the capability a networking medium offers to the reliability layer. Implementations
///  exist for a datagram broadcast medium, a socket tunnel and a framed serial line; the
///  connection manager does not know which one it is talking to.
///
/// All operations are non-blocking. Sending is best effort: an implementation may drop a packet
///  silently, and the layer above compensates by retrying. Implementations that receive data
///  asynchronously (interrupts, OS buffers) are responsible for staging it so that
///  `poll_inbound` can hand it out without allocating or blocking.
#[cfg_attr(test, automock)]
pub trait PacketTransport {
    /// `false` if the medium cannot be used at all (device missing, relay disconnected, ...)
    fn is_available(&self) -> bool;

    /// (Re-)acquires the medium's resources. `socket` selects a channel on media that support
    ///  several, e.g. the UDP port.
    fn open(&mut self, socket: u16) -> anyhow::Result<()>;

    fn close(&mut self);

    /// Returns the next staged inbound packet, or `None` if nothing is available right now
    fn poll_inbound(&mut self) -> Option<InboundPacket>;

    /// Returns `false` if the packet was not handed to the medium
    fn send(&mut self, to: &Destination, buf: &[u8]) -> bool;
}
