use anyhow::bail;

use crate::comm::packet_header::{GlobalHeader, PacketHeader, GLOBAL_MAGIC_NUMBER};
use crate::comm::timing::Timing;

/// Default maximum number of simultaneous connections
pub const CONNECT_MAX: usize = 7;

/// Default socket selector, i.e. the UDP port for the datagram medium
pub const DEFAULT_SOCKET: u16 = 0x8813;

/// Largest packet (header + payload) that all supported media carry without fragmentation
pub const MEDIUM_MAX_PACKET_LEN: usize = 546;

/// Sizing and identification parameters of a `ConnectionManager`, fixed at construction
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Maximum application payload of a global channel packet (i.e. excluding the header)
    pub global_max_packet_len: usize,
    /// Number of entries in each of the global channel's send and receive rings
    pub global_queue_depth: usize,

    /// Maximum application payload of a private channel packet (i.e. excluding the header)
    pub private_max_packet_len: usize,
    /// Number of entries in each of a private channel's send and receive rings
    pub private_queue_depth: usize,

    /// Selects the channel on the medium, e.g. the UDP port
    pub socket: u16,

    /// Identifies the application on the medium. This is used verbatim as the magic number of
    ///  all private channel packets, so unrelated products sharing the medium ignore each
    ///  other's traffic.
    pub product_id: u16,

    pub max_connections: usize,

    /// initial timing, can be changed at runtime
    pub timing: Timing,
}

impl ManagerConfig {
    pub fn new(product_id: u16) -> ManagerConfig {
        ManagerConfig {
            global_max_packet_len: MEDIUM_MAX_PACKET_LEN - GlobalHeader::SERIALIZED_LEN,
            global_queue_depth: 160,
            private_max_packet_len: MEDIUM_MAX_PACKET_LEN - PacketHeader::SERIALIZED_LEN,
            private_queue_depth: 32,
            socket: DEFAULT_SOCKET,
            product_id,
            max_connections: CONNECT_MAX,
            timing: Timing::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.product_id == GLOBAL_MAGIC_NUMBER {
            bail!("product id {:#06x} is reserved for the global channel", self.product_id);
        }
        if self.global_queue_depth == 0 || self.private_queue_depth == 0 {
            bail!("queue depths must be positive");
        }
        if self.global_max_packet_len == 0 || self.private_max_packet_len == 0 {
            bail!("max packet lengths must be positive");
        }
        if self.global_max_packet_len + GlobalHeader::SERIALIZED_LEN > u16::MAX as usize
            || self.private_max_packet_len + PacketHeader::SERIALIZED_LEN > u16::MAX as usize
        {
            bail!("packets must fit a 16 bit length field");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be positive");
        }
        if self.timing.retry_delta == 0 {
            bail!("retry_delta must be at least one tick");
        }
        Ok(())
    }
}
