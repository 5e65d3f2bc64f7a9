use crate::comm::address::Address;
use crate::comm::private_channel::PrivateChannel;

/// Application-chosen connection identifier
pub type ConnectionId = i32;

/// Reserved id meaning 'no connection'
pub const CONNECTION_NONE: ConnectionId = -1;

/// Addresses one or all of a manager's connections
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionTarget {
    All,
    Id(ConnectionId),
}

/// A named, addressed private channel to a single peer. Connections are owned exclusively by
///  their `ConnectionManager`.
pub struct Connection {
    id: ConnectionId,
    name: String,
    address: Address,
    channel: PrivateChannel,
}

impl Connection {
    pub fn new(id: ConnectionId, name: &str, address: Address, channel: PrivateChannel) -> Connection {
        Connection {
            id,
            name: name.to_string(),
            address,
            channel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn channel(&self) -> &PrivateChannel {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut PrivateChannel {
        &mut self.channel
    }

    pub fn set_parms(&mut self, id: ConnectionId, name: &str) {
        self.id = id;
        self.name = name.to_string();
    }

    pub fn send(&mut self, payload: &[u8], ack_required: bool) -> anyhow::Result<()> {
        let address = self.address;
        self.channel.send_packet(payload, ack_required, address)
    }
}
