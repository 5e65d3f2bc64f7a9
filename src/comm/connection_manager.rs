use anyhow::bail;
use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::comm::address::{Address, Destination};
use crate::comm::connection::{Connection, ConnectionId, ConnectionTarget, CONNECTION_NONE};
use crate::comm::global_channel::{GlobalChannel, GlobalMessage};
use crate::comm::manager_config::ManagerConfig;
use crate::comm::packet_header::{PacketHeader, GLOBAL_MAGIC_NUMBER};
use crate::comm::private_channel::PrivateChannel;
use crate::comm::timing::{TickClock, Ticks, Timing};
use crate::transport::{InboundPacket, PacketTransport};
use crate::util::buf_ext::BufExt;

/// A message received on a private channel
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrivateMessage {
    pub connection_id: ConnectionId,
    pub payload: Bytes,
}

/// Owns the global channel and a bounded set of connections, multiplexing them over a single
///  transport.
///
/// The manager is driven by the application's main loop: `service()` should be called once per
///  iteration. It drains everything the transport has staged, routes each packet to its channel,
///  and then (re-)transmits whatever is due. None of the operations block.
///
/// The manager is not operational before `init()` succeeded: sending fails, receiving returns
///  nothing, and `service()` returns `false`.
pub struct ConnectionManager {
    config: ManagerConfig,
    transport: Box<dyn PacketTransport>,
    clock: TickClock,
    timing: Timing,

    global_channel: Option<GlobalChannel>,
    connections: Vec<Connection>,
    /// index of the connection `get_private_message` looks at first
    cur_connection: usize,

    bad_connection: Option<ConnectionId>,
    send_overflows: u64,
    receive_overflows: u64,
    foreign_packets: u64,
    malformed_packets: u64,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig, transport: Box<dyn PacketTransport>) -> anyhow::Result<ConnectionManager> {
        config.validate()?;

        Ok(ConnectionManager {
            timing: config.timing,
            connections: Vec::with_capacity(config.max_connections),
            config,
            transport,
            clock: TickClock::new(),
            global_channel: None,
            cur_connection: 0,
            bad_connection: None,
            send_overflows: 0,
            receive_overflows: 0,
            foreign_packets: 0,
            malformed_packets: 0,
        })
    }

    /// (Re-)initializes the manager: discards the global channel and all connections, re-opens
    ///  the transport and starts listening with a fresh global channel. This can be called
    ///  again after both successful and failed calls.
    pub fn init(&mut self) -> anyhow::Result<()> {
        if self.global_channel.take().is_some() {
            debug!("re-initializing - closing transport");
            self.transport.close();
        }
        self.connections.clear();
        self.cur_connection = 0;
        self.bad_connection = None;

        if !self.transport.is_available() {
            bail!("transport is not available");
        }
        self.transport.open(self.config.socket)?;

        self.global_channel = Some(GlobalChannel::new(
            self.config.product_id,
            self.config.global_max_packet_len,
            self.config.global_queue_depth,
            self.timing,
        ));
        info!("listening on socket {:#06x} with product id {:#06x}", self.config.socket, self.config.product_id);
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.global_channel.is_some()
    }

    pub fn is_available(&self) -> bool {
        self.transport.is_available()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Applies new timing to the global channel and all connections, including connections
    ///  created later
    pub fn set_timing(&mut self, timing: Timing) {
        debug!("timing changed to {:?}", timing);
        self.timing = timing;
        if let Some(global) = self.global_channel.as_mut() {
            global.core_mut().set_timing(timing);
        }
        for conn in self.connections.iter_mut() {
            conn.channel_mut().core_mut().set_timing(timing);
        }
    }

    pub fn create_connection(&mut self, id: ConnectionId, name: &str, address: Address) -> anyhow::Result<()> {
        if id == CONNECTION_NONE {
            bail!("connection id {} is reserved", CONNECTION_NONE);
        }
        if !self.transport.is_available() {
            bail!("transport is not available");
        }
        if self.connections.len() >= self.config.max_connections {
            bail!("connection table is full ({} connections)", self.connections.len());
        }
        if self.connection_index(id).is_some() {
            bail!("connection id {} is already in use", id);
        }

        let channel = PrivateChannel::new(
            self.config.product_id,
            self.config.private_max_packet_len,
            self.config.private_queue_depth,
            self.timing,
        );
        self.connections.push(Connection::new(id, name, address, channel));
        debug!("created connection {} '{}' to {:?}", id, name, address);
        Ok(())
    }

    /// Removes a connection, forgetting all of its pending traffic. Remaining connections keep
    ///  their relative order.
    pub fn delete_connection(&mut self, id: ConnectionId) -> anyhow::Result<()> {
        let Some(idx) = self.connection_index(id) else {
            bail!("no connection with id {}", id);
        };
        let conn = self.connections.remove(idx);
        if conn.channel().core().queue().num_send() > 0 {
            debug!("deleting connection {} with {} unsent / unacknowledged packets", id, conn.channel().core().queue().num_send());
        }

        if self.cur_connection >= self.connections.len() {
            self.cur_connection = 0;
        }
        debug!("deleted connection {}", id);
        Ok(())
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_id(&self, index: usize) -> Option<ConnectionId> {
        self.connections.get(index)
            .map(|c| c.id())
    }

    pub fn connection_index(&self, id: ConnectionId) -> Option<usize> {
        self.connections.iter()
            .position(|c| c.id() == id)
    }

    pub fn connection_name(&self, id: ConnectionId) -> Option<&str> {
        self.connection(id)
            .map(|c| c.name())
    }

    pub fn connection_address(&self, id: ConnectionId) -> Option<&Address> {
        self.connection(id)
            .map(|c| c.address())
    }

    /// Changes the id and name of the connection at a given index, e.g. after the peers agreed
    ///  on player numbers
    pub fn set_connection_parms(&mut self, index: usize, id: ConnectionId, name: &str) -> anyhow::Result<()> {
        if id == CONNECTION_NONE {
            bail!("connection id {} is reserved", CONNECTION_NONE);
        }
        if self.connection_index(id).is_some_and(|i| i != index) {
            bail!("connection id {} is already in use", id);
        }
        let Some(conn) = self.connections.get_mut(index) else {
            bail!("no connection at index {}", index);
        };
        conn.set_parms(id, name);
        Ok(())
    }

    fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter()
            .find(|c| c.id() == id)
    }

    pub fn send_global_message(&mut self, payload: &[u8], ack_required: bool, to: Destination) -> anyhow::Result<()> {
        let Some(global) = self.global_channel.as_mut() else {
            bail!("not initialized");
        };
        global.core().check_payload(payload)?;

        if !global.core().queue().has_send_room() {
            self.send_overflows += 1;
            warn!("global send queue overflow");
            bail!("global send queue is full");
        }
        global.send_packet(payload, ack_required, to)
    }

    pub fn get_global_message(&mut self) -> Option<GlobalMessage> {
        self.global_channel.as_mut()?
            .get_packet()
    }

    /// Sends to a single connection or to all of them. Sending to all connections either queues
    ///  the message for every connection, or - if any of them has no room - for none of them.
    pub fn send_private_message(&mut self, payload: &[u8], ack_required: bool, target: ConnectionTarget) -> anyhow::Result<()> {
        if self.global_channel.is_none() {
            bail!("not initialized");
        }

        match target {
            ConnectionTarget::Id(id) => {
                let Some(conn) = self.connections.iter_mut().find(|c| c.id() == id) else {
                    bail!("no connection with id {}", id);
                };
                conn.channel().core().check_payload(payload)?;

                if !conn.channel().core().queue().has_send_room() {
                    self.send_overflows += 1;
                    warn!("send queue overflow for connection {}", id);
                    bail!("send queue of connection {} is full", id);
                }
                conn.send(payload, ack_required)
            }
            ConnectionTarget::All => {
                if self.connections.is_empty() {
                    bail!("no connections");
                }
                for conn in &self.connections {
                    conn.channel().core().check_payload(payload)?;
                }
                if let Some(full) = self.connections.iter().find(|c| !c.channel().core().queue().has_send_room()) {
                    warn!("send queue overflow for connection {} - not sending to any connection", full.id());
                    self.send_overflows += 1;
                    bail!("send queue of connection {} is full", full.id());
                }

                for conn in self.connections.iter_mut() {
                    conn.send(payload, ack_required)?;
                }
                Ok(())
            }
        }
    }

    /// Returns the next pending message of any connection. Connections are visited round-robin,
    ///  starting after the connection that delivered the previous message, so that a busy
    ///  connection cannot starve the others.
    pub fn get_private_message(&mut self) -> Option<PrivateMessage> {
        if self.global_channel.is_none() || self.connections.is_empty() {
            return None;
        }

        let n = self.connections.len();
        if self.cur_connection >= n {
            self.cur_connection = 0;
        }

        for offset in 0..n {
            let idx = (self.cur_connection + offset) % n;
            let conn = &mut self.connections[idx];
            if let Some(entry) = conn.channel_mut().get_packet() {
                self.cur_connection = (idx + 1) % n;
                return Some(PrivateMessage {
                    connection_id: conn.id(),
                    payload: entry.payload,
                });
            }
        }
        None
    }

    /// Receives everything the transport has staged, then transmits and retransmits pending
    ///  packets on all channels.
    ///
    /// Returns `false` if any channel has a packet that stayed unacknowledged for too long. That
    ///  packet is discarded, and for a private channel, the connection is reported by
    ///  `bad_connection()` until the next call. The connection itself stays in place: deciding
    ///  what to do about it is up to the application.
    pub fn service(&mut self) -> bool {
        if self.global_channel.is_none() {
            warn!("service called before successful initialization");
            return false;
        }

        let now = self.clock.now();
        self.bad_connection = None;

        while let Some(packet) = self.transport.poll_inbound() {
            self.on_inbound(packet, now);
        }

        let mut result = true;
        let transport = self.transport.as_mut();

        if let Some(global) = self.global_channel.as_mut() {
            for packet_id in global.service(now, transport) {
                warn!("global packet #{} failed - discarding it", packet_id);
                global.core_mut().queue_mut().unqueue_send(packet_id);
                result = false;
            }
        }

        for conn in self.connections.iter_mut() {
            let failed = conn.channel_mut().service(now, transport);
            if failed.is_empty() {
                continue;
            }
            for packet_id in failed {
                conn.channel_mut().core_mut().queue_mut().unqueue_send(packet_id);
            }
            warn!("connection {} '{}' is not responding", conn.id(), conn.name());
            self.bad_connection = Some(conn.id());
            result = false;
        }

        result
    }

    fn on_inbound(&mut self, packet: InboundPacket, now: Ticks) {
        let mut buf = packet.payload.as_ref();

        let mut magic_buf = buf;
        match magic_buf.get_checked_u16() {
            Ok(magic) if magic == GLOBAL_MAGIC_NUMBER || magic == self.config.product_id => {}
            Ok(magic) => {
                trace!("ignoring foreign packet with magic number {:#06x} from {:?}", magic, packet.sender);
                self.foreign_packets += 1;
                return;
            }
            Err(_) => {
                warn!("ignoring runt packet of {} bytes from {:?}", buf.len(), packet.sender);
                self.malformed_packets += 1;
                return;
            }
        }

        let header = match PacketHeader::try_deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("ignoring malformed packet from {:?}: {}", packet.sender, e);
                self.malformed_packets += 1;
                return;
            }
        };
        trace!("received {} #{} from {:?}", header.code, header.packet_id, packet.sender);

        let transport = self.transport.as_mut();

        let accepted = if header.magic_number == GLOBAL_MAGIC_NUMBER {
            let Some(global) = self.global_channel.as_mut() else {
                return;
            };
            match global.receive_packet(&header, buf, packet.sender, now, transport) {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("ignoring malformed global packet from {:?}: {}", packet.sender, e);
                    self.malformed_packets += 1;
                    return;
                }
            }
        }
        else {
            let Some(conn) = self.connections.iter_mut().find(|c| c.address() == &packet.sender) else {
                trace!("ignoring private packet from {:?}: no connection for this address", packet.sender);
                self.foreign_packets += 1;
                return;
            };
            conn.channel_mut().receive_packet(&header, buf, packet.sender, now, transport)
        };

        if !accepted {
            warn!("receive queue overflow - discarding packet from {:?}", packet.sender);
            self.receive_overflows += 1;
        }
    }

    /// The connection that failed during the most recent `service()` call, if any
    pub fn bad_connection(&self) -> Option<ConnectionId> {
        self.bad_connection
    }

    pub fn send_overflows(&self) -> u64 {
        self.send_overflows
    }

    pub fn receive_overflows(&self) -> u64 {
        self.receive_overflows
    }

    /// number of packets ignored because they belong to a different product or to a peer
    ///  without a connection
    pub fn foreign_packets(&self) -> u64 {
        self.foreign_packets
    }

    pub fn malformed_packets(&self) -> u64 {
        self.malformed_packets
    }

    /// number of entries in the global channel's send ring
    pub fn global_num_send(&self) -> usize {
        self.global_channel.as_ref()
            .map(|g| g.core().queue().num_send())
            .unwrap_or(0)
    }

    /// number of entries in the global channel's receive ring
    pub fn global_num_receive(&self) -> usize {
        self.global_channel.as_ref()
            .map(|g| g.core().queue().num_receive())
            .unwrap_or(0)
    }

    /// number of entries in a connection's send ring, or the maximum over all connections
    pub fn private_num_send(&self, target: ConnectionTarget) -> usize {
        self.private_queue_stat(target, |c| c.channel().core().queue().num_send())
    }

    /// number of entries in a connection's receive ring, or the maximum over all connections
    pub fn private_num_receive(&self, target: ConnectionTarget) -> usize {
        self.private_queue_stat(target, |c| c.channel().core().queue().num_receive())
    }

    fn private_queue_stat(&self, target: ConnectionTarget, f: impl Fn(&Connection) -> usize) -> usize {
        match target {
            ConnectionTarget::All => self.connections.iter().map(f).max().unwrap_or(0),
            ConnectionTarget::Id(id) => self.connection(id).map(f).unwrap_or(0),
        }
    }

    /// The worst average ack latency over all connections, in ticks
    pub fn response_time(&self) -> Ticks {
        self.connections.iter()
            .map(|c| c.channel().core().queue().response_time().mean())
            .max()
            .unwrap_or(0)
    }

    pub fn global_response_time(&self) -> Ticks {
        self.global_channel.as_ref()
            .map(|g| g.core().queue().response_time().mean())
            .unwrap_or(0)
    }

    pub fn reset_response_time(&mut self) {
        if let Some(global) = self.global_channel.as_mut() {
            global.core_mut().queue_mut().reset_response_time();
        }
        for conn in self.connections.iter_mut() {
            conn.channel_mut().core_mut().queue_mut().reset_response_time();
        }
    }

    /// The payload of the oldest packet that is still waiting for an ack on any connection.
    ///  Packets that were not transmitted yet count as newer than all transmitted ones.
    pub fn oldest_send(&self) -> Option<Bytes> {
        self.connections.iter()
            .filter_map(|c| c.channel().core().queue().oldest_pending_ack())
            .min_by_key(|e| e.first_sent_at.unwrap_or(Ticks::MAX))
            .map(|e| e.payload())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.global_channel.is_some() {
            self.transport.close();
        }
    }
}
