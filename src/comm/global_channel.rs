use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::comm::address::{Address, Destination};
use crate::comm::channel::ChannelCore;
use crate::comm::comm_queue::ReceiveEntry;
use crate::comm::packet_header::{GlobalHeader, Packet, PacketCode, PacketHeader, GLOBAL_MAGIC_NUMBER};
use crate::comm::timing::{Ticks, Timing};
use crate::transport::PacketTransport;

/// number of recently received (sender, packet id) pairs remembered for resend detection
const RECENT_HISTORY_LEN: usize = 4;

/// A message received on the global channel
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GlobalMessage {
    pub payload: Bytes,
    pub sender: Address,
    pub product_id: u16,
}

/// The one broadcast-capable channel per manager, used for discovery style traffic. It is
///  tagged with a reserved magic number, and every packet carries the sending product's id.
pub struct GlobalChannel {
    core: ChannelCore,
    product_id: u16,
    recent: VecDeque<(Address, u32)>,
}

impl GlobalChannel {
    pub fn new(product_id: u16, max_payload_len: usize, queue_depth: usize, timing: Timing) -> GlobalChannel {
        GlobalChannel {
            core: ChannelCore::new(GLOBAL_MAGIC_NUMBER, max_payload_len, queue_depth, timing),
            product_id,
            recent: VecDeque::with_capacity(RECENT_HISTORY_LEN),
        }
    }

    pub fn core(&self) -> &ChannelCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ChannelCore {
        &mut self.core
    }

    /// Broadcasts are never acknowledged, so `ack_required` only applies to a specific peer
    pub fn send_packet(&mut self, payload: &[u8], ack_required: bool, to: Destination) -> anyhow::Result<()> {
        self.core.check_payload(payload)?;

        let ack_required = ack_required && to != Destination::Broadcast;
        let code = if ack_required { PacketCode::DataAck } else { PacketCode::DataNoAck };
        let packet_id = self.core.next_packet_id(ack_required);

        let mut buf = Vec::with_capacity(GlobalHeader::SERIALIZED_LEN + payload.len());
        self.header(code, packet_id).ser(&mut buf);
        buf.extend_from_slice(payload);

        trace!("queueing global {} #{} for {:?}", code, packet_id, to);
        self.core.queue_packet(buf, GlobalHeader::SERIALIZED_LEN, packet_id, to, ack_required)
    }

    /// Handles an inbound packet after its common header was decoded; `body` starts with the
    ///  global header extension. Returns `Ok(false)` if a new data packet had to be discarded
    ///  because the receive ring was full, and an error if the packet is malformed.
    pub fn receive_packet(&mut self, header: &PacketHeader, body: &[u8], sender: Address, now: Ticks, transport: &mut dyn PacketTransport) -> anyhow::Result<bool> {
        let mut body = body;
        let global_header = GlobalHeader::try_deser_extension(*header, &mut body)?;

        let result = match Packet::new(header, body) {
            Packet::Ack { id } => {
                self.core.queue_mut().on_ack(id, now);
                true
            }
            Packet::Data { ack_required: false, id, body } => {
                if self.core.queue().is_in_receive_ring(PacketCode::DataNoAck, id, &sender) {
                    trace!("duplicate global {} #{} from {:?} - dropping", PacketCode::DataNoAck, id, sender);
                    return Ok(true);
                }
                self.queue_data(PacketCode::DataNoAck, id, body, sender, global_header.product_id)
            }
            Packet::Data { ack_required: true, id, body } => {
                if self.is_resend(id, &sender) {
                    trace!("global resend #{} from {:?} - re-acknowledging", id, sender);
                    self.send_ack(id, sender, transport);
                    return Ok(true);
                }

                if !self.queue_data(PacketCode::DataAck, id, body, sender, global_header.product_id) {
                    return Ok(false);
                }
                self.remember(id, sender);
                self.send_ack(id, sender, transport);
                true
            }
        };

        if !result {
            debug!("global receive queue full - discarding packet from {:?}", sender);
        }
        Ok(result)
    }

    pub fn get_packet(&mut self) -> Option<GlobalMessage> {
        self.core.queue_mut().unqueue_receive()
            .map(|e| GlobalMessage {
                payload: e.payload,
                sender: e.sender,
                product_id: e.product_id,
            })
    }

    pub fn service(&mut self, now: Ticks, transport: &mut dyn PacketTransport) -> Vec<u32> {
        self.core.service(now, transport)
    }

    fn header(&self, code: PacketCode, packet_id: u32) -> GlobalHeader {
        GlobalHeader {
            header: PacketHeader {
                magic_number: self.core.magic_number(),
                code,
                packet_id,
            },
            product_id: self.product_id,
        }
    }

    fn queue_data(&mut self, code: PacketCode, packet_id: u32, body: &[u8], sender: Address, product_id: u16) -> bool {
        self.core.queue_mut().queue_receive(ReceiveEntry {
            payload: Bytes::copy_from_slice(body),
            sender,
            packet_id,
            code,
            product_id,
        })
    }

    fn is_resend(&self, packet_id: u32, sender: &Address) -> bool {
        self.recent.iter().any(|(addr, id)| *id == packet_id && addr == sender)
            || self.core.queue().is_in_receive_ring(PacketCode::DataAck, packet_id, sender)
    }

    fn remember(&mut self, packet_id: u32, sender: Address) {
        if self.recent.len() == RECENT_HISTORY_LEN {
            self.recent.pop_front();
        }
        self.recent.push_back((sender, packet_id));
    }

    fn send_ack(&self, packet_id: u32, to: Address, transport: &mut dyn PacketTransport) {
        let mut buf = Vec::with_capacity(GlobalHeader::SERIALIZED_LEN);
        self.header(PacketCode::Ack, packet_id).ser(&mut buf);
        if !transport.send(&Destination::Peer(to), &buf) {
            trace!("transport did not accept global ack for #{}", packet_id);
        }
    }
}
