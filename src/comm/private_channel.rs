use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::comm::address::{Address, Destination};
use crate::comm::channel::ChannelCore;
use crate::comm::comm_queue::ReceiveEntry;
use crate::comm::packet_header::{ack_packet, Packet, PacketCode, PacketHeader};
use crate::comm::timing::{Ticks, Timing};
use crate::transport::PacketTransport;

/// Point-to-point channel to a single peer, tagged with the product id as its magic number.
///
/// Ack-required packets are tracked with a watermark: every id up to and including
///  `highest_contiguous_id` was received, and `received_above_watermark` holds the ids beyond
///  it that arrived out of order. This recognizes retransmissions of packets the application
///  already dequeued.
pub struct PrivateChannel {
    core: ChannelCore,
    highest_contiguous_id: Option<u32>,
    received_above_watermark: BTreeSet<u32>,
}

impl PrivateChannel {
    pub fn new(product_id: u16, max_payload_len: usize, queue_depth: usize, timing: Timing) -> PrivateChannel {
        PrivateChannel {
            core: ChannelCore::new(product_id, max_payload_len, queue_depth, timing),
            highest_contiguous_id: None,
            received_above_watermark: BTreeSet::new(),
        }
    }

    pub fn core(&self) -> &ChannelCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ChannelCore {
        &mut self.core
    }

    pub fn send_packet(&mut self, payload: &[u8], ack_required: bool, to: Address) -> anyhow::Result<()> {
        self.core.check_payload(payload)?;

        let code = if ack_required { PacketCode::DataAck } else { PacketCode::DataNoAck };
        let packet_id = self.core.next_packet_id(ack_required);

        let mut buf = Vec::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
        PacketHeader {
            magic_number: self.core.magic_number(),
            code,
            packet_id,
        }.ser(&mut buf);
        buf.extend_from_slice(payload);

        trace!("queueing {} #{} for {:?}", code, packet_id, to);
        self.core.queue_packet(buf, PacketHeader::SERIALIZED_LEN, packet_id, Destination::Peer(to), ack_required)
    }

    /// Handles an inbound packet that was routed to this channel. Returns `false` if a new data
    ///  packet had to be discarded because the receive ring had no room for it.
    pub fn receive_packet(&mut self, header: &PacketHeader, body: &[u8], sender: Address, now: Ticks, transport: &mut dyn PacketTransport) -> bool {
        match Packet::new(header, body) {
            Packet::Ack { id } => {
                self.core.queue_mut().on_ack(id, now);
                true
            }
            Packet::Data { ack_required: false, id, body } => {
                if self.core.queue().is_in_receive_ring(PacketCode::DataNoAck, id, &sender) {
                    trace!("duplicate {} #{} from {:?} - dropping", PacketCode::DataNoAck, id, sender);
                    return true;
                }
                // the last slot is reserved for ack-required data
                if self.core.queue().free_receive_slots() <= 1 {
                    debug!("no room for {} #{} from {:?}", PacketCode::DataNoAck, id, sender);
                    return false;
                }
                self.queue_data(PacketCode::DataNoAck, id, body, sender)
            }
            Packet::Data { ack_required: true, id, body } => {
                if self.is_duplicate(id, &sender) {
                    trace!("duplicate {} #{} from {:?} - re-acknowledging", PacketCode::DataAck, id, sender);
                    self.send_ack(id, sender, transport);
                    return true;
                }

                if !self.queue_data(PacketCode::DataAck, id, body, sender) {
                    // no ack, so the peer will retry
                    return false;
                }
                self.register_received(id);
                self.send_ack(id, sender, transport);
                true
            }
        }
    }

    pub fn get_packet(&mut self) -> Option<ReceiveEntry> {
        self.core.queue_mut().unqueue_receive()
    }

    pub fn service(&mut self, now: Ticks, transport: &mut dyn PacketTransport) -> Vec<u32> {
        self.core.service(now, transport)
    }

    fn queue_data(&mut self, code: PacketCode, packet_id: u32, body: &[u8], sender: Address) -> bool {
        let entry = ReceiveEntry {
            payload: bytes::Bytes::copy_from_slice(body),
            sender,
            packet_id,
            code,
            product_id: self.core.magic_number(),
        };
        self.core.queue_mut().queue_receive(entry)
    }

    fn is_duplicate(&self, packet_id: u32, sender: &Address) -> bool {
        if let Some(watermark) = self.highest_contiguous_id {
            if packet_id <= watermark {
                return true;
            }
        }
        self.received_above_watermark.contains(&packet_id)
            || self.core.queue().is_in_receive_ring(PacketCode::DataAck, packet_id, sender)
    }

    fn register_received(&mut self, packet_id: u32) {
        let next_expected = match self.highest_contiguous_id {
            None => 0,
            Some(id) => id.wrapping_add(1),
        };
        if packet_id != next_expected {
            self.received_above_watermark.insert(packet_id);
            return;
        }

        let mut watermark = packet_id;
        while self.received_above_watermark.remove(&watermark.wrapping_add(1)) {
            watermark = watermark.wrapping_add(1);
        }
        self.highest_contiguous_id = Some(watermark);
    }

    fn send_ack(&self, packet_id: u32, to: Address, transport: &mut dyn PacketTransport) {
        let ack = ack_packet(self.core.magic_number(), packet_id);
        if !transport.send(&Destination::Peer(to), &ack) {
            trace!("transport did not accept ack for #{}", packet_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use rstest::rstest;
    use crate::transport::MockPacketTransport;

    const PRODUCT_ID: u16 = 0xaa01;

    fn peer() -> Address {
        Address::Ipx { network: [0; 4], node: [1, 2, 3, 4, 5, 6] }
    }

    fn data_header(ack_required: bool, packet_id: u32) -> PacketHeader {
        PacketHeader {
            magic_number: PRODUCT_ID,
            code: if ack_required { PacketCode::DataAck } else { PacketCode::DataNoAck },
            packet_id,
        }
    }

    fn acking_transport(expected_acks: Vec<u32>) -> MockPacketTransport {
        let mut transport = MockPacketTransport::new();
        for id in expected_acks {
            transport.expect_send()
                .with(eq(Destination::Peer(peer())), eq(ack_packet(PRODUCT_ID, id)))
                .once()
                .return_const(true);
        }
        transport
    }

    #[test]
    fn test_send_packet_encodes_header() {
        let mut channel = PrivateChannel::new(PRODUCT_ID, 16, 4, Timing::default());
        channel.send_packet(b"abc", true, peer()).unwrap();
        channel.send_packet(b"d", false, peer()).unwrap();
        channel.send_packet(b"e", true, peer()).unwrap();

        let entries = channel.core().queue().send_entries().collect::<Vec<_>>();
        assert_eq!(entries[0].packet.as_ref(), &[0xaa, 0x01, 0, 0, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(entries[1].packet.as_ref(), &[0xaa, 0x01, 1, 0, 0, 0, 0, b'd']);
        assert_eq!(entries[2].packet.as_ref(), &[0xaa, 0x01, 0, 0, 0, 0, 1, b'e']);
        assert_eq!(entries[2].payload().as_ref(), b"e");
    }

    #[test]
    fn test_send_packet_too_long() {
        let mut channel = PrivateChannel::new(PRODUCT_ID, 2, 4, Timing::default());
        assert!(channel.send_packet(b"abc", true, peer()).is_err());
        assert_eq!(channel.core().queue().num_send(), 0);
    }

    #[test]
    fn test_duplicate_is_queued_once_and_acked_twice() {
        let mut channel = PrivateChannel::new(PRODUCT_ID, 16, 4, Timing::default());
        let mut transport = acking_transport(vec![]);
        transport.expect_send()
            .with(eq(Destination::Peer(peer())), eq(ack_packet(PRODUCT_ID, 0)))
            .times(2)
            .return_const(true);

        assert!(channel.receive_packet(&data_header(true, 0), b"x", peer(), 0, &mut transport));
        assert!(channel.receive_packet(&data_header(true, 0), b"x", peer(), 1, &mut transport));

        assert_eq!(channel.get_packet().map(|e| e.payload), Some(bytes::Bytes::from_static(b"x")));
        assert!(channel.get_packet().is_none());
    }

    #[test]
    fn test_duplicate_after_dequeue_is_recognized() {
        let mut channel = PrivateChannel::new(PRODUCT_ID, 16, 4, Timing::default());
        let mut transport = MockPacketTransport::new();
        transport.expect_send().return_const(true);

        for id in [0, 2, 1] {
            assert!(channel.receive_packet(&data_header(true, id), b"x", peer(), 0, &mut transport));
        }
        for _ in 0..3 {
            assert!(channel.get_packet().is_some());
        }
        assert_eq!(channel.highest_contiguous_id, Some(2));
        assert!(channel.received_above_watermark.is_empty());

        for id in [0, 1, 2] {
            assert!(channel.receive_packet(&data_header(true, id), b"x", peer(), 0, &mut transport));
        }
        assert!(channel.get_packet().is_none());
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2], Some(2), vec![])]
    #[case::gap(vec![0, 2, 3], Some(0), vec![2, 3])]
    #[case::gap_filled(vec![1, 3, 0, 2], Some(3), vec![])]
    #[case::nothing_contiguous(vec![1], None, vec![1])]
    fn test_watermark(#[case] ids: Vec<u32>, #[case] expected_watermark: Option<u32>, #[case] expected_above: Vec<u32>) {
        let mut channel = PrivateChannel::new(PRODUCT_ID, 16, 8, Timing::default());
        for id in ids {
            channel.register_received(id);
        }
        assert_eq!(channel.highest_contiguous_id, expected_watermark);
        assert_eq!(channel.received_above_watermark.iter().cloned().collect::<Vec<_>>(), expected_above);
    }

    #[test]
    fn test_full_ring_is_not_acked() {
        let mut channel = PrivateChannel::new(PRODUCT_ID, 16, 2, Timing::default());
        let mut transport = acking_transport(vec![0, 1]);

        assert!(channel.receive_packet(&data_header(true, 0), b"a", peer(), 0, &mut transport));
        assert!(channel.receive_packet(&data_header(true, 1), b"b", peer(), 0, &mut transport));
        assert!(!channel.receive_packet(&data_header(true, 2), b"c", peer(), 0, &mut transport));

        // the retransmission is accepted once there is room again
        channel.get_packet();
        let mut transport = acking_transport(vec![2]);
        assert!(channel.receive_packet(&data_header(true, 2), b"c", peer(), 1, &mut transport));
    }

    #[test]
    fn test_no_ack_keeps_last_slot_free() {
        let mut channel = PrivateChannel::new(PRODUCT_ID, 16, 2, Timing::default());
        let mut transport = acking_transport(vec![0]);

        assert!(channel.receive_packet(&data_header(false, 0), b"a", peer(), 0, &mut transport));
        assert!(!channel.receive_packet(&data_header(false, 1), b"b", peer(), 0, &mut transport));
        assert!(channel.receive_packet(&data_header(true, 0), b"c", peer(), 0, &mut transport));
    }

    #[test]
    fn test_no_ack_data_is_not_acked() {
        let mut channel = PrivateChannel::new(PRODUCT_ID, 16, 4, Timing::default());
        let mut transport = MockPacketTransport::new();
        transport.expect_send().never();

        assert!(channel.receive_packet(&data_header(false, 0), b"a", peer(), 0, &mut transport));
        let entry = channel.get_packet().unwrap();
        assert_eq!(entry.code, PacketCode::DataNoAck);
        assert_eq!(entry.sender, peer());
        assert_eq!(entry.product_id, PRODUCT_ID);
    }

    #[test]
    fn test_ack_is_idempotent() {
        let mut channel = PrivateChannel::new(PRODUCT_ID, 16, 4, Timing::default());
        let mut transport = MockPacketTransport::new();
        transport.expect_send().once().return_const(true);

        channel.send_packet(b"x", true, peer()).unwrap();
        assert!(channel.service(0, &mut transport).is_empty());

        let ack = PacketHeader { magic_number: PRODUCT_ID, code: PacketCode::Ack, packet_id: 0 };
        assert!(channel.receive_packet(&ack, &[], peer(), 3, &mut transport));
        assert!(channel.receive_packet(&ack, &[], peer(), 4, &mut transport));
        assert_eq!(channel.core().queue().num_send(), 0);
        assert_eq!(channel.core().queue().response_time().mean(), 3);
        assert_eq!(channel.core().queue().response_time().num_samples(), 1);
    }
}
