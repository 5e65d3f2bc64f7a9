use anyhow::bail;
use bytes::Bytes;

use crate::comm::address::Destination;
use crate::comm::comm_queue::{CommQueue, SendEntry};
use crate::comm::timing::{Ticks, Timing};
use crate::transport::PacketTransport;

/// State and behavior shared by the global channel and the private channels: a queue, the magic
///  number tagging all of the channel's packets, timing parameters and packet id generation.
pub struct ChannelCore {
    magic_number: u16,
    max_payload_len: usize,
    queue: CommQueue,
    timing: Timing,
    next_ack_id: u32,
    next_no_ack_id: u32,
}

impl ChannelCore {
    pub fn new(magic_number: u16, max_payload_len: usize, queue_depth: usize, timing: Timing) -> ChannelCore {
        ChannelCore {
            magic_number,
            max_payload_len,
            queue: CommQueue::new(queue_depth, queue_depth),
            timing,
            next_ack_id: 0,
            next_no_ack_id: 0,
        }
    }

    pub fn magic_number(&self) -> u16 {
        self.magic_number
    }

    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn set_timing(&mut self, timing: Timing) {
        self.timing = timing;
    }

    pub fn queue(&self) -> &CommQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut CommQueue {
        &mut self.queue
    }

    pub fn check_payload(&self, payload: &[u8]) -> anyhow::Result<()> {
        if payload.len() > self.max_payload_len {
            bail!("payload of {} bytes exceeds the channel's maximum of {}", payload.len(), self.max_payload_len);
        }
        Ok(())
    }

    /// Ack-required and no-ack packets are numbered independently, wrapping at 2^32
    pub fn next_packet_id(&mut self, ack_required: bool) -> u32 {
        let counter = if ack_required { &mut self.next_ack_id } else { &mut self.next_no_ack_id };
        let result = *counter;
        *counter = counter.wrapping_add(1);
        result
    }

    /// Queues a fully encoded packet for transmission by the next `service` call
    pub fn queue_packet(&mut self, packet: Vec<u8>, payload_offset: usize, packet_id: u32, destination: Destination, ack_required: bool) -> anyhow::Result<()> {
        let entry = SendEntry::new(Bytes::from(packet), payload_offset, packet_id, destination, ack_required);
        if !self.queue.queue_send(entry) {
            bail!("send queue is full");
        }
        Ok(())
    }

    pub fn service(&mut self, now: Ticks, transport: &mut dyn PacketTransport) -> Vec<u32> {
        self.queue.service_send(&self.timing, now, transport)
    }
}
