use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{trace, warn};

use crate::comm::address::{Address, Destination};
use crate::comm::packet_header::PacketCode;
use crate::comm::response_time::ResponseTimeStats;
use crate::comm::timing::{Ticks, Timing};
use crate::transport::PacketTransport;

/// An outbound packet waiting for its (first) transmission or for an ack
#[derive(Debug, Clone)]
pub struct SendEntry {
    /// complete wire packet including the channel's header
    pub packet: Bytes,
    /// offset of the application payload inside `packet`
    pub payload_offset: usize,
    pub packet_id: u32,
    pub destination: Destination,
    pub is_ack_required: bool,
    pub is_acked: bool,
    pub first_sent_at: Option<Ticks>,
    pub last_sent_at: Option<Ticks>,
    /// number of transmissions after the first one
    pub retry_count: u32,
}

impl SendEntry {
    pub fn new(packet: Bytes, payload_offset: usize, packet_id: u32, destination: Destination, is_ack_required: bool) -> SendEntry {
        SendEntry {
            packet,
            payload_offset,
            packet_id,
            destination,
            is_ack_required,
            is_acked: false,
            first_sent_at: None,
            last_sent_at: None,
            retry_count: 0,
        }
    }

    pub fn payload(&self) -> Bytes {
        self.packet.slice(self.payload_offset..)
    }

    fn is_pending_ack(&self) -> bool {
        self.is_ack_required && !self.is_acked
    }
}

/// An inbound data packet waiting for the application to pick it up
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceiveEntry {
    pub payload: Bytes,
    pub sender: Address,
    pub packet_id: u32,
    pub code: PacketCode,
    /// product that sent the packet - for private channels this is the channel's magic number
    pub product_id: u16,
}


/// Bounded send and receive rings of a single channel, together with the retry / timeout
///  bookkeeping for outbound packets and ack latency statistics.
///
/// Capacity violations are reported to the caller, never resolved by silently dropping an
///  entry that is already queued.
pub struct CommQueue {
    max_send: usize,
    max_receive: usize,
    send: VecDeque<SendEntry>,
    receive: VecDeque<ReceiveEntry>,
    send_total: u64,
    receive_total: u64,
    response_time: ResponseTimeStats,
}

impl CommQueue {
    pub fn new(max_send: usize, max_receive: usize) -> CommQueue {
        CommQueue {
            max_send,
            max_receive,
            send: VecDeque::with_capacity(max_send),
            receive: VecDeque::with_capacity(max_receive),
            send_total: 0,
            receive_total: 0,
            response_time: ResponseTimeStats::default(),
        }
    }

    pub fn max_send(&self) -> usize {
        self.max_send
    }

    pub fn max_receive(&self) -> usize {
        self.max_receive
    }

    pub fn num_send(&self) -> usize {
        self.send.len()
    }

    pub fn num_receive(&self) -> usize {
        self.receive.len()
    }

    pub fn has_send_room(&self) -> bool {
        self.send.len() < self.max_send
    }

    pub fn free_receive_slots(&self) -> usize {
        self.max_receive - self.receive.len()
    }

    /// total number of packets ever queued for sending
    pub fn send_total(&self) -> u64 {
        self.send_total
    }

    /// total number of packets ever accepted into the receive ring
    pub fn receive_total(&self) -> u64 {
        self.receive_total
    }

    pub fn response_time(&self) -> &ResponseTimeStats {
        &self.response_time
    }

    pub fn reset_response_time(&mut self) {
        self.response_time.reset();
    }

    pub fn send_entries(&self) -> impl Iterator<Item = &SendEntry> {
        self.send.iter()
    }

    /// Returns `false` without queueing the entry if the send ring is full
    #[must_use]
    pub fn queue_send(&mut self, entry: SendEntry) -> bool {
        if !self.has_send_room() {
            return false;
        }
        self.send.push_back(entry);
        self.send_total += 1;
        true
    }

    /// Removes the ack-required entry with a given packet id, regardless of its state
    pub fn unqueue_send(&mut self, packet_id: u32) -> Option<SendEntry> {
        let idx = self.send.iter()
            .position(|e| e.is_ack_required && e.packet_id == packet_id)?;
        self.send.remove(idx)
    }

    /// Matches an ack to the corresponding send entry, which is then removed. Acks for unknown
    ///  or already acknowledged packets are ignored.
    pub fn on_ack(&mut self, packet_id: u32, now: Ticks) -> bool {
        let Some(idx) = self.send.iter().position(|e| e.is_pending_ack() && e.packet_id == packet_id) else {
            trace!("ack for packet #{} that is not pending - ignoring", packet_id);
            return false;
        };

        if let Some(entry) = self.send.get_mut(idx) {
            entry.is_acked = true;
            if let Some(first_sent_at) = entry.first_sent_at {
                self.response_time.add_sample(now.saturating_sub(first_sent_at));
            }
        }
        self.send.remove(idx);
        true
    }

    /// The oldest entry still waiting for an ack. Entries are kept in queueing order, so this
    ///  is the first pending one.
    pub fn oldest_pending_ack(&self) -> Option<&SendEntry> {
        self.send.iter()
            .find(|e| e.is_pending_ack())
    }

    /// Returns `false` without queueing the entry if the receive ring is full
    #[must_use]
    pub fn queue_receive(&mut self, entry: ReceiveEntry) -> bool {
        if self.receive.len() >= self.max_receive {
            return false;
        }
        self.receive.push_back(entry);
        self.receive_total += 1;
        true
    }

    pub fn unqueue_receive(&mut self) -> Option<ReceiveEntry> {
        self.receive.pop_front()
    }

    pub fn is_in_receive_ring(&self, code: PacketCode, packet_id: u32, sender: &Address) -> bool {
        self.receive.iter()
            .any(|e| e.code == code && e.packet_id == packet_id && &e.sender == sender)
    }

    /// Transmits every entry that is due, drops no-ack entries after their single transmission,
    ///  and returns the ids of ack-required entries that failed.
    ///
    /// An entry is due if it was never sent, or if at least `retry_delta` ticks passed since its
    ///  last transmission. An ack-required entry fails if more than `timeout` ticks passed since
    ///  its first transmission, or if it is due again after exhausting `max_retries`. Failed
    ///  entries stay in the ring: removing them is the caller's decision.
    pub fn service_send(&mut self, timing: &Timing, now: Ticks, transport: &mut dyn PacketTransport) -> Vec<u32> {
        let mut failed = Vec::new();

        for entry in self.send.iter_mut() {
            if entry.is_acked {
                continue;
            }

            if entry.is_ack_required {
                if let Some(first_sent_at) = entry.first_sent_at {
                    if now.saturating_sub(first_sent_at) > timing.timeout {
                        warn!("packet #{} to {:?} timed out after {} ticks", entry.packet_id, entry.destination, now - first_sent_at);
                        failed.push(entry.packet_id);
                        continue;
                    }
                }
            }

            let is_due = match entry.last_sent_at {
                None => true,
                Some(last_sent_at) => now.saturating_sub(last_sent_at) >= timing.retry_delta,
            };
            if !is_due {
                continue;
            }

            if entry.last_sent_at.is_some() {
                if let Some(max_retries) = timing.max_retries {
                    if entry.retry_count >= max_retries {
                        warn!("packet #{} to {:?} unacknowledged after {} retries", entry.packet_id, entry.destination, entry.retry_count);
                        failed.push(entry.packet_id);
                        continue;
                    }
                }
                entry.retry_count += 1;
            }

            trace!("sending packet #{} to {:?} (retry {})", entry.packet_id, entry.destination, entry.retry_count);
            if !transport.send(&entry.destination, &entry.packet) {
                trace!("transport did not accept packet #{}", entry.packet_id);
            }
            entry.first_sent_at.get_or_insert(now);
            entry.last_sent_at = Some(now);
        }

        self.send.retain(|e| e.is_ack_required || e.last_sent_at.is_none());
        failed
    }
}
