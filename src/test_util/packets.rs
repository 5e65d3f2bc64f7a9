//! Raw wire packets, for injecting traffic into a simulated network

use crate::comm::packet_header::{GlobalHeader, PacketCode, PacketHeader, GLOBAL_MAGIC_NUMBER};

pub fn private_packet(product_id: u16, code: PacketCode, packet_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    PacketHeader {
        magic_number: product_id,
        code,
        packet_id,
    }.ser(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

pub fn global_packet(sender_product_id: u16, code: PacketCode, packet_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    GlobalHeader {
        header: PacketHeader {
            magic_number: GLOBAL_MAGIC_NUMBER,
            code,
            packet_id,
        },
        product_id: sender_product_id,
    }.ser(&mut buf);
    buf.extend_from_slice(payload);
    buf
}
