use std::fmt::{Display, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf_ext::BufExt;

/// Magic number reserved for the global channel. Private channels use the product id instead,
///  so a product id must never have this value.
pub const GLOBAL_MAGIC_NUMBER: u16 = 0x1234;


#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PacketCode {
    DataAck = 0,
    DataNoAck = 1,
    Ack = 2,
}
impl PacketCode {
    pub fn command_name(&self) -> &'static str {
        match self {
            PacketCode::DataAck => "ADATA",
            PacketCode::DataNoAck => "NDATA",
            PacketCode::Ack => "ACK",
        }
    }
}
impl Display for PacketCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command_name())
    }
}


/// The common header prefixed to every packet on every channel
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub magic_number: u16,
    pub code: PacketCode,
    pub packet_id: u32,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 7;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.magic_number);
        buf.put_u8(self.code.into());
        buf.put_u32(self.packet_id);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let magic_number = buf.get_checked_u16()?;
        let raw_code = buf.get_checked_u8()?;
        let code = PacketCode::try_from(raw_code)
            .map_err(|_| anyhow!("invalid packet code {}", raw_code))?;
        let packet_id = buf.get_checked_u32()?;

        Ok(PacketHeader {
            magic_number,
            code,
            packet_id,
        })
    }
}


/// Global channel packets carry the sending product's id right after the common header, so
///  that a receiver can tell which product a broadcast came from. The sender's address is taken
///  from the transport envelope.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GlobalHeader {
    pub header: PacketHeader,
    pub product_id: u16,
}

impl GlobalHeader {
    pub const SERIALIZED_LEN: usize = PacketHeader::SERIALIZED_LEN + 2;

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.header.ser(buf);
        buf.put_u16(self.product_id);
    }

    /// Reads the part that follows an already decoded common header
    pub fn try_deser_extension(header: PacketHeader, buf: &mut impl Buf) -> anyhow::Result<GlobalHeader> {
        let product_id = buf.get_checked_u16()?;
        Ok(GlobalHeader {
            header,
            product_id,
        })
    }
}


/// Decoded view of a packet after header validation
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Packet<'a> {
    Data {
        ack_required: bool,
        id: u32,
        body: &'a [u8],
    },
    Ack {
        id: u32,
    },
}

impl <'a> Packet<'a> {
    pub fn new(header: &PacketHeader, body: &'a [u8]) -> Packet<'a> {
        match header.code {
            PacketCode::DataAck => Packet::Data { ack_required: true, id: header.packet_id, body },
            PacketCode::DataNoAck => Packet::Data { ack_required: false, id: header.packet_id, body },
            PacketCode::Ack => Packet::Ack { id: header.packet_id },
        }
    }
}

/// Builds the complete wire representation of an ack for a given packet
pub fn ack_packet(magic_number: u16, packet_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PacketHeader::SERIALIZED_LEN);
    PacketHeader {
        magic_number,
        code: PacketCode::Ack,
        packet_id,
    }.ser(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::data_ack(PacketHeader { magic_number: 0x1234, code: PacketCode::DataAck, packet_id: 5 }, vec![0x12,0x34, 0, 0,0,0,5])]
    #[case::data_no_ack(PacketHeader { magic_number: 0xabcd, code: PacketCode::DataNoAck, packet_id: 0x01020304 }, vec![0xab,0xcd, 1, 1,2,3,4])]
    #[case::ack(PacketHeader { magic_number: 1, code: PacketCode::Ack, packet_id: u32::MAX }, vec![0,1, 2, 0xff,0xff,0xff,0xff])]
    fn test_header_ser(#[case] header: PacketHeader, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN);
        assert_eq!(buf, expected);

        let mut b: &[u8] = &buf;
        assert_eq!(PacketHeader::try_deser(&mut b).unwrap(), header);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated(vec![0x12, 0x34, 0, 0, 0])]
    #[case::bad_code(vec![0x12, 0x34, 3, 0, 0, 0, 1])]
    fn test_header_deser_invalid(#[case] data: Vec<u8>) {
        let mut b: &[u8] = &data;
        assert!(PacketHeader::try_deser(&mut b).is_err());
    }

    #[test]
    fn test_global_header() {
        let header = GlobalHeader {
            header: PacketHeader { magic_number: GLOBAL_MAGIC_NUMBER, code: PacketCode::DataNoAck, packet_id: 9 },
            product_id: 0xaa55,
        };
        let mut buf = Vec::new();
        header.ser(&mut buf);
        buf.extend_from_slice(b"hi");
        assert_eq!(buf.len(), GlobalHeader::SERIALIZED_LEN + 2);

        let mut b: &[u8] = &buf;
        let common = PacketHeader::try_deser(&mut b).unwrap();
        let decoded = GlobalHeader::try_deser_extension(common, &mut b).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(b, b"hi");
    }

    #[rstest]
    #[case::data_ack(PacketCode::DataAck, Packet::Data { ack_required: true, id: 3, body: b"xy" })]
    #[case::data_no_ack(PacketCode::DataNoAck, Packet::Data { ack_required: false, id: 3, body: b"xy" })]
    #[case::ack(PacketCode::Ack, Packet::Ack { id: 3 })]
    fn test_packet_new(#[case] code: PacketCode, #[case] expected: Packet<'static>) {
        let header = PacketHeader { magic_number: 1, code, packet_id: 3 };
        assert_eq!(Packet::new(&header, b"xy"), expected);
    }

    #[rstest]
    #[case(PacketCode::DataAck, "ADATA")]
    #[case(PacketCode::DataNoAck, "NDATA")]
    #[case(PacketCode::Ack, "ACK")]
    fn test_code_display(#[case] code: PacketCode, #[case] expected: &str) {
        assert_eq!(code.to_string(), expected);
    }

    #[test]
    fn test_ack_packet() {
        assert_eq!(ack_packet(0x0102, 7), vec![1, 2, 2, 0, 0, 0, 7]);
    }
}
