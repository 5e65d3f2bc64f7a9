use std::fmt::{Debug, Display, Formatter};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::anyhow;
use bytes::{Buf, BufMut};

use crate::util::buf_ext::BufExt;

/// Identifies a peer on whatever medium a transport adapter talks to. Addresses are captured
///  from inbound packets or supplied by the application when it creates a connection, and they
///  are never modified afterwards.
///
/// Equality is structural: two addresses are equal iff they are the same variant with the
///  same content.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub enum Address {
    /// network number + node id, as used by broadcast-capable LAN media
    Ipx { network: [u8; 4], node: [u8; 6] },
    Socket(SocketAddr),
    /// the single peer at the other end of a point-to-point serial line
    Serial { port: u8 },
}

impl Address {
    const DISCRIMINATOR_IPX: u8 = 1;
    const DISCRIMINATOR_V4: u8 = 4;
    const DISCRIMINATOR_V6: u8 = 6;
    const DISCRIMINATOR_SERIAL: u8 = 9;

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            Address::Ipx { network, node } => {
                buf.put_u8(Self::DISCRIMINATOR_IPX);
                buf.put_slice(network);
                buf.put_slice(node);
            }
            Address::Socket(SocketAddr::V4(data)) => {
                buf.put_u8(Self::DISCRIMINATOR_V4);
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            Address::Socket(SocketAddr::V6(data)) => {
                buf.put_u8(Self::DISCRIMINATOR_V6);
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            Address::Serial { port } => {
                buf.put_u8(Self::DISCRIMINATOR_SERIAL);
                buf.put_u8(*port);
            }
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Ipx { .. } => 11,
            Address::Socket(SocketAddr::V4(_)) => 7,
            Address::Socket(SocketAddr::V6(_)) => 19,
            Address::Serial { .. } => 2,
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Address> {
        let addr = match buf.get_checked_u8()? {
            Self::DISCRIMINATOR_IPX => {
                let network = buf.get_checked_array::<4>()?;
                let node = buf.get_checked_array::<6>()?;
                Address::Ipx { network, node }
            }
            Self::DISCRIMINATOR_V4 => {
                let ip = buf.get_checked_u32()?;
                let port = buf.get_checked_u16()?;
                Address::Socket(SocketAddr::V4(SocketAddrV4::new(ip.into(), port)))
            }
            Self::DISCRIMINATOR_V6 => {
                let ip = buf.get_checked_u128()?;
                let port = buf.get_checked_u16()?;
                Address::Socket(SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0)))
            }
            Self::DISCRIMINATOR_SERIAL => {
                Address::Serial { port: buf.get_checked_u8()? }
            }
            n => {
                return Err(anyhow!("invalid address discriminator: {}", n));
            }
        };
        Ok(addr)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipx { network, node } => {
                for b in network {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ":")?;
                for b in node {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Serial { port } => write!(f, "serial#{}", port),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}


/// Target of an outbound packet: either every peer the medium reaches, or one specific peer
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Destination {
    Broadcast,
    Peer(Address),
}

impl From<Address> for Destination {
    fn from(addr: Address) -> Self {
        Destination::Peer(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::ipx(Address::Ipx { network: [0, 0, 0, 1], node: [1, 2, 3, 4, 5, 6] }, vec![1, 0,0,0,1, 1,2,3,4,5,6])]
    #[case::v4(Address::Socket(SocketAddr::from(([10, 0, 0, 1], 0x8813))), vec![4, 10,0,0,1, 0x88,0x13])]
    #[case::v6(Address::Socket(SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 7))), vec![6, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,1, 0,7])]
    #[case::serial(Address::Serial { port: 2 }, vec![9, 2])]
    fn test_ser(#[case] addr: Address, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        addr.ser(&mut buf);
        assert_eq!(buf, expected);
        assert_eq!(addr.serialized_len(), buf.len());

        let mut b: &[u8] = &buf;
        assert_eq!(Address::try_deser(&mut b).unwrap(), addr);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::bad_discriminator(vec![7, 1, 2])]
    #[case::truncated_ipx(vec![1, 0, 0, 0, 1, 1, 2])]
    #[case::truncated_v4(vec![4, 10, 0, 0, 1, 0x88])]
    fn test_deser_invalid(#[case] data: Vec<u8>) {
        let mut b: &[u8] = &data;
        assert!(Address::try_deser(&mut b).is_err());
    }

    #[test]
    fn test_equality_is_structural() {
        let a = Address::Ipx { network: [0; 4], node: [1, 2, 3, 4, 5, 6] };
        let b = Address::Ipx { network: [0, 0, 0, 1], node: [1, 2, 3, 4, 5, 6] };
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_ne!(Address::Serial { port: 1 }, Address::Serial { port: 2 });
    }

    #[test]
    fn test_display() {
        let a = Address::Ipx { network: [0, 0, 0, 1], node: [0xa, 0xb, 0xc, 0xd, 0xe, 0xf] };
        assert_eq!(a.to_string(), "00000001:0a0b0c0d0e0f");
    }
}
