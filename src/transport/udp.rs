use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use anyhow::bail;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{error, info, trace, warn};

use crate::comm::address::{Address, Destination};
use crate::comm::manager_config::MEDIUM_MAX_PACKET_LEN;
use crate::transport::{InboundPacket, PacketTransport};

pub struct UdpTransportConfig {
    /// local interface to bind to, `0.0.0.0` for all interfaces
    pub bind_ip: Ipv4Addr,
    /// target of broadcasts, typically `255.255.255.255` or the subnet's broadcast address
    pub broadcast_ip: Ipv4Addr,
    /// datagrams longer than this are truncated on receipt, and refused on send
    pub max_datagram_len: usize,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        UdpTransportConfig {
            bind_ip: Ipv4Addr::UNSPECIFIED,
            broadcast_ip: Ipv4Addr::BROADCAST,
            max_datagram_len: MEDIUM_MAX_PACKET_LEN,
        }
    }
}

impl UdpTransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_len == 0 || self.max_datagram_len > 65507 {
            bail!("max datagram length must be between 1 and 65507");
        }
        Ok(())
    }
}

/// A broadcast-capable datagram medium on top of a non-blocking UDP socket. The manager's socket
///  selector is used as the port number, and broadcasts go to the same port on the configured
///  broadcast address.
pub struct UdpTransport {
    config: UdpTransportConfig,
    socket: Option<UdpSocket>,
    port: u16,
    receive_buf: Vec<u8>,
}

impl UdpTransport {
    pub fn new(config: UdpTransportConfig) -> anyhow::Result<UdpTransport> {
        config.validate()?;
        Ok(UdpTransport {
            receive_buf: vec![0; config.max_datagram_len],
            config,
            socket: None,
            port: 0,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    fn create_socket(&self, port: u16) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(self.config.bind_ip, port)))?;
        Ok(socket.into())
    }

    fn target(&self, to: &Destination) -> Option<SocketAddr> {
        match to {
            Destination::Broadcast => Some(SocketAddr::V4(SocketAddrV4::new(self.config.broadcast_ip, self.port))),
            Destination::Peer(Address::Socket(addr)) => Some(*addr),
            Destination::Peer(other) => {
                warn!("UDP transport cannot send to {:?}", other);
                None
            }
        }
    }
}

impl PacketTransport for UdpTransport {
    fn is_available(&self) -> bool {
        true
    }

    fn open(&mut self, socket: u16) -> anyhow::Result<()> {
        self.close();

        let udp_socket = self.create_socket(socket)?;
        // with port 0, the OS picks the port, and broadcasts go there
        self.port = udp_socket.local_addr()?.port();
        info!("UDP transport bound to {:?}", udp_socket.local_addr()?);
        self.socket = Some(udp_socket);
        Ok(())
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            info!("UDP transport closed");
        }
    }

    fn poll_inbound(&mut self) -> Option<InboundPacket> {
        let socket = self.socket.as_ref()?;
        match socket.recv_from(&mut self.receive_buf) {
            Ok((len, from)) => {
                trace!("received {} bytes from {:?}", len, from);
                Some(InboundPacket {
                    sender: Address::Socket(from),
                    payload: Bytes::copy_from_slice(&self.receive_buf[..len]),
                })
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(e) => {
                error!("error receiving UDP packet: {}", e);
                None
            }
        }
    }

    fn send(&mut self, to: &Destination, buf: &[u8]) -> bool {
        if buf.len() > self.config.max_datagram_len {
            warn!("refusing to send datagram of {} bytes", buf.len());
            return false;
        }
        let Some(target) = self.target(to) else {
            return false;
        };
        let Some(socket) = self.socket.as_ref() else {
            return false;
        };

        trace!("UDP socket: sending packet to {:?}", target);
        match socket.send_to(buf, target) {
            Ok(_) => true,
            Err(e) => {
                // WouldBlock means the OS buffer is full, which is just another kind of packet loss
                trace!("error sending UDP packet to {:?}: {}", target, e);
                false
            }
        }
    }
}
