use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::comm::address::{Address, Destination};
use crate::transport::{InboundPacket, PacketTransport};
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

const TARGET_PEER: u8 = 0;
const TARGET_BROADCAST: u8 = 1;

pub struct TunnelConfig {
    pub relay_addr: SocketAddr,
    pub connect_timeout: Duration,
    /// upper bound for a frame's length field, anything bigger is treated as a protocol violation
    pub max_frame_len: usize,
    /// outbound data that could not be written yet is buffered up to this size, further packets
    ///  are dropped
    pub max_write_backlog: usize,
}

impl TunnelConfig {
    pub fn new(relay_addr: SocketAddr) -> TunnelConfig {
        TunnelConfig {
            relay_addr,
            connect_timeout: Duration::from_secs(5),
            max_frame_len: 2048,
            max_write_backlog: 64*1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_len < 32 || self.max_frame_len > u16::MAX as usize {
            bail!("max frame length must be between 32 and {}", u16::MAX);
        }
        if self.max_write_backlog < self.max_frame_len {
            bail!("write backlog must hold at least one frame");
        }
        Ok(())
    }
}

/// Appends a frame to `buf`, which must fit the 16 bit length field. Frames on the tunnel look like this (all numbers BE):
///
/// ```ascii
/// 0: length of the rest of the frame (u16)
/// 2: target (u8): 0 = peer, 1 = broadcast
/// 3: peer address (only for target 0) - for outbound frames this is the destination, for
///     inbound frames the sender
/// *: payload
/// ```
pub fn encode_frame(peer: &Destination, payload: &[u8], buf: &mut BytesMut) {
    let len_offset = buf.len();
    buf.put_u16(0);
    match peer {
        Destination::Peer(addr) => {
            buf.put_u8(TARGET_PEER);
            addr.ser(buf);
        }
        Destination::Broadcast => buf.put_u8(TARGET_BROADCAST),
    }
    buf.put_slice(payload);

    let len: u16 = (buf.len() - len_offset - 2).prechecked_cast();
    buf[len_offset..len_offset+2].copy_from_slice(&len.to_be_bytes());
}

/// value of the length field for a given frame
fn frame_len(peer: &Destination, payload: &[u8]) -> usize {
    let address_len = match peer {
        Destination::Peer(addr) => addr.serialized_len(),
        Destination::Broadcast => 0,
    };
    1 + address_len + payload.len()
}

/// Removes the first complete frame from `buf` and decodes it. Returns `Ok(None)` if `buf` does
///  not contain a complete frame yet.
pub fn try_decode_frame(buf: &mut BytesMut, max_frame_len: usize) -> anyhow::Result<Option<(Destination, Bytes)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let len: usize = u16::from_be_bytes([buf[0], buf[1]]).safe_cast();
    if len > max_frame_len {
        bail!("frame length {} exceeds maximum of {}", len, max_frame_len);
    }
    if buf.len() < 2 + len {
        return Ok(None);
    }

    let mut frame = buf.split_to(2 + len).freeze();
    frame.advance(2);

    let peer = match frame.get_checked_u8()? {
        TARGET_PEER => Destination::Peer(Address::try_deser(&mut frame)?),
        TARGET_BROADCAST => Destination::Broadcast,
        n => return Err(anyhow!("invalid frame target {}", n)),
    };
    Ok(Some((peer, frame)))
}


/// The socket tunnel medium: a TCP connection to a relay server that forwards packets between
///  its clients. The relay is an external party; this is only the client side.
///
/// The stream is non-blocking. Outbound frames are buffered and written as far as the OS
///  accepts them on every `send` and `poll_inbound`. If the relay closes the connection or
///  violates the framing, the transport is disconnected until it is opened again.
pub struct TunnelTransport {
    config: TunnelConfig,
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl TunnelTransport {
    pub fn new(config: TunnelConfig) -> anyhow::Result<TunnelTransport> {
        config.validate()?;
        Ok(TunnelTransport {
            config,
            stream: None,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn on_broken(&mut self, reason: &str) {
        warn!("tunnel to relay {:?} broken: {}", self.config.relay_addr, reason);
        self.stream = None;
        self.read_buf.clear();
        self.write_buf.clear();
    }

    fn fill_read_buf(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut chunk = [0u8; 4096];
        let result = loop {
            match stream.read(&mut chunk) {
                Ok(0) => break Err("connection closed by relay".to_string()),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(e.to_string()),
            }
        };
        if let Err(reason) = result {
            self.on_broken(&reason);
        }
    }

    fn flush(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let result = loop {
            if self.write_buf.is_empty() {
                break Ok(());
            }
            match stream.write(&self.write_buf) {
                Ok(0) => break Err("relay does not accept data".to_string()),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(e.to_string()),
            }
        };
        if let Err(reason) = result {
            self.on_broken(&reason);
        }
    }
}

impl PacketTransport for TunnelTransport {
    /// A tunnel can always be attempted, the relay's reachability shows when opening it
    fn is_available(&self) -> bool {
        true
    }

    fn open(&mut self, socket: u16) -> anyhow::Result<()> {
        self.close();

        let stream = TcpStream::connect_timeout(&self.config.relay_addr, self.config.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        info!("tunnel connected to relay {:?} (socket {:#06x})", self.config.relay_addr, socket);
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("tunnel to relay {:?} closed", self.config.relay_addr);
        }
        self.read_buf.clear();
        self.write_buf.clear();
    }

    fn poll_inbound(&mut self) -> Option<InboundPacket> {
        self.flush();
        self.fill_read_buf();

        loop {
            match try_decode_frame(&mut self.read_buf, self.config.max_frame_len) {
                Ok(None) => return None,
                Ok(Some((Destination::Peer(sender), payload))) => {
                    trace!("received {} bytes from {:?} through tunnel", payload.len(), sender);
                    return Some(InboundPacket { sender, payload });
                }
                Ok(Some((Destination::Broadcast, _))) => {
                    debug!("ignoring inbound tunnel frame without sender");
                }
                Err(e) => {
                    self.on_broken(&e.to_string());
                    return None;
                }
            }
        }
    }

    fn send(&mut self, to: &Destination, buf: &[u8]) -> bool {
        if self.stream.is_none() {
            return false;
        }
        let encoded_len = frame_len(to, buf);
        if encoded_len > self.config.max_frame_len {
            warn!("refusing to send tunnel frame of {} bytes", encoded_len);
            return false;
        }
        if self.write_buf.len() + 2 + encoded_len > self.config.max_write_backlog {
            debug!("tunnel write backlog full - dropping packet");
            return false;
        }

        encode_frame(to, buf, &mut self.write_buf);
        self.flush();
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use rstest::rstest;

    fn addr() -> Address {
        Address::Socket(SocketAddr::from(([10, 0, 0, 7], 0x8813)))
    }

    #[test]
    fn test_encode_frame() {
        let mut buf = BytesMut::new();
        encode_frame(&Destination::Peer(addr()), b"hi", &mut buf);
        encode_frame(&Destination::Broadcast, b"all", &mut buf);
        assert_eq!(buf.as_ref(), &[
            0, 10, 0, 4, 10, 0, 0, 7, 0x88, 0x13, b'h', b'i',
            0, 4, 1, b'a', b'l', b'l',
        ]);

        assert_eq!(try_decode_frame(&mut buf, 100).unwrap(), Some((Destination::Peer(addr()), Bytes::from_static(b"hi"))));
        assert_eq!(try_decode_frame(&mut buf, 100).unwrap(), Some((Destination::Broadcast, Bytes::from_static(b"all"))));
        assert_eq!(try_decode_frame(&mut buf, 100).unwrap(), None);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::partial_length(vec![0])]
    #[case::partial_frame(vec![0, 4, 1, b'a'])]
    fn test_decode_incomplete(#[case] data: Vec<u8>) {
        let mut buf = BytesMut::from(data.as_slice());
        assert_eq!(try_decode_frame(&mut buf, 100).unwrap(), None);
        assert_eq!(buf.len(), data.len());
    }

    #[rstest]
    #[case::too_long(vec![0, 101])]
    #[case::bad_target(vec![0, 2, 5, 0])]
    #[case::bad_address(vec![0, 3, 0, 4, 1])]
    fn test_decode_invalid(#[case] data: Vec<u8>) {
        let mut buf = BytesMut::from(data.as_slice());
        assert!(try_decode_frame(&mut buf, 100).is_err());
    }

    fn read_frame_blocking(stream: &mut TcpStream, max_frame_len: usize) -> (Destination, Bytes) {
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = BytesMut::new();
        loop {
            if let Some(frame) = try_decode_frame(&mut buf, max_frame_len).unwrap() {
                return frame;
            }
            let mut chunk = [0u8; 256];
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn poll_with_retry(transport: &mut TunnelTransport) -> Option<InboundPacket> {
        for _ in 0..100 {
            if let Some(p) = transport.poll_inbound() {
                return Some(p);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        None
    }

    #[test]
    fn test_exchange_with_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut transport = TunnelTransport::new(TunnelConfig::new(listener.local_addr().unwrap())).unwrap();
        transport.open(0x8813).unwrap();
        let (mut relay, _) = listener.accept().unwrap();

        assert!(transport.send(&Destination::Peer(addr()), b"to peer"));
        assert!(transport.send(&Destination::Broadcast, b"to all"));
        assert_eq!(read_frame_blocking(&mut relay, 2048), (Destination::Peer(addr()), Bytes::from_static(b"to peer")));
        assert_eq!(read_frame_blocking(&mut relay, 2048), (Destination::Broadcast, Bytes::from_static(b"to all")));

        let mut buf = BytesMut::new();
        encode_frame(&Destination::Broadcast, b"ignored", &mut buf);
        encode_frame(&Destination::Peer(addr()), b"from peer", &mut buf);
        relay.write_all(&buf).unwrap();

        let received = poll_with_retry(&mut transport).unwrap();
        assert_eq!(received.sender, addr());
        assert_eq!(received.payload.as_ref(), b"from peer");
        assert!(transport.is_connected());

        drop(relay);
        assert!(poll_with_retry(&mut transport).is_none());
        assert!(!transport.is_connected());
        assert!(!transport.send(&Destination::Broadcast, b"x"));
    }

    #[rstest]
    #[case::default_config(2048, 64*1024, 3000)]
    #[case::beyond_length_field(u16::MAX as usize, 1 << 20, 70_000)]
    fn test_send_oversized_frame(#[case] max_frame_len: usize, #[case] max_write_backlog: usize, #[case] payload_len: usize) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = TunnelConfig::new(listener.local_addr().unwrap());
        config.max_frame_len = max_frame_len;
        config.max_write_backlog = max_write_backlog;
        let mut transport = TunnelTransport::new(config).unwrap();
        transport.open(0).unwrap();
        let (mut relay, _) = listener.accept().unwrap();

        assert!(!transport.send(&Destination::Broadcast, &vec![0; payload_len]));
        assert!(!transport.send(&Destination::Peer(addr()), &vec![0; max_frame_len - 1]));
        assert!(transport.is_connected());

        // the largest frame that fits still goes through
        let max_payload = max_frame_len - 1 - addr().serialized_len();
        assert!(transport.send(&Destination::Peer(addr()), &vec![7; max_payload]));

        // the OS may not take the whole frame at once, polling flushes the rest
        relay.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        let mut buf = BytesMut::new();
        for _ in 0..500 {
            if let Some((to, payload)) = try_decode_frame(&mut buf, max_frame_len).unwrap() {
                assert_eq!(to, Destination::Peer(addr()));
                assert_eq!(payload.len(), max_payload);
                return;
            }
            assert!(transport.poll_inbound().is_none());
            let mut chunk = [0u8; 4096];
            if let Ok(n) = relay.read(&mut chunk) {
                buf.extend_from_slice(&chunk[..n]);
            }
        }
        panic!("frame did not arrive");
    }

    #[test]
    fn test_open_fails_without_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let relay_addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport = TunnelTransport::new(TunnelConfig::new(relay_addr)).unwrap();
        assert!(transport.open(0).is_err());
        assert!(!transport.send(&Destination::Broadcast, b"x"));
    }
}
