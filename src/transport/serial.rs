use std::io::{ErrorKind, Read, Write};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use tracing::{debug, info, trace, warn};

use crate::comm::address::{Address, Destination};
use crate::comm::manager_config::MEDIUM_MAX_PACKET_LEN;
use crate::transport::{InboundPacket, PacketTransport};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

const START_CODE: u16 = 0xDABD;
const VERIFY_CODE: u16 = 0xDEAF;

const HEADER_LEN: usize = 6;
const CRC_LEN: usize = 4;

const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Splits a serial byte stream into packets. Frames look like this (all numbers BE):
///
/// ```ascii
///  0: start code 0xDABD (u16)
///  2: payload length (u16)
///  4: verify code 0xDEAF (u16)
///  6: payload
///  *: CRC-32 of the payload (u32)
/// ```
///
/// A serial line loses and corrupts bytes, so the parser never gives up on the stream. Anything
///  that does not check out (verify code, plausible length, CRC) is treated as a false start code:
///  the parser skips it and searches for the next one.
pub struct SerialFramer {
    buf: BytesMut,
    max_payload_len: usize,
    crc_errors: u64,
}

impl SerialFramer {
    pub const OVERHEAD: usize = HEADER_LEN + CRC_LEN;

    pub fn new(max_payload_len: usize) -> SerialFramer {
        SerialFramer {
            buf: BytesMut::new(),
            max_payload_len,
            crc_errors: 0,
        }
    }

    pub fn encode(payload: &[u8], out: &mut BytesMut) {
        out.put_u16(START_CODE);
        out.put_u16(payload.len().prechecked_cast());
        out.put_u16(VERIFY_CODE);
        out.put_slice(payload);
        out.put_u32(FRAME_CRC.checksum(payload));
    }

    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn crc_errors(&self) -> u64 {
        self.crc_errors
    }

    pub fn num_buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the payload of the next valid frame, or `None` if more data is needed
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let start = START_CODE.to_be_bytes();

        loop {
            let Some(pos) = self.buf.windows(2).position(|w| w == start) else {
                // the last byte may be the first half of a start code
                let discard = self.buf.len().saturating_sub(1);
                if discard > 0 {
                    trace!("discarding {} bytes without start code", discard);
                }
                self.buf.advance(discard);
                return None;
            };
            if pos > 0 {
                trace!("discarding {} bytes before start code", pos);
                self.buf.advance(pos);
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let len: usize = u16::from_be_bytes([self.buf[2], self.buf[3]]).safe_cast();
            let verify = u16::from_be_bytes([self.buf[4], self.buf[5]]);
            if verify != VERIFY_CODE || len > self.max_payload_len {
                debug!("invalid frame header - resynchronizing");
                self.buf.advance(2);
                continue;
            }

            if self.buf.len() < HEADER_LEN + len + CRC_LEN {
                return None;
            }

            let payload = &self.buf[HEADER_LEN..HEADER_LEN + len];
            let mut crc_buf = &self.buf[HEADER_LEN + len..HEADER_LEN + len + CRC_LEN];
            if FRAME_CRC.checksum(payload) != crc_buf.get_u32() {
                self.crc_errors += 1;
                warn!("CRC error in serial frame of {} bytes - resynchronizing", len);
                self.buf.advance(2);
                continue;
            }

            let mut frame = self.buf.split_to(HEADER_LEN + len + CRC_LEN).freeze();
            frame.advance(HEADER_LEN);
            frame.truncate(len);
            return Some(frame);
        }
    }
}


pub struct SerialConfig {
    /// identifies the line, and is reported as the sender of all inbound packets
    pub port_number: u8,
    pub max_payload_len: usize,
    /// outbound bytes that could not be written yet are buffered up to this size, further
    ///  packets are dropped
    pub max_write_backlog: usize,
}

impl SerialConfig {
    pub fn new(port_number: u8) -> SerialConfig {
        SerialConfig {
            port_number,
            max_payload_len: MEDIUM_MAX_PACKET_LEN,
            max_write_backlog: 16*1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_len == 0 || self.max_payload_len > u16::MAX as usize {
            bail!("max payload length must be between 1 and {}", u16::MAX);
        }
        if self.max_write_backlog < self.max_payload_len + SerialFramer::OVERHEAD {
            bail!("write backlog must hold at least one frame");
        }
        Ok(())
    }
}

/// Opens the port for a given socket selector. The returned port must not block: reads return
///  `WouldBlock`, `TimedOut` or `Ok(0)` if no data is available.
pub type PortOpener<P> = Box<dyn FnMut(u16) -> std::io::Result<P>>;

/// The framed serial medium: a point-to-point line (null modem cable or modem connection) with
///  exactly one peer. Broadcasts and peer packets alike go down the line.
pub struct SerialTransport<P: Read + Write> {
    config: SerialConfig,
    opener: PortOpener<P>,
    port: Option<P>,
    framer: SerialFramer,
    write_buf: BytesMut,
}

impl <P: Read + Write> SerialTransport<P> {
    pub fn new(config: SerialConfig, opener: PortOpener<P>) -> anyhow::Result<SerialTransport<P>> {
        config.validate()?;
        Ok(SerialTransport {
            framer: SerialFramer::new(config.max_payload_len),
            config,
            opener,
            port: None,
            write_buf: BytesMut::new(),
        })
    }

    pub fn peer_address(&self) -> Address {
        Address::Serial { port: self.config.port_number }
    }

    pub fn crc_errors(&self) -> u64 {
        self.framer.crc_errors()
    }

    fn on_port_error(&mut self, e: std::io::Error) {
        warn!("serial port {} failed: {}", self.config.port_number, e);
        self.port = None;
        self.write_buf.clear();
    }

    fn read_available(&mut self) {
        let Some(port) = self.port.as_mut() else {
            return;
        };

        let mut chunk = [0u8; 512];
        let result = loop {
            match port.read(&mut chunk) {
                Ok(0) => break Ok(()),
                Ok(n) => self.framer.push_bytes(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = result {
            self.on_port_error(e);
        }
    }

    fn flush(&mut self) {
        let Some(port) = self.port.as_mut() else {
            return;
        };

        let result = loop {
            if self.write_buf.is_empty() {
                break port.flush();
            }
            match port.write(&self.write_buf) {
                Ok(0) => break Ok(()),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = result {
            self.on_port_error(e);
        }
    }
}

impl <P: Read + Write> PacketTransport for SerialTransport<P> {
    fn is_available(&self) -> bool {
        true
    }

    fn open(&mut self, socket: u16) -> anyhow::Result<()> {
        self.close();
        self.port = Some((self.opener)(socket)?);
        info!("serial port {} opened", self.config.port_number);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("serial port {} closed", self.config.port_number);
        }
        self.framer.reset();
        self.write_buf.clear();
    }

    fn poll_inbound(&mut self) -> Option<InboundPacket> {
        self.flush();
        self.read_available();

        let payload = self.framer.next_frame()?;
        trace!("received {} bytes on serial port {}", payload.len(), self.config.port_number);
        Some(InboundPacket {
            sender: self.peer_address(),
            payload,
        })
    }

    fn send(&mut self, _to: &Destination, buf: &[u8]) -> bool {
        if self.port.is_none() {
            return false;
        }
        if buf.len() > self.config.max_payload_len {
            warn!("refusing to send serial frame of {} bytes", buf.len());
            return false;
        }
        if self.write_buf.len() + buf.len() + SerialFramer::OVERHEAD > self.config.max_write_backlog {
            debug!("serial write backlog full - dropping packet");
            return false;
        }

        SerialFramer::encode(buf, &mut self.write_buf);
        self.flush();
        self.port.is_some()
    }
}
