use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::comm::address::{Address, Destination};
use crate::transport::{InboundPacket, PacketTransport};

/// An in-memory broadcast medium connecting any number of [SimTransport]s. Tests keep a handle
///  to the network to inject packets, cut links, introduce random loss and inspect traffic
///  while the transports are owned by connection managers.
///
/// Everything is single-threaded, matching the cooperative polling model of the manager.
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Rc<RefCell<SimNetworkInner>>,
}

#[derive(Default)]
struct SimNetworkInner {
    endpoints: FxHashMap<Address, Endpoint>,
    loss_probability: f64,
}

struct Endpoint {
    inbox: VecDeque<InboundPacket>,
    is_available: bool,
    is_open: bool,
    is_link_up: bool,
    sent: Vec<(Destination, Bytes)>,
}

impl SimNetwork {
    pub fn new() -> SimNetwork {
        Self::default()
    }

    /// Registers an endpoint with the given address and returns its transport
    pub fn transport(&self, address: Address) -> SimTransport {
        self.inner.borrow_mut().endpoints.insert(address, Endpoint {
            inbox: VecDeque::new(),
            is_available: true,
            is_open: false,
            is_link_up: true,
            sent: Vec::new(),
        });
        SimTransport {
            network: self.inner.clone(),
            address,
        }
    }

    /// While a link is down, all packets from or to the endpoint are lost
    pub fn set_link_up(&self, address: Address, is_up: bool) {
        if let Some(ep) = self.inner.borrow_mut().endpoints.get_mut(&address) {
            ep.is_link_up = is_up;
        }
    }

    pub fn set_available(&self, address: Address, is_available: bool) {
        if let Some(ep) = self.inner.borrow_mut().endpoints.get_mut(&address) {
            ep.is_available = is_available;
        }
    }

    /// probability in [0.0, 1.0] with which any single delivery is lost
    pub fn set_loss_probability(&self, probability: f64) {
        self.inner.borrow_mut().loss_probability = probability;
    }

    /// Places a raw packet in an endpoint's inbox as if `from` had sent it, bypassing loss
    pub fn inject(&self, to: Address, from: Address, payload: &[u8]) {
        if let Some(ep) = self.inner.borrow_mut().endpoints.get_mut(&to) {
            ep.inbox.push_back(InboundPacket {
                sender: from,
                payload: Bytes::copy_from_slice(payload),
            });
        }
    }

    /// everything an endpoint handed to the medium, including packets that were lost
    pub fn sent_by(&self, address: Address) -> Vec<(Destination, Bytes)> {
        self.inner.borrow().endpoints.get(&address)
            .map(|ep| ep.sent.clone())
            .unwrap_or_default()
    }

    pub fn clear_sent(&self, address: Address) {
        if let Some(ep) = self.inner.borrow_mut().endpoints.get_mut(&address) {
            ep.sent.clear();
        }
    }

    pub fn num_pending(&self, address: Address) -> usize {
        self.inner.borrow().endpoints.get(&address)
            .map(|ep| ep.inbox.len())
            .unwrap_or(0)
    }

    pub fn is_open(&self, address: Address) -> bool {
        self.inner.borrow().endpoints.get(&address)
            .map(|ep| ep.is_open)
            .unwrap_or(false)
    }
}

impl SimNetworkInner {
    fn deliver(&mut self, from: Address, to: Address, payload: &Bytes) {
        let loss_probability = self.loss_probability;
        let Some(ep) = self.endpoints.get_mut(&to) else {
            trace!("simulated network: no endpoint {:?}", to);
            return;
        };
        if !ep.is_open || !ep.is_link_up {
            trace!("simulated network: {:?} is not reachable", to);
            return;
        }
        if loss_probability > 0.0 && rand::random::<f64>() < loss_probability {
            trace!("simulated network: losing packet from {:?} to {:?}", from, to);
            return;
        }
        ep.inbox.push_back(InboundPacket {
            sender: from,
            payload: payload.clone(),
        });
    }
}

/// One endpoint of a [SimNetwork]
pub struct SimTransport {
    network: Rc<RefCell<SimNetworkInner>>,
    address: Address,
}

impl SimTransport {
    pub fn address(&self) -> Address {
        self.address
    }
}

impl PacketTransport for SimTransport {
    fn is_available(&self) -> bool {
        self.network.borrow().endpoints.get(&self.address)
            .map(|ep| ep.is_available)
            .unwrap_or(false)
    }

    fn open(&mut self, _socket: u16) -> anyhow::Result<()> {
        let mut network = self.network.borrow_mut();
        let Some(ep) = network.endpoints.get_mut(&self.address) else {
            anyhow::bail!("endpoint {:?} is not registered", self.address);
        };
        if !ep.is_available {
            anyhow::bail!("endpoint {:?} is not available", self.address);
        }
        ep.is_open = true;
        ep.inbox.clear();
        Ok(())
    }

    fn close(&mut self) {
        if let Some(ep) = self.network.borrow_mut().endpoints.get_mut(&self.address) {
            ep.is_open = false;
            ep.inbox.clear();
        }
    }

    fn poll_inbound(&mut self) -> Option<InboundPacket> {
        self.network.borrow_mut().endpoints.get_mut(&self.address)
            .filter(|ep| ep.is_open)
            .and_then(|ep| ep.inbox.pop_front())
    }

    fn send(&mut self, to: &Destination, buf: &[u8]) -> bool {
        let mut network = self.network.borrow_mut();
        let payload = Bytes::copy_from_slice(buf);

        let Some(ep) = network.endpoints.get_mut(&self.address) else {
            return false;
        };
        if !ep.is_open {
            return false;
        }
        ep.sent.push((*to, payload.clone()));
        if !ep.is_link_up {
            return true;
        }

        match to {
            Destination::Peer(addr) => network.deliver(self.address, *addr, &payload),
            Destination::Broadcast => {
                let others = network.endpoints.keys()
                    .filter(|a| **a != self.address)
                    .cloned()
                    .collect::<Vec<_>>();
                for addr in others {
                    network.deliver(self.address, addr, &payload);
                }
            }
        }
        true
    }
}
