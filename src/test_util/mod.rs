//! This module contains utilities for testing code based on the connection manager without real
//!  network hardware. They are used for testing this crate itself, but they are also exported
//!  for application testing, which is why they are part of the crate's regular
//!  (non-#[cfg(test)]) code.

pub mod packets;
pub mod sim_network;

use crate::comm::address::Address;

/// convenience function for test code: create an [Address] based on a number, the same number
///  generating the same address and different numbers different addresses
pub fn test_addr_from_number(number: u16) -> Address {
    let [hi, lo] = number.to_be_bytes();
    Address::Ipx {
        network: [0, 0, 0, 1],
        node: [0, 0, 0, 0, hi, lo],
    }
}
