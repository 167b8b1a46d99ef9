//! The network simulation.
//!
//! This contains code that simulates the Internet and upstream routers. It
//! does not contain any emulation of Linux networking behaviour, which lives
//! in the [`crate::host`] module.

use std::net::Ipv4Addr;

use crate::host::Host;
use crate::network::packet::PacketRc;

pub mod dns;
pub mod graph;
pub mod packet;
pub mod relay;
pub mod router;

/// A device that can source and sink packets: a network interface, or the
/// upstream edge into the simulated internet.
pub trait PacketDevice {
    fn get_address(&self) -> Ipv4Addr;
    fn pop(&self, host: &Host) -> Option<PacketRc>;
    fn push(&self, host: &Host, packet: PacketRc);
}
