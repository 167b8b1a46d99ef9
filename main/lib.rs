//! The mirage simulator: a parallel discrete-event network simulator that
//! services application syscalls against a virtual network stack, advancing
//! virtual time only as events require.

// buffers and queues want to keep explicit control over element types
#![allow(clippy::new_without_default)]

#[macro_use]
pub mod utility;

pub mod core;
pub mod host;
pub mod network;
