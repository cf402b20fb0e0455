//! Low-level protocol logic for relaying TCP connections over tunnels
//!
//! netrelay-proto contains a fully deterministic implementation of the relay state machine. It
//! contains no networking code, spawns no threads and does not read the system clock; every
//! operation takes the current `Instant` as an argument. Most users will want the threaded
//! `netrelay` crate instead.
//!
//! The relay sits between a host whose TCP traffic is captured and one or more remote proxies
//! reached through tunnels. For every connection it impersonates the far end toward the host,
//! synthesizing the SYN+ACKs, ACKs, FINs and RSTs a real TCP peer would send, while the
//! payload travels to the remote proxy as tunnel messages.
//!
//! The most important types are [`Engine`], which applies host segments, tunnel events and
//! timer ticks to connections, and [`Entry`], which holds the state of a single connection.

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]

mod codec;
pub use crate::codec::{
    CodecError, CodecFactory, CodecReader, CodecWriter, Compression, Identity, IdentityFactory,
};

mod config;
pub use crate::config::{ConfigError, RelayConfig};

mod engine;
pub use crate::engine::{Engine, Error, Wake};

mod entry;
pub use crate::entry::{
    Entry, InsertError, LocalState, RemoteState, RemoveError, Segment, Transition,
};

mod flags;
pub use crate::flags::TcpFlags;

mod packet;
pub use crate::packet::{PacketError, TcpPacket, HEADER_LEN};

pub mod seq;

mod tunnel;
pub use crate::tunnel::{
    AddressMapper, Connector, ControlMessage, DataMessage, PacketSink, Route, Tunnel,
    TunnelError, TunnelStatus,
};

/// Largest number of connections a relay can track at once
///
/// Connection ids are 16 bits wide and 0 means "unknown".
pub const MAX_CONNECTIONS: usize = u16::MAX as usize - 1;
