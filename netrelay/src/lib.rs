//! Relays TCP connections captured from a host over tunnels to remote proxies
//!
//! A relay impersonates the far end of every TCP connection a host opens: it answers the
//! handshake, acknowledges and reassembles the host's segments, and forwards the byte stream
//! over a [`Tunnel`] to a remote proxy that holds the real connection. Data coming back from
//! the proxy is segmented, sent to the host and retransmitted until acknowledged. The remote
//! proxy may also ask the relay to open connections toward the host.
//!
//! This crate runs the protocol logic of netrelay-proto on OS threads. The entry point is
//! [`Relay`], which owns the connection table and three scheduler threads:
//!
//! - the tunnel transmitter, which drains reassembled host data into tunnels;
//! - the local-delivery scheduler, which sends and retransmits segments toward the host;
//! - the reclaimer, which recycles finished connections.
//!
//! Packet capture, packet injection, tunnel transports and compression are supplied by the
//! embedding application through the traits re-exported here.
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod config;
mod mutex;
mod relay;
mod scheduler;
mod table;

pub use proto::{
    seq, AddressMapper, CodecError, CodecFactory, CodecReader, CodecWriter, Compression,
    ConfigError, Connector, ControlMessage, DataMessage, Engine, Entry, Error, Identity,
    IdentityFactory, LocalState, PacketError, PacketSink, RelayConfig, RemoteState, Route,
    TcpFlags, TcpPacket, Tunnel, TunnelError, TunnelStatus, Wake, MAX_CONNECTIONS,
};

pub use crate::config::SchedulerConfig;
pub use crate::relay::Relay;
