//! Interfaces to the collaborators surrounding the relay
//!
//! The relay never talks to the network itself. Frames for the host go to a [`PacketSink`],
//! traffic for the remote proxy goes through a [`Tunnel`] obtained from a [`Connector`], and
//! an [`AddressMapper`] decides which remote proxy serves a destination.

use std::{fmt, io, net::SocketAddr, net::SocketAddrV4, sync::Arc};

use thiserror::Error;

use crate::{Compression, TcpFlags};

/// Lifecycle of a tunnel to a remote proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// Handshake with the remote proxy in progress
    Connecting,
    /// Ready to carry messages
    Connected,
    /// The handshake or the transport failed
    Failed,
    /// Closed by either side
    Closed,
}

/// Control messages exchanged with the remote proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Ask the remote proxy to open a connection to `destination`
    Open {
        /// Our id for the connection
        local_id: u16,
        /// Address of the host that initiated the connection
        source: SocketAddrV4,
        /// Address the host wants to reach
        destination: SocketAddrV4,
        /// Compression our writer produces
        compression: Compression,
    },
    /// Confirm that a requested connection is open on our side
    Opened {
        /// Our id for the connection
        local_id: u16,
        /// The peer's id for the connection
        remote_id: u16,
        /// Compression our writer produces
        compression: Compression,
    },
    /// No more data will follow on this connection
    Close {
        /// Our id for the connection
        local_id: u16,
        /// The peer's id for the connection
        remote_id: u16,
    },
    /// Abort the connection
    Reset {
        /// Our id for the connection
        local_id: u16,
        /// The peer's id for the connection
        remote_id: u16,
    },
}

/// A chunk of (encoded) host data for the remote proxy
#[derive(Debug, Clone, Copy)]
pub struct DataMessage<'a> {
    /// Our id for the connection
    pub local_id: u16,
    /// The peer's id for the connection
    pub remote_id: u16,
    /// TCP flags that accompanied the data, minus SYN, FIN and RST
    pub flags: TcpFlags,
    /// Payload
    pub data: &'a [u8],
}

/// A transport connecting this relay to one remote proxy
///
/// Shared between every connection routed to that proxy.
pub trait Tunnel: Send + Sync + fmt::Debug {
    /// Current lifecycle state
    fn status(&self) -> TunnelStatus;

    /// Whether data may be queued right now
    ///
    /// Returning `false` applies backpressure: the relay keeps data in its buffers and shrinks
    /// the window advertised to the host.
    fn accepts_data(&self) -> bool {
        true
    }

    /// Send a control message
    fn send_control(&self, message: &ControlMessage) -> Result<(), TunnelError>;

    /// Send host data
    fn send_data(&self, message: &DataMessage<'_>) -> Result<(), TunnelError>;
}

/// Obtains tunnels to remote proxies
pub trait Connector: Send + Sync {
    /// A tunnel to `peer`, reusing one that is already connecting or connected
    fn connect(&self, peer: SocketAddr) -> Result<Arc<dyn Tunnel>, TunnelError>;
}

/// How a destination is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Remote proxy serving the destination
    pub peer: SocketAddr,
    /// Scheduling weight of connections on this route, higher is served more often
    pub priority: u8,
    /// Compression applied to data we send
    pub compression: Compression,
}

/// Resolves which remote proxy handles a connection
pub trait AddressMapper: Send + Sync {
    /// The route for traffic from `source` to `destination`, if any
    fn route(&self, source: SocketAddrV4, destination: SocketAddrV4) -> Option<Route>;
}

/// Delivers synthesized IPv4 packets to the local network
pub trait PacketSink: Send + Sync {
    /// Inject one complete IPv4 packet
    fn inject(&self, packet: &[u8]) -> io::Result<()>;
}

/// Errors reported by a [`Tunnel`] or [`Connector`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// The tunnel is not in the connected state
    #[error("tunnel not connected")]
    NotConnected,
    /// The tunnel cannot queue more data right now
    #[error("tunnel would block")]
    WouldBlock,
    /// The underlying transport failed
    #[error("transport failure: {0}")]
    Transport(String),
}
