//! The relay state machine
//!
//! [`Engine`] drives [`Entry`] values in response to three kinds of events: TCP segments
//! captured from the local host, control and data messages arriving over a tunnel, and the
//! passage of time. It never blocks, never spawns threads and never reads a clock; the caller
//! supplies `now` and serializes access to each entry.

use std::{
    fmt, io,
    net::SocketAddrV4,
    ops::{BitOr, BitOrAssign},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::BytesMut;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    codec::{CodecError, CodecFactory},
    config::RelayConfig,
    entry::{Entry, InsertError, LocalState, RemoteState, Segment, Transition},
    packet::{Header, TcpPacket, HEADER_LEN},
    tunnel::{
        AddressMapper, Connector, ControlMessage, DataMessage, PacketSink, TunnelError,
        TunnelStatus,
    },
    TcpFlags,
};

mod host;
mod peer;
mod schedule;

#[cfg(test)]
mod tests;

/// Drives connection entries
///
/// One engine is shared by every thread of a relay.
pub struct Engine {
    config: Arc<RelayConfig>,
    sink: Arc<dyn PacketSink>,
    mapper: Arc<dyn AddressMapper>,
    connector: Arc<dyn Connector>,
    codecs: Arc<dyn CodecFactory>,
    ident: AtomicU16,
}

impl Engine {
    /// Create an engine around the relay's collaborators
    pub fn new(
        config: Arc<RelayConfig>,
        sink: Arc<dyn PacketSink>,
        mapper: Arc<dyn AddressMapper>,
        connector: Arc<dyn Connector>,
        codecs: Arc<dyn CodecFactory>,
    ) -> Self {
        Self {
            config,
            sink,
            mapper,
            connector,
            codecs,
            ident: AtomicU16::new(rand::random()),
        }
    }

    /// The configuration this engine was built with
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// A fresh unused entry
    pub fn new_entry(&self, id: u16, now: Instant) -> Entry {
        Entry::new(id, &self.config, now)
    }

    /// Parse a captured Ethernet frame
    pub fn parse_frame<'a>(&self, frame: &'a [u8]) -> Result<TcpPacket<'a>, crate::PacketError> {
        TcpPacket::parse_frame(frame, self.config.verify_checksums)
    }

    /// Header for a packet from the far end of `entry` to its host
    fn header(&self, entry: &Entry, flags: TcpFlags, seq: u32) -> Header {
        Header {
            source: entry.remote,
            destination: entry.local,
            ident: self.ident.fetch_add(1, Ordering::Relaxed),
            seq,
            ack: match flags.contains(TcpFlags::ACK) {
                true => entry.next_expected(),
                false => 0,
            },
            flags,
            window: entry.advertised_window(),
        }
    }

    fn emit(&self, header: &Header, payload: &[u8]) -> Result<(), Error> {
        let len = HEADER_LEN + payload.len();
        if len > usize::from(self.config.mtu) {
            return Err(Error::PacketTooLarge(len));
        }
        let mut buf = BytesMut::with_capacity(len);
        header.encode(payload, &mut buf);
        self.sink.inject(&buf)?;
        trace!(
            src = %header.source,
            dst = %header.destination,
            flags = %header.flags,
            seq = header.seq,
            ack = header.ack,
            len = payload.len(),
            "sent to host"
        );
        Ok(())
    }

    /// Synthesize a segment toward the host of `entry`
    ///
    /// Any ACK sent carries the current `next_expected`, which becomes the last acknowledged
    /// position.
    fn send(
        &self,
        entry: &mut Entry,
        flags: TcpFlags,
        seq: u32,
        payload: &[u8],
    ) -> Result<(), Error> {
        let header = self.header(entry, flags, seq);
        self.emit(&header, payload)?;
        if flags.contains(TcpFlags::ACK) {
            entry.last_acked_seq = header.ack;
        }
        Ok(())
    }

    /// Acknowledge everything received so far
    fn send_ack(&self, entry: &mut Entry) -> Result<(), Error> {
        self.send(entry, TcpFlags::ACK, entry.out_seq, &[])
    }

    /// Answer a segment that belongs to no connection, as RFC 793 prescribes
    fn reply_rst(&self, packet: &TcpPacket<'_>) -> Result<(), Error> {
        let (seq, ack, flags) = match packet.flags.contains(TcpFlags::ACK) {
            true => (packet.ack, 0, TcpFlags::RST),
            false => (
                0,
                packet
                    .seq
                    .wrapping_add(packet.payload.len() as u32)
                    .wrapping_add(packet.flags.seq_len()),
                TcpFlags::RST | TcpFlags::ACK,
            ),
        };
        let header = Header {
            source: packet.destination,
            destination: packet.source,
            ident: self.ident.fetch_add(1, Ordering::Relaxed),
            seq,
            ack,
            flags,
            window: 0,
        };
        self.emit(&header, &[])
    }

    /// Tear the connection down toward the host, optionally telling the peer as well
    ///
    /// A host whose SYN was never answered gets `RST|ACK` with sequence number 0; established
    /// hosts get a plain RST at the current position.
    fn abort(&self, entry: &mut Entry, notify_peer: bool, now: Instant) {
        let rst = match entry.local_state {
            LocalState::Unused | LocalState::Listen | LocalState::Closed => None,
            LocalState::SynRcvd => Some((TcpFlags::RST | TcpFlags::ACK, 0)),
            _ => Some((TcpFlags::RST, entry.out_seq)),
        };
        if let Some((flags, seq)) = rst {
            if let Err(e) = self.send(entry, flags, seq, &[]) {
                warn!(id = entry.id(), "failed to reset host connection: {}", e);
            }
        }
        self.teardown(entry, notify_peer, now);
    }

    /// Reset the entry without sending anything to the host
    fn teardown(&self, entry: &mut Entry, notify_peer: bool, now: Instant) {
        if notify_peer {
            self.send_remote_reset_if_needed(entry);
        }
        debug!(
            id = entry.id(),
            local = %entry.local_state,
            remote = %entry.remote_state,
            "connection aborted"
        );
        entry.reset(now);
    }

    fn send_remote_reset_if_needed(&self, entry: &mut Entry) {
        let connected = entry
            .tunnel
            .as_ref()
            .map_or(false, |t| t.status() == TunnelStatus::Connected);
        if connected && entry.remote_state.is_open() && entry.remote_id != 0 {
            let message = ControlMessage::Reset {
                local_id: entry.id(),
                remote_id: entry.remote_id,
            };
            if let Some(Err(e)) = entry.tunnel.as_ref().map(|t| t.send_control(&message)) {
                warn!(id = entry.id(), "failed to send reset request: {}", e);
            }
        }
        entry.remote_state = RemoteState::Disconnected;
    }

    /// Confirm to the peer that the host accepted the connection it asked for
    ///
    /// Leaves the remote state untouched while the tunnel cannot take the message yet; the
    /// tunnel transmitter retries.
    fn send_opened(&self, entry: &mut Entry, now: Instant) -> Result<(), Error> {
        let Some(tunnel) = entry.tunnel.clone() else {
            self.abort(entry, false, now);
            return Err(Error::NoTunnel);
        };
        match tunnel.status() {
            TunnelStatus::Connected => {}
            TunnelStatus::Connecting => return Ok(()),
            TunnelStatus::Failed | TunnelStatus::Closed => {
                self.abort(entry, false, now);
                return Err(Error::NoTunnel);
            }
        }
        if !tunnel.accepts_data() {
            return Ok(());
        }
        let message = ControlMessage::Opened {
            local_id: entry.id(),
            remote_id: entry.remote_id,
            compression: entry.compression,
        };
        if let Err(e) = tunnel.send_control(&message) {
            self.abort(entry, true, now);
            return Err(e.into());
        }
        entry.remote_state = RemoteState::ConnEstablished;
        entry.remote_action_time = now;
        debug!(id = entry.id(), remote_id = entry.remote_id, "open confirmed to peer");
        Ok(())
    }

    /// Flush the writer, send what it held and ask the peer to close
    fn flush_and_close(&self, entry: &mut Entry, now: Instant) -> Result<(), Error> {
        let next = match entry.remote_state.on_close_sent() {
            Transition::To(state) => Some(state),
            Transition::Ignore => None,
            Transition::Inconsistent => {
                let err = Error::Inconsistent {
                    local: entry.local_state,
                    remote: entry.remote_state,
                };
                self.abort(entry, true, now);
                return Err(err);
            }
        };
        if let Err(e) = self.try_flush_and_close(entry) {
            self.abort(entry, true, now);
            return Err(e);
        }
        if let Some(state) = next {
            debug!(id = entry.id(), from = %entry.remote_state, to = %state, "close sent to peer");
            entry.remote_state = state;
        }
        entry.remote_action_time = now;
        Ok(())
    }

    fn try_flush_and_close(&self, entry: &mut Entry) -> Result<(), Error> {
        let tunnel = entry.tunnel.clone().ok_or(Error::NoTunnel)?;
        let mut flushed = BytesMut::new();
        if let Some(writer) = entry.writer.as_mut() {
            writer.flush(&mut flushed)?;
        }
        for chunk in flushed.chunks(self.config.max_payload) {
            tunnel.send_data(&DataMessage {
                local_id: entry.id(),
                remote_id: entry.remote_id,
                flags: TcpFlags::PSH | TcpFlags::ACK,
                data: chunk,
            })?;
        }
        tunnel.send_control(&ControlMessage::Close {
            local_id: entry.id(),
            remote_id: entry.remote_id,
        })?;
        Ok(())
    }

    /// Sequence number the next segment queued for the host starts at
    fn next_outbound_seq(entry: &Entry) -> u32 {
        match entry.outbound.back() {
            // The SYN consumed a sequence number of its own
            Some(back) if back.flags().contains(TcpFlags::SYN) => entry.out_seq,
            Some(back) => back.following_seq(),
            None => entry.out_seq,
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Which schedulers have new work after an event
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Wake {
    /// Segments are queued for the host
    pub host: bool,
    /// Host data or control messages are ready for the tunnel
    pub tunnel: bool,
}

impl Wake {
    /// Nothing to do
    pub const NONE: Self = Self {
        host: false,
        tunnel: false,
    };
    /// Wake the local-delivery scheduler
    pub const HOST: Self = Self {
        host: true,
        tunnel: false,
    };
    /// Wake the tunnel transmitter
    pub const TUNNEL: Self = Self {
        host: false,
        tunnel: true,
    };
}

impl BitOr for Wake {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self {
            host: self.host || rhs.host,
            tunnel: self.tunnel || rhs.tunnel,
        }
    }
}

impl BitOrAssign for Wake {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

/// Reasons an event could not be applied
///
/// Most errors have already torn the connection down by the time they are returned; they are
/// reported so the caller can log them.
#[derive(Debug, Error)]
pub enum Error {
    /// No remote proxy serves the destination
    #[error("no route to {0}")]
    NoRoute(SocketAddrV4),
    /// The connection has no usable tunnel
    #[error("tunnel unavailable")]
    NoTunnel,
    /// The event names a connection the relay does not know
    #[error("unknown connection")]
    UnknownConnection,
    /// The two state machines disagree about the event
    #[error("inconsistent states {local}/{remote}")]
    Inconsistent {
        /// Local state when the event arrived
        local: LocalState,
        /// Remote state when the event arrived
        remote: RemoteState,
    },
    /// The event is not valid in the current local state
    #[error("invalid in state {0}")]
    InvalidState(LocalState),
    /// The host stopped answering
    #[error("timed out")]
    TimedOut,
    /// A synthesized packet would exceed the MTU
    #[error("packet of {0} bytes exceeds the MTU")]
    PacketTooLarge(usize),
    /// The connection table has no free slot
    #[error("connection table full")]
    TableFull,
    /// The packet sink refused a packet
    #[error("failed to inject packet: {0}")]
    Inject(#[from] io::Error),
    /// The tunnel refused a message
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    /// Compression failed
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Host data did not fit the reassembly buffer
    #[error(transparent)]
    Buffer(#[from] InsertError),
}

/// Whether a segment from the host falls inside the receive window
fn window_admits(entry: &Entry, packet: &TcpPacket<'_>) -> bool {
    let len = packet.payload.len() as u32;
    let next = entry.next_expected();
    let space = u32::from(entry.advertised_window());
    match (len, space) {
        (0, 0) => packet.seq == next,
        (0, _) => crate::seq::in_window(packet.seq, next, space),
        (_, 0) => false,
        _ => {
            // The whole segment must fit, and it must bring something new
            let end = packet.seq.wrapping_add(len);
            crate::seq::gt(end, next) && crate::seq::le(end, next.wrapping_add(space))
        }
    }
}

/// Record of a queued SYN or FIN
fn is_marker(segment: &Segment<'_>, flag: TcpFlags) -> bool {
    segment.is_empty() && segment.flags().contains(flag)
}
