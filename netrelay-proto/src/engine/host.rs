use std::time::Instant;

use tracing::{debug, info, trace, warn};

use super::{is_marker, window_admits, Engine, Error, Wake};
use crate::{
    entry::{Entry, LocalState, RemoteState, Segment, Transition},
    packet::TcpPacket,
    seq,
    tunnel::{ControlMessage, TunnelStatus},
    TcpFlags,
};

impl Engine {
    /// Process one TCP segment captured from the local host
    ///
    /// `entry` must be the entry whose `local` address is the packet's source and whose
    /// `remote` address is its destination, freshly claimed if the connection is new.
    pub fn handle_host_packet(
        &self,
        entry: &mut Entry,
        packet: &TcpPacket<'_>,
        now: Instant,
    ) -> Result<Wake, Error> {
        trace!(
            id = entry.id(),
            state = %entry.local_state,
            flags = %packet.flags,
            seq = packet.seq,
            ack = packet.ack,
            len = packet.payload.len(),
            "host segment"
        );
        match entry.local_state {
            LocalState::Unused | LocalState::Listen => self.on_listen(entry, packet, now),
            LocalState::Closed => {
                if !packet.flags.contains(TcpFlags::RST) {
                    self.reply_rst(packet)?;
                    entry.reset(now);
                }
                Ok(Wake::NONE)
            }
            LocalState::SynSent => self.on_syn_sent(entry, packet, now),
            _ => self.on_synchronized(entry, packet, now),
        }
    }

    fn on_listen(
        &self,
        entry: &mut Entry,
        packet: &TcpPacket<'_>,
        now: Instant,
    ) -> Result<Wake, Error> {
        let flags = packet.flags;
        if flags.contains(TcpFlags::RST) {
            return Ok(Wake::NONE);
        }
        if !flags.contains(TcpFlags::SYN) || flags.intersects(TcpFlags::ACK | TcpFlags::FIN) {
            self.reply_rst(packet)?;
            entry.reset(now);
            return Ok(Wake::NONE);
        }
        self.accept_syn(entry, packet, now)
    }

    /// The host wants to open a connection through the relay
    ///
    /// The SYN+ACK is withheld until the peer confirms that the destination accepted.
    fn accept_syn(
        &self,
        entry: &mut Entry,
        packet: &TcpPacket<'_>,
        now: Instant,
    ) -> Result<Wake, Error> {
        entry.starting_in_seq = packet.seq;
        entry.inbound.reset_to(packet.seq.wrapping_add(1));
        entry.prepare_new_connection();
        entry.window_seq = packet.seq;
        entry.receiver_window = packet.window;
        entry.local_state = LocalState::SynRcvd;
        entry.local_action_time = now;
        entry.last_ack_time = now;
        entry.remote_action_time = now;
        entry.retransmissions = 0;

        let Some(route) = self.mapper.route(entry.local, entry.remote) else {
            info!(src = %entry.local, dst = %entry.remote, "no route, refusing connection");
            self.abort(entry, false, now);
            return Err(Error::NoRoute(packet.destination));
        };
        entry.peer = Some(route.peer);
        entry.assigned_priority = route.priority;
        entry.current_priority = route.priority;
        entry.compression = route.compression;

        match self.codecs.writer(route.compression) {
            Ok(writer) => entry.writer = Some(writer),
            Err(e) => {
                self.abort(entry, false, now);
                return Err(e.into());
            }
        }
        let tunnel = match self.connector.connect(route.peer) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(peer = %route.peer, "failed to obtain tunnel: {}", e);
                self.abort(entry, false, now);
                return Err(e.into());
            }
        };
        entry.tunnel = Some(tunnel.clone());

        match tunnel.status() {
            TunnelStatus::Connected => {
                let request = ControlMessage::Open {
                    local_id: entry.id(),
                    source: entry.local,
                    destination: entry.remote,
                    compression: entry.compression,
                };
                if let Err(e) = tunnel.send_control(&request) {
                    self.abort(entry, false, now);
                    return Err(e.into());
                }
                entry.remote_state = RemoteState::ConnRequestSent;
            }
            TunnelStatus::Connecting => entry.remote_state = RemoteState::WaitingEstablishment,
            TunnelStatus::Failed | TunnelStatus::Closed => {
                self.abort(entry, false, now);
                return Err(Error::NoTunnel);
            }
        }
        info!(
            id = entry.id(),
            src = %entry.local,
            dst = %entry.remote,
            peer = %route.peer,
            "host opened connection"
        );
        Ok(Wake::TUNNEL)
    }

    /// We relayed the peer's open request to the host and wait for its SYN+ACK
    fn on_syn_sent(
        &self,
        entry: &mut Entry,
        packet: &TcpPacket<'_>,
        now: Instant,
    ) -> Result<Wake, Error> {
        let flags = packet.flags;
        if flags.contains(TcpFlags::ACK) && packet.ack != entry.out_seq {
            if !flags.contains(TcpFlags::RST) {
                self.send(entry, TcpFlags::RST, packet.ack, &[])?;
            }
            return Ok(Wake::NONE);
        }
        if flags.contains(TcpFlags::RST) {
            if flags.contains(TcpFlags::ACK) {
                info!(id = entry.id(), dst = %entry.local, "host refused connection");
                self.teardown(entry, true, now);
            }
            return Ok(Wake::NONE);
        }
        if !flags.contains(TcpFlags::SYN) {
            return Ok(Wake::NONE);
        }

        entry.starting_in_seq = packet.seq;
        entry.inbound.reset_to(packet.seq.wrapping_add(1));
        entry.window_seq = packet.seq;
        entry.receiver_window = packet.window;
        entry.local_action_time = now;
        entry.last_ack_time = now;
        entry.retransmissions = 0;

        if !flags.contains(TcpFlags::ACK) {
            // Simultaneous open
            entry.local_state = LocalState::SynRcvd;
            self.send(
                entry,
                TcpFlags::SYN | TcpFlags::ACK,
                entry.starting_out_seq,
                &[],
            )?;
            return Ok(Wake::NONE);
        }

        if entry.outbound.front().map_or(false, |s| is_marker(s, TcpFlags::SYN)) {
            entry.outbound.pop_front();
        }
        entry.last_ack_seq = packet.ack;
        entry.local_state = LocalState::Established;
        debug!(id = entry.id(), "host accepted connection");
        if let Err(e) = self.send_ack(entry) {
            self.abort(entry, true, now);
            return Err(e);
        }
        if entry.remote_state == RemoteState::ConnRequestReceived {
            self.send_opened(entry, now)?;
        }
        Ok(Wake::HOST | Wake::TUNNEL)
    }

    fn on_synchronized(
        &self,
        entry: &mut Entry,
        packet: &TcpPacket<'_>,
        now: Instant,
    ) -> Result<Wake, Error> {
        let flags = packet.flags;

        if entry.local_state == LocalState::SynRcvd
            && flags.contains(TcpFlags::SYN)
            && !flags.intersects(TcpFlags::ACK | TcpFlags::RST)
        {
            // Retransmitted SYN: our SYN+ACK was lost, or has not been sent yet
            if packet.seq == entry.starting_in_seq
                && entry.remote_state == RemoteState::ConnEstablished
            {
                self.send(
                    entry,
                    TcpFlags::SYN | TcpFlags::ACK,
                    entry.starting_out_seq,
                    &[],
                )?;
            }
            return Ok(Wake::NONE);
        }

        if !window_admits(entry, packet) {
            if !flags.contains(TcpFlags::RST) {
                trace!(
                    id = entry.id(),
                    seq = packet.seq,
                    next = entry.next_expected(),
                    window = entry.advertised_window(),
                    "segment outside window"
                );
                self.send_ack(entry)?;
            }
            return Ok(Wake::NONE);
        }

        if flags.contains(TcpFlags::RST) {
            self.on_host_reset(entry, now);
            return Ok(Wake::NONE);
        }

        if flags.contains(TcpFlags::SYN) {
            warn!(id = entry.id(), state = %entry.local_state, "SYN inside window");
            let state = entry.local_state;
            self.abort(entry, true, now);
            return Err(Error::InvalidState(state));
        }

        if !flags.contains(TcpFlags::ACK) {
            return Ok(Wake::NONE);
        }

        let mut wake = Wake::NONE;
        if entry.local_state == LocalState::SynRcvd {
            if packet.ack != entry.out_seq {
                self.send(entry, TcpFlags::RST, packet.ack, &[])?;
                self.teardown(entry, true, now);
                return Ok(Wake::NONE);
            }
            if entry.outbound.front().map_or(false, |s| is_marker(s, TcpFlags::SYN)) {
                entry.outbound.pop_front();
            }
            entry.last_ack_seq = packet.ack;
            entry.update_outgoing_window(packet.seq, packet.ack, packet.window);
            entry.local_state = LocalState::Established;
            entry.local_action_time = now;
            entry.last_ack_time = now;
            debug!(id = entry.id(), "connection established with host");
            match entry.remote_state {
                RemoteState::ConnEstablished
                | RemoteState::DisconnRequestSent
                | RemoteState::DisconnRequestReceived => {}
                RemoteState::ConnRequestReceived => self.send_opened(entry, now)?,
                _ => {
                    let err = Error::Inconsistent {
                        local: entry.local_state,
                        remote: entry.remote_state,
                    };
                    self.abort(entry, true, now);
                    return Err(err);
                }
            }
            wake |= Wake::HOST;
        } else if seq::le(entry.last_ack_seq, packet.ack) && seq::le(packet.ack, entry.out_seq) {
            let before = entry.outbound.len();
            entry.local_action_time = now;
            entry.last_ack_time = now;
            entry.update_outgoing_window(packet.seq, packet.ack, packet.window);
            entry.last_ack_seq = seq::max(entry.last_ack_seq, packet.ack);
            entry.ack_outgoing_data_upto(packet.ack, &self.config);
            if packet.ack == entry.out_seq {
                self.on_everything_acked(entry);
            }
            if entry.outbound.len() != before || !entry.outbound.is_empty() {
                wake |= Wake::HOST;
            }
        } else if seq::lt(packet.ack, entry.last_ack_seq) {
            trace!(id = entry.id(), ack = packet.ack, "duplicate ack");
            return Ok(Wake::NONE);
        } else {
            trace!(id = entry.id(), ack = packet.ack, out = entry.out_seq, "ack for unsent data");
            self.send_ack(entry)?;
            return Ok(Wake::NONE);
        }

        if !packet.payload.is_empty() {
            wake |= self.on_host_data(entry, packet, now)?;
        }
        if flags.contains(TcpFlags::FIN) {
            wake |= self.on_host_fin(entry, packet, now)?;
        }
        Ok(wake)
    }

    /// Everything up to `out_seq` is acknowledged, including our FIN if it was sent
    fn on_everything_acked(&self, entry: &mut Entry) {
        let fin_sent = entry
            .outbound
            .front()
            .map_or(false, |s| is_marker(s, TcpFlags::FIN) && s.last_transmit().is_some());
        if !fin_sent {
            return;
        }
        match entry.local_state.on_fin_acked() {
            Transition::To(state) => {
                entry.outbound.pop_front();
                debug!(id = entry.id(), from = %entry.local_state, to = %state, "FIN acknowledged");
                entry.local_state = state;
            }
            Transition::Ignore | Transition::Inconsistent => {}
        }
    }

    fn on_host_reset(&self, entry: &mut Entry, now: Instant) {
        info!(id = entry.id(), state = %entry.local_state, "host reset connection");
        let finished = matches!(
            entry.local_state,
            LocalState::Closing | LocalState::TimeWait | LocalState::LastAck
        );
        if finished && entry.remote_state == RemoteState::DisconnRequestReceived {
            // The host already sent everything; the peer only waits for our close
            if let Err(e) = self.try_flush_and_close(entry) {
                debug!(id = entry.id(), "failed to send close request: {}", e);
            }
            entry.remote_state = RemoteState::Disconnected;
        }
        self.teardown(entry, true, now);
    }

    fn on_host_data(
        &self,
        entry: &mut Entry,
        packet: &TcpPacket<'_>,
        now: Instant,
    ) -> Result<Wake, Error> {
        if !entry.local_state.accepts_data() {
            trace!(id = entry.id(), state = %entry.local_state, "discarding host data");
            return Ok(Wake::NONE);
        }
        let had_holes = entry.inbound.has_holes();
        let mut segment = packet.segment();
        segment.set_flags(packet.flags & TcpFlags::MERGEABLE);
        entry.inbound.insert(&segment, false)?;
        entry.local_action_time = now;

        let unacked = seq::distance(entry.last_acked_seq, entry.next_expected()) as usize;
        let ack_now = seq::gt(packet.seq, entry.last_acked_seq)
            || packet.flags.contains(TcpFlags::PSH)
            || had_holes
            || unacked > self.config.max_unacked;
        if ack_now && !packet.flags.contains(TcpFlags::FIN) {
            self.send_ack(entry)?;
        }
        Ok(Wake::TUNNEL)
    }

    fn on_host_fin(
        &self,
        entry: &mut Entry,
        packet: &TcpPacket<'_>,
        now: Instant,
    ) -> Result<Wake, Error> {
        let fin_seq = packet.seq.wrapping_add(packet.payload.len() as u32);
        let marker = Segment::marker(fin_seq, TcpFlags::FIN | TcpFlags::ACK);

        if fin_seq != entry.next_expected() {
            if seq::gt(fin_seq, entry.next_expected()) && entry.local_state.accepts_data() {
                // Remember it until the data before it arrives
                entry.inbound.insert(&marker, false)?;
            }
            self.send_ack(entry)?;
            return Ok(Wake::NONE);
        }

        let next = match entry.local_state.on_fin_received() {
            Transition::To(state) => state,
            Transition::Ignore => {
                self.send_ack(entry)?;
                return Ok(Wake::NONE);
            }
            Transition::Inconsistent => return Ok(Wake::NONE),
        };

        let drained = entry.inbound.is_empty() && entry.pending.is_none() && !entry.has_surplus();
        if drained {
            self.flush_and_close(entry, now)?;
        } else {
            // Travels to the peer behind the data still buffered
            entry.inbound.insert(&marker, false)?;
        }
        entry.inbound.advance_next_expected(1);
        self.send_ack(entry)?;
        debug!(id = entry.id(), from = %entry.local_state, to = %next, "host finished sending");
        entry.local_state = next;
        entry.local_action_time = now;
        Ok(Wake::TUNNEL)
    }
}
