use std::{sync::Arc, time::Instant};

use bytes::BytesMut;
use tracing::{debug, info, trace, warn};

use super::{Engine, Error, Wake};
use crate::{
    codec::Compression,
    entry::{Entry, LocalState, RemoteState, Segment, Transition},
    tunnel::{ControlMessage, Tunnel, TunnelStatus},
    TcpFlags,
};

impl Engine {
    /// The peer asks us to open a connection to the host at `entry.local_addr()`
    ///
    /// `tunnel` is the tunnel the request arrived on. The host is sent a SYN; the peer hears
    /// back once the host answers.
    pub fn open_to_host(
        &self,
        entry: &mut Entry,
        tunnel: Arc<dyn Tunnel>,
        remote_id: u16,
        compression: Compression,
        now: Instant,
    ) -> Result<Wake, Error> {
        let reusable = match entry.local_state {
            LocalState::Listen | LocalState::Closed => true,
            LocalState::TimeWait => self.config.ignore_time_wait,
            _ => false,
        };
        if !reusable {
            warn!(id = entry.id(), state = %entry.local_state, "open request for busy connection");
            refuse(&tunnel, entry.id(), remote_id);
            let state = entry.local_state;
            self.abort(entry, true, now);
            return Err(Error::InvalidState(state));
        }
        if entry.local_state == LocalState::TimeWait {
            entry.reset(now);
        }

        let Some(route) = self.mapper.route(entry.remote, entry.local) else {
            info!(src = %entry.remote, dst = %entry.local, "no route for peer connection");
            refuse(&tunnel, entry.id(), remote_id);
            entry.reset(now);
            return Err(Error::NoRoute(entry.local));
        };
        if matches!(tunnel.status(), TunnelStatus::Failed | TunnelStatus::Closed) {
            entry.reset(now);
            return Err(Error::NoTunnel);
        }
        let codecs = self
            .codecs
            .writer(route.compression)
            .and_then(|w| Ok((w, self.codecs.reader(compression)?)));
        let (writer, reader) = match codecs {
            Ok(pair) => pair,
            Err(e) => {
                refuse(&tunnel, entry.id(), remote_id);
                entry.reset(now);
                return Err(e.into());
            }
        };

        entry.prepare_new_connection();
        entry.remote_id = remote_id;
        entry.remote_state = RemoteState::ConnRequestReceived;
        entry.peer = Some(route.peer);
        entry.assigned_priority = route.priority;
        entry.current_priority = route.priority;
        entry.compression = route.compression;
        entry.writer = Some(writer);
        entry.reader = Some(reader);
        entry.tunnel = Some(tunnel);
        entry.remote_action_time = now;

        let mut syn = Segment::marker(entry.out_seq, TcpFlags::SYN);
        syn.set_last_transmit(now);
        entry.outbound.push_back(syn);
        entry.local_state = LocalState::SynSent;
        entry.local_action_time = now;
        entry.last_ack_time = now;
        entry.retransmissions = 0;
        if let Err(e) = self.send(entry, TcpFlags::SYN, entry.out_seq, &[]) {
            self.abort(entry, true, now);
            return Err(e);
        }
        entry.out_seq = entry.out_seq.wrapping_add(1);
        info!(
            id = entry.id(),
            remote_id,
            src = %entry.remote,
            dst = %entry.local,
            "peer opened connection"
        );
        Ok(Wake::HOST)
    }

    /// The peer confirms the connection our host asked for
    ///
    /// The host finally gets its SYN+ACK.
    pub fn confirm_opened(
        &self,
        entry: &mut Entry,
        remote_id: u16,
        compression: Compression,
        now: Instant,
    ) -> Result<Wake, Error> {
        match entry.remote_state.on_open_confirmed() {
            Transition::To(state) => entry.remote_state = state,
            Transition::Ignore => {}
            Transition::Inconsistent => {
                let err = Error::Inconsistent {
                    local: entry.local_state,
                    remote: entry.remote_state,
                };
                self.abort(entry, true, now);
                return Err(err);
            }
        }
        entry.remote_id = remote_id;
        entry.remote_action_time = now;
        match self.codecs.reader(compression) {
            Ok(reader) => entry.reader = Some(reader),
            Err(e) => {
                self.abort(entry, true, now);
                return Err(e.into());
            }
        }

        if entry.local_state != LocalState::SynRcvd {
            let err = Error::InvalidState(entry.local_state);
            self.abort(entry, true, now);
            return Err(err);
        }
        if let Err(e) = self.send(entry, TcpFlags::SYN | TcpFlags::ACK, entry.out_seq, &[]) {
            self.abort(entry, true, now);
            return Err(e);
        }
        entry.out_seq = entry.out_seq.wrapping_add(1);
        entry.local_action_time = now;
        debug!(id = entry.id(), remote_id, "peer confirmed connection");
        Ok(Wake::NONE)
    }

    /// Queue data from the peer for delivery to the host
    ///
    /// `data` is decoded with the connection's reader and cut into segments of at most one
    /// MSS. A trailing PSH wakes the local-delivery scheduler.
    pub fn data_to_host(
        &self,
        entry: &mut Entry,
        data: &[u8],
        flags: TcpFlags,
        now: Instant,
    ) -> Result<Wake, Error> {
        match entry.local_state {
            LocalState::SynSent
            | LocalState::SynRcvd
            | LocalState::Established
            | LocalState::CloseWait => {}
            LocalState::Unused | LocalState::Listen => {
                return Err(Error::InvalidState(entry.local_state))
            }
            state => {
                self.abort(entry, true, now);
                return Err(Error::InvalidState(state));
            }
        }
        if !entry.remote_state.delivers_data() {
            let err = Error::Inconsistent {
                local: entry.local_state,
                remote: entry.remote_state,
            };
            self.abort(entry, true, now);
            return Err(err);
        }

        let mut decoded = BytesMut::with_capacity(data.len());
        let result = match entry.reader.as_mut() {
            Some(reader) => reader.read(data, &mut decoded),
            None => {
                decoded.extend_from_slice(data);
                Ok(())
            }
        };
        if let Err(e) = result {
            self.abort(entry, true, now);
            return Err(e.into());
        }

        entry.remote_action_time = now;
        if entry.outbound.is_empty() && entry.inbound.is_empty() {
            entry.local_action_time = now;
        }
        if decoded.is_empty() {
            return Ok(Wake::NONE);
        }

        let flags = (flags & TcpFlags::MERGEABLE) | TcpFlags::ACK;
        let mss = self.config.max_segment_size();
        let mut next_seq = Self::next_outbound_seq(entry);
        let mut rest = &decoded[..];
        if let Some(back) = entry.outbound.back_mut() {
            let room = mss.saturating_sub(back.len() as usize);
            if back.can_append() && room > 0 {
                let take = rest.len().min(room);
                back.append(&rest[..take]);
                rest = &rest[take..];
                if rest.is_empty() {
                    back.add_flags(flags);
                }
                next_seq = back.following_seq();
            }
        }
        while !rest.is_empty() {
            let take = rest.len().min(mss);
            let segment_flags = match take == rest.len() {
                true => flags,
                false => TcpFlags::ACK,
            };
            let segment = Segment::owned(next_seq, segment_flags, BytesMut::from(&rest[..take]));
            next_seq = segment.following_seq();
            entry.outbound.push_back(segment);
            rest = &rest[take..];
        }
        trace!(
            id = entry.id(),
            len = decoded.len(),
            queued = entry.outbound.len(),
            "peer data queued"
        );

        let deliverable = matches!(
            entry.local_state,
            LocalState::Established | LocalState::CloseWait
        );
        match deliverable && flags.contains(TcpFlags::PSH) {
            true => Ok(Wake::HOST),
            false => Ok(Wake::NONE),
        }
    }

    /// The peer will send no more data
    ///
    /// A FIN is queued behind whatever data the host has yet to receive.
    pub fn close_to_host(&self, entry: &mut Entry, now: Instant) -> Result<Wake, Error> {
        match entry.remote_state.on_close_received() {
            Transition::To(state) => {
                debug!(
                    id = entry.id(),
                    from = %entry.remote_state,
                    to = %state,
                    "peer finished sending"
                );
                entry.remote_state = state;
                if state == RemoteState::Disconnected {
                    entry.writer = None;
                    entry.reader = None;
                }
            }
            Transition::Ignore => return Ok(Wake::NONE),
            Transition::Inconsistent => {
                let err = Error::Inconsistent {
                    local: entry.local_state,
                    remote: entry.remote_state,
                };
                self.abort(entry, true, now);
                return Err(err);
            }
        }
        entry.remote_action_time = now;

        match entry.local_state {
            LocalState::SynSent
            | LocalState::SynRcvd
            | LocalState::Established
            | LocalState::CloseWait => {}
            _ => return Ok(Wake::NONE),
        }
        let fin_seq = Self::next_outbound_seq(entry);
        let mut fin = Segment::marker(fin_seq, TcpFlags::FIN | TcpFlags::ACK);
        let sendable = matches!(
            entry.local_state,
            LocalState::Established | LocalState::CloseWait
        );
        if !entry.outbound.is_empty() || !sendable {
            entry.outbound.push_back(fin);
            return Ok(Wake::HOST);
        }

        self.send(entry, TcpFlags::FIN | TcpFlags::ACK, fin_seq, &[])?;
        fin.set_last_transmit(now);
        entry.outbound.push_back(fin);
        entry.out_seq = fin_seq.wrapping_add(1);
        if let Transition::To(state) = entry.local_state.on_fin_sent() {
            debug!(id = entry.id(), from = %entry.local_state, to = %state, "FIN sent to host");
            entry.local_state = state;
        }
        entry.local_action_time = now;
        Ok(Wake::NONE)
    }

    /// The peer aborted the connection
    pub fn reset_to_host(&self, entry: &mut Entry, now: Instant) -> Result<(), Error> {
        info!(id = entry.id(), state = %entry.local_state, "peer reset connection");
        entry.remote_state = RemoteState::Disconnected;
        match entry.local_state {
            LocalState::Unused | LocalState::Listen | LocalState::Closed => Ok(()),
            LocalState::LastAck | LocalState::Closing => {
                let state = entry.local_state;
                self.abort(entry, false, now);
                Err(Error::InvalidState(state))
            }
            _ => {
                self.abort(entry, false, now);
                Ok(())
            }
        }
    }
}

/// Tell the peer we will not open the connection it asked for
fn refuse(tunnel: &Arc<dyn Tunnel>, local_id: u16, remote_id: u16) {
    if tunnel.status() != TunnelStatus::Connected {
        return;
    }
    let message = ControlMessage::Reset {
        local_id,
        remote_id,
    };
    if let Err(e) = tunnel.send_control(&message) {
        warn!(remote_id, "failed to refuse connection: {}", e);
    }
}
