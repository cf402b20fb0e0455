use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{is_marker, Engine, Error};
use crate::{
    entry::{Entry, LocalState, RemoteState, Segment, Transition},
    seq,
    tunnel::{ControlMessage, DataMessage, TunnelError, TunnelStatus},
    TcpFlags,
};

impl Engine {
    /// One pass of the local-delivery scheduler over `entry`
    ///
    /// Retransmits the SYN on its schedule, sends queued segments that fit the host's window,
    /// retransmits those whose RTO expired, probes a closed window, sends or retransmits the FIN
    /// and acknowledges data the host is still waiting to hear about.
    pub fn deliver_to_host(&self, entry: &mut Entry, now: Instant) -> Result<(), Error> {
        let tunnel_down = entry.tunnel.as_ref().map_or(true, |t| {
            matches!(t.status(), TunnelStatus::Failed | TunnelStatus::Closed)
        });
        if tunnel_down && entry.remote_state.is_open() {
            debug!(id = entry.id(), "tunnel lost");
            self.abort(entry, false, now);
            return Err(Error::NoTunnel);
        }

        if let Some(sent) = entry.outbound.front().and_then(Segment::last_transmit) {
            if sent.saturating_duration_since(entry.last_ack_time) > self.config.msl {
                warn!(id = entry.id(), "host stopped acknowledging");
                self.abort(entry, true, now);
                return Err(Error::TimedOut);
            }
        }

        if entry.local_state == LocalState::SynSent {
            return self.retransmit_syn(entry, now);
        }

        let mut index = 0;
        if entry.local_state.may_transmit() {
            index = self.transmit_segments(entry, now)?;
        }
        if entry.outbound.get(index).map_or(false, |s| is_marker(s, TcpFlags::FIN)) {
            self.transmit_fin(entry, index, now)?;
        }

        if entry.outbound.is_empty() {
            self.check_idle(entry, now)?;
        }
        if entry.local_state == LocalState::Closed {
            return Ok(());
        }

        let waiting = seq::lt(entry.last_acked_seq, entry.next_expected());
        let acks = matches!(
            entry.local_state,
            LocalState::Established | LocalState::FinWait1 | LocalState::FinWait2
        );
        if waiting && acks {
            self.send_ack(entry)?;
        }
        Ok(())
    }

    fn retransmit_syn(&self, entry: &mut Entry, now: Instant) -> Result<(), Error> {
        let elapsed = now.saturating_duration_since(entry.local_action_time);
        if elapsed >= self.config.syn_sent_timeout {
            debug!(id = entry.id(), "host never answered SYN");
            self.abort(entry, true, now);
            return Err(Error::TimedOut);
        }
        if elapsed < syn_due(&self.config.syn_retransmissions, entry.retransmissions) {
            return Ok(());
        }
        trace!(id = entry.id(), attempt = entry.retransmissions + 1, "retransmitting SYN");
        self.send(entry, TcpFlags::SYN, entry.starting_out_seq, &[])?;
        entry.retransmissions += 1;
        if let Some(syn) = entry.outbound.front_mut() {
            syn.set_last_transmit(now);
        }
        entry.last_ack_time = now;
        Ok(())
    }

    /// Send or retransmit data segments; returns the index of the first segment not handled
    fn transmit_segments(&self, entry: &mut Entry, now: Instant) -> Result<usize, Error> {
        let mut index = 0;
        while index < entry.outbound.len() {
            let segment = &entry.outbound[index];
            if segment.is_empty() {
                if segment.flags().contains(TcpFlags::FIN) {
                    break;
                }
                index += 1;
                continue;
            }
            let due = segment
                .last_transmit()
                .map_or(true, |at| now.saturating_duration_since(at) > entry.rto);
            if !due {
                index += 1;
                continue;
            }

            let fits = seq::distance(entry.last_ack_seq, segment.following_seq())
                <= u32::from(entry.receiver_window);
            if !fits {
                self.probe_window(entry, now)?;
                break;
            }

            let retransmission = segment.last_transmit().is_some();
            let following = segment.following_seq();
            let header = self.header(entry, segment.flags() | TcpFlags::ACK, segment.seq());
            self.emit(&header, entry.outbound[index].data())?;
            entry.last_acked_seq = header.ack;
            if retransmission {
                trace!(id = entry.id(), seq = header.seq, rto = ?entry.rto, "retransmission");
                entry.back_off(&self.config);
            }
            entry.out_seq = seq::max(entry.out_seq, following);
            entry.outbound[index].set_last_transmit(now);
            entry.local_action_time = now;
            index += 1;
        }
        Ok(index)
    }

    /// Poke a host that advertised a zero window, at most once per RTO
    fn probe_window(&self, entry: &mut Entry, now: Instant) -> Result<(), Error> {
        if entry.receiver_window != 0 {
            return Ok(());
        }
        if let Some(at) = entry.last_probe {
            if now.saturating_duration_since(at) <= entry.rto {
                return Ok(());
            }
        }
        let at = entry.last_ack_seq;
        let Some(octet) = entry.outbound.iter().find_map(|s| s.octet_at(at)) else {
            return Ok(());
        };
        entry.back_off(&self.config);
        trace!(id = entry.id(), seq = at, "window probe");
        self.send(entry, TcpFlags::PSH | TcpFlags::ACK, at, &[octet])?;
        entry.out_seq = seq::max(entry.out_seq, at.wrapping_add(1));
        entry.last_probe = Some(now);
        Ok(())
    }

    fn transmit_fin(&self, entry: &mut Entry, index: usize, now: Instant) -> Result<(), Error> {
        let fin = &entry.outbound[index];
        let fin_seq = fin.seq();
        let sent = fin.last_transmit();
        match sent {
            None if !matches!(
                entry.local_state,
                LocalState::Established | LocalState::CloseWait
            ) =>
            {
                return Ok(())
            }
            Some(at) if now.saturating_duration_since(at) <= entry.rto => return Ok(()),
            _ => {}
        }

        self.send(entry, TcpFlags::FIN | TcpFlags::ACK, fin_seq, &[])?;
        entry.outbound[index].set_last_transmit(now);
        entry.local_action_time = now;
        match entry.local_state.on_fin_sent() {
            Transition::To(state) => {
                debug!(id = entry.id(), from = %entry.local_state, to = %state, "FIN sent to host");
                entry.local_state = state;
                entry.out_seq = fin_seq.wrapping_add(1);
            }
            Transition::Ignore => entry.back_off(&self.config),
            Transition::Inconsistent => {}
        }
        Ok(())
    }

    fn check_idle(&self, entry: &mut Entry, now: Instant) -> Result<(), Error> {
        let quiet = now.saturating_duration_since(entry.local_action_time);
        if quiet > self.config.idle_retransmit
            && entry.inbound.has_holes()
            && entry.inbound.ready_bytes() == 0
        {
            // Remind the host of the hole at the start of the window
            self.send_ack(entry)?;
            entry.local_action_time = now;
        }

        let last_activity = entry
            .local_action_time
            .max(entry.remote_action_time)
            .max(entry.idle_since);
        if now.saturating_duration_since(last_activity) > self.config.idle_timeout {
            let alive = entry.tunnel.as_ref().map_or(false, |t| {
                matches!(t.status(), TunnelStatus::Connected | TunnelStatus::Connecting)
            });
            if !alive {
                debug!(id = entry.id(), "idle connection without tunnel");
                self.abort(entry, false, now);
                return Err(Error::TimedOut);
            }
            trace!(id = entry.id(), "connection idle");
            entry.idle_since = now;
        }
        Ok(())
    }

    /// One visit of the tunnel transmitter to `entry`
    ///
    /// Sends a pending open request or confirmation, then forwards ready host data until the
    /// tunnel pushes back, and finally tells the host about a window that reopened.
    pub fn drain_to_tunnel(&self, entry: &mut Entry, now: Instant) -> Result<(), Error> {
        let Some(tunnel) = entry.tunnel.clone() else {
            self.abort(entry, false, now);
            return Err(Error::NoTunnel);
        };
        let status = tunnel.status();
        if matches!(status, TunnelStatus::Failed | TunnelStatus::Closed) {
            self.abort(entry, false, now);
            return Err(Error::NoTunnel);
        }
        let establishing = matches!(
            entry.remote_state,
            RemoteState::WaitingEstablishment | RemoteState::ConnRequestSent
        );
        if establishing
            && now.saturating_duration_since(entry.remote_action_time)
                > self.config.establishment_timeout
        {
            debug!(id = entry.id(), "peer never confirmed connection");
            self.abort(entry, true, now);
            return Err(Error::TimedOut);
        }
        if status == TunnelStatus::Connecting || !tunnel.accepts_data() {
            return Ok(());
        }

        match entry.remote_state {
            RemoteState::WaitingEstablishment => {
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
                entry.remote_action_time = now;
                return Ok(());
            }
            // The host may already have sent its FIN by the time the entry is first seen here
            RemoteState::ConnRequestReceived
                if matches!(
                    entry.local_state,
                    LocalState::Established | LocalState::CloseWait
                ) =>
            {
                self.send_opened(entry, now)?;
            }
            _ => {}
        }

        let start = entry.inbound.remaining_space_percentage();
        while tunnel.accepts_data()
            && (entry.pending.is_some() || entry.has_surplus() || entry.inbound.is_ready())
        {
            if !entry.remote_state.accepts_data() {
                if matches!(
                    entry.remote_state,
                    RemoteState::WaitingEstablishment | RemoteState::ConnRequestSent
                ) {
                    break;
                }
                if entry.inbound.total_bytes() > 0 || entry.pending.is_some() {
                    let err = Error::Inconsistent {
                        local: entry.local_state,
                        remote: entry.remote_state,
                    };
                    self.abort(entry, true, now);
                    return Err(err);
                }
                // Only flag records are left; nobody will read them
                if let Err(e) = entry.dequeue_locally_received_data(self.config.max_payload) {
                    debug!(id = entry.id(), "discarding flag records: {}", e);
                }
                continue;
            }

            let data = match entry.pending.take() {
                Some(data) => data,
                None => match entry.dequeue_locally_received_data(self.config.max_payload) {
                    Ok(Some(data)) => data,
                    Ok(None) => break,
                    Err(e) => {
                        self.abort(entry, true, now);
                        return Err(e.into());
                    }
                },
            };

            if !data.is_empty() {
                let message = DataMessage {
                    local_id: entry.id(),
                    remote_id: entry.remote_id,
                    flags: data.flags() & TcpFlags::MERGEABLE,
                    data: data.data(),
                };
                match tunnel.send_data(&message) {
                    Ok(()) => entry.remote_action_time = now,
                    Err(TunnelError::WouldBlock) => {
                        entry.pending = Some(data);
                        break;
                    }
                    Err(e) => {
                        self.abort(entry, true, now);
                        return Err(e.into());
                    }
                }
            }

            if data.flags().contains(TcpFlags::FIN) {
                if entry.local_state.accepts_data() {
                    // A FIN that arrived ahead of its data is only now in order
                    if let Transition::To(state) = entry.local_state.on_fin_received() {
                        entry.inbound.advance_next_expected(1);
                        self.send_ack(entry)?;
                        debug!(
                            id = entry.id(),
                            from = %entry.local_state,
                            to = %state,
                            "host finished sending"
                        );
                        entry.local_state = state;
                        entry.local_action_time = now;
                    }
                }
                self.flush_and_close(entry, now)?;
                break;
            }
        }

        let reopened = entry.inbound.remaining_space_percentage();
        let threshold = usize::from(self.config.window_update_threshold);
        let acks = matches!(
            entry.local_state,
            LocalState::Established | LocalState::FinWait1 | LocalState::FinWait2
        );
        if acks && start < threshold && reopened >= threshold {
            trace!(id = entry.id(), free = reopened, "window update");
            self.send_ack(entry)?;
        }
        Ok(())
    }

    /// Whether a finished entry may be returned to the unused pool
    ///
    /// TimeWait lasts twice the MSL. Closed entries, and TimeWait entries with nothing left
    /// to deliver, go once they have been quiet for `linger`.
    pub fn is_reclaimable(&self, entry: &Entry, now: Instant, linger: Duration) -> bool {
        let quiet = now.saturating_duration_since(entry.local_action_time);
        match entry.local_state {
            LocalState::TimeWait => {
                let finished = matches!(
                    entry.remote_state,
                    RemoteState::Disconnected | RemoteState::Unknown
                ) && entry.outbound.is_empty();
                quiet > self.config.msl * 2 || (finished && quiet > linger)
            }
            LocalState::Closed => quiet > linger,
            _ => false,
        }
    }

    /// Whether the tunnel transmitter serves `entry` in the sweep whose highest priority is
    /// `highest`
    ///
    /// Always serves when prioritization is disabled. See [`Entry::take_turn`].
    pub fn take_turn(&self, entry: &mut Entry, highest: u8) -> Option<u8> {
        if !self.config.prioritization {
            return Some(entry.priority());
        }
        entry.take_turn(highest)
    }
}

/// Delay after the first SYN at which attempt number `attempt + 1` is due
fn syn_due(schedule: &[Duration], attempt: usize) -> Duration {
    match schedule.get(attempt) {
        Some(delay) => *delay,
        None => {
            let last = schedule.last().copied().unwrap_or(Duration::from_secs(1));
            last * (attempt - schedule.len() + 2) as u32
        }
    }
}
