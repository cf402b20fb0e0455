use std::{
    collections::VecDeque,
    fmt,
    net::{SocketAddr, SocketAddrV4},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use tracing::trace;

use crate::{
    codec::{CodecError, CodecReader, CodecWriter, Compression},
    config::RelayConfig,
    seq,
    tunnel::Tunnel,
    TcpFlags,
};

mod buffer;
pub use buffer::{InsertError, RemoveError};
pub(crate) use buffer::ReassemblyBuffer;

mod segment;
pub use segment::Segment;

mod state;
pub use state::{LocalState, RemoteState, Transition};

/// Everything the relay knows about one proxied TCP connection
///
/// `local` is the address of the host on our side of the relay, `remote` the address of the
/// far end as presented to that host. Frames sent to the host go from `remote` to `local`.
pub struct Entry {
    id: u16,
    pub(crate) remote_id: u16,
    pub(crate) local: SocketAddrV4,
    pub(crate) remote: SocketAddrV4,
    pub(crate) local_state: LocalState,
    pub(crate) remote_state: RemoteState,

    pub(crate) starting_in_seq: u32,
    pub(crate) starting_out_seq: u32,
    /// Next sequence number we will use toward the host
    pub(crate) out_seq: u32,
    /// Highest acknowledgment number received from the host
    pub(crate) last_ack_seq: u32,
    /// `next_expected` as of the last ACK we sent
    pub(crate) last_acked_seq: u32,
    /// Sequence number of the segment that last updated the window
    pub(crate) window_seq: u32,
    pub(crate) receiver_window: u16,

    pub(crate) rto: Duration,
    pub(crate) srtt: Duration,
    pub(crate) retransmissions: usize,
    pub(crate) local_action_time: Instant,
    pub(crate) remote_action_time: Instant,
    pub(crate) last_ack_time: Instant,
    pub(crate) idle_since: Instant,
    last_rto_calculation: Option<Instant>,

    pub(crate) inbound: ReassemblyBuffer,
    pub(crate) outbound: VecDeque<Segment<'static>>,
    /// Encoded bytes dequeued from `inbound` that did not fit the last tunnel message
    surplus: Option<Segment<'static>>,
    /// Message that the tunnel refused to queue, retried first
    pub(crate) pending: Option<Segment<'static>>,

    pub(crate) tunnel: Option<Arc<dyn Tunnel>>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) writer: Option<Box<dyn CodecWriter>>,
    pub(crate) reader: Option<Box<dyn CodecReader>>,
    /// Compression our writer produces, announced to the peer
    pub(crate) compression: Compression,
    /// Last zero-window probe sent to the host
    pub(crate) last_probe: Option<Instant>,
    pub(crate) assigned_priority: u8,
    pub(crate) current_priority: u8,

    rto_lower_bound: Duration,
}

impl Entry {
    /// An unused slot with the given (nonzero) id
    pub fn new(id: u16, config: &RelayConfig, now: Instant) -> Self {
        Self {
            id,
            remote_id: 0,
            local: unspecified(),
            remote: unspecified(),
            local_state: LocalState::Unused,
            remote_state: RemoteState::Unknown,
            starting_in_seq: 0,
            starting_out_seq: 0,
            out_seq: 0,
            last_ack_seq: 0,
            last_acked_seq: 0,
            window_seq: 0,
            receiver_window: 0,
            rto: config.rto_lower_bound,
            srtt: config.rto_lower_bound,
            retransmissions: 0,
            local_action_time: now,
            remote_action_time: now,
            last_ack_time: now,
            idle_since: now,
            last_rto_calculation: None,
            inbound: ReassemblyBuffer::new(config.buffer_min_size, config.buffer_max_size),
            outbound: VecDeque::new(),
            surplus: None,
            pending: None,
            tunnel: None,
            peer: None,
            writer: None,
            reader: None,
            compression: Compression::NONE,
            last_probe: None,
            assigned_priority: 0,
            current_priority: 0,
            rto_lower_bound: config.rto_lower_bound,
        }
    }

    /// Virtual id of the connection on this relay
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Virtual id of the connection on the remote relay, 0 until known
    pub fn remote_id(&self) -> u16 {
        self.remote_id
    }

    /// Address of the host on our side
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// Address of the far end
    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.remote
    }

    /// State mirrored from the local host
    pub fn local_state(&self) -> LocalState {
        self.local_state
    }

    /// State of the tunnel-side connection
    pub fn remote_state(&self) -> RemoteState {
        self.remote_state
    }

    /// Claim an unused slot for the connection between `local` and `remote`
    pub fn claim(&mut self, local: SocketAddrV4, remote: SocketAddrV4) {
        debug_assert_eq!(self.local_state, LocalState::Unused);
        self.local = local;
        self.remote = remote;
        self.local_state = LocalState::Listen;
    }

    /// Whether this entry tracks the given connection
    pub fn matches(&self, local: SocketAddrV4, remote: SocketAddrV4) -> bool {
        self.local_state != LocalState::Unused && self.local == local && self.remote == remote
    }

    /// Whether the entry is free for reuse
    pub fn is_unused(&self) -> bool {
        self.local_state == LocalState::Unused
    }

    /// Whether the local-delivery scheduler has work on this entry
    pub fn is_active_local(&self) -> bool {
        self.local_state.is_active()
    }

    /// Whether the tunnel transmitter has work on this entry
    pub fn is_active_remote(&self) -> bool {
        self.local_state.is_active()
            && (self.remote_state != RemoteState::Unknown || !self.inbound.is_empty())
    }

    /// Whether the entry is finished and waits to be reclaimed
    pub fn is_closed(&self) -> bool {
        matches!(self.local_state, LocalState::TimeWait | LocalState::Closed)
    }

    /// Scheduling weight assigned from the route
    pub fn priority(&self) -> u8 {
        self.assigned_priority
    }

    /// Wipe everything back to an unused slot
    pub fn clear(&mut self, now: Instant) {
        if self.local_state == LocalState::Unused && self.remote_state == RemoteState::Unknown {
            return;
        }
        self.local_state = LocalState::Unused;
        self.remote_state = RemoteState::Unknown;
        self.remote_id = 0;
        self.local = unspecified();
        self.remote = unspecified();
        self.starting_in_seq = 0;
        self.starting_out_seq = 0;
        self.out_seq = 0;
        self.last_ack_seq = 0;
        self.last_acked_seq = 0;
        self.window_seq = 0;
        self.receiver_window = 0;
        self.rto = self.rto_lower_bound;
        self.srtt = self.rto_lower_bound;
        self.retransmissions = 0;
        self.local_action_time = now;
        self.remote_action_time = now;
        self.last_ack_time = now;
        self.idle_since = now;
        self.last_rto_calculation = None;
        self.assigned_priority = 0;
        self.current_priority = 0;
        self.peer = None;
        self.compression = Compression::NONE;
        self.release_memory();
    }

    /// Mark the connection closed on both sides, dropping buffers and collaborators
    ///
    /// The slot stays claimed until the reclaimer clears it.
    pub fn reset(&mut self, now: Instant) {
        if self.local_state == LocalState::Unused {
            return;
        }
        if self.local_state == LocalState::Closed && self.remote_state == RemoteState::Disconnected
        {
            return;
        }
        trace!(
            id = self.id,
            remote_id = self.remote_id,
            local = %self.local_state,
            remote = %self.remote_state,
            "entry reset"
        );
        self.local_state = LocalState::Closed;
        self.remote_state = RemoteState::Disconnected;
        self.local_action_time = now;
        self.release_memory();
    }

    fn release_memory(&mut self) {
        self.inbound.reset();
        self.outbound.clear();
        self.surplus = None;
        self.pending = None;
        self.tunnel = None;
        self.writer = None;
        self.reader = None;
        self.last_probe = None;
    }

    /// Pick a fresh initial sequence number toward the host
    pub(crate) fn prepare_new_connection(&mut self) {
        self.out_seq = rand::random::<u32>();
        self.starting_out_seq = self.out_seq;
        self.last_ack_seq = self.out_seq;
        self.outbound.clear();
    }

    pub(crate) fn next_expected(&self) -> u32 {
        self.inbound.next_expected()
    }

    /// Window advertised to the host
    pub(crate) fn advertised_window(&self) -> u16 {
        self.inbound.remaining_space().min(usize::from(u16::MAX)) as u16
    }

    /// Drop queued segments the host has acknowledged
    ///
    /// Zero-length records (SYN and FIN) are left for the caller. Returns the number of
    /// segments removed. The transmit time of the last covered segment feeds the RTT estimate,
    /// at most once per recalculation interval.
    pub(crate) fn ack_outgoing_data_upto(&mut self, ack: u32, config: &RelayConfig) -> usize {
        let mut acked = 0;
        let mut last_transmit = None;
        while let Some(front) = self.outbound.front_mut() {
            if front.is_empty() {
                break;
            }
            if seq::le(front.following_seq(), ack) {
                last_transmit = front.last_transmit();
                self.outbound.pop_front();
                acked += 1;
                continue;
            }
            if seq::lt(front.seq(), ack) {
                front.trim_front(seq::distance(front.seq(), ack));
                last_transmit = front.last_transmit();
            }
            break;
        }

        if let Some(sent) = last_transmit {
            let due = self.last_rto_calculation.map_or(true, |at| {
                self.last_ack_time.saturating_duration_since(at) >= config.rto_recalculation
            });
            if due {
                self.calculate_rto(self.last_ack_time.saturating_duration_since(sent), config);
                self.last_rto_calculation = Some(self.last_ack_time);
            }
        }
        acked
    }

    /// Fold an RTT sample into SRTT and derive the RTO from it
    pub(crate) fn calculate_rto(&mut self, rtt: Duration, config: &RelayConfig) {
        self.srtt = self.srtt.mul_f32(config.alpha) + rtt.mul_f32(1.0 - config.alpha);
        self.rto = self
            .srtt
            .mul_f32(config.beta)
            .clamp(config.rto_lower_bound, config.rto_upper_bound);
        trace!(id = self.id, ?rtt, srtt = ?self.srtt, rto = ?self.rto, "rto updated");
    }

    /// Exponential backoff after a retransmission
    pub(crate) fn back_off(&mut self, config: &RelayConfig) {
        let upper = config.rto_upper_bound;
        if self.srtt.is_zero() {
            self.srtt = config.rto_lower_bound;
        } else if self.srtt > upper / 2 {
            self.srtt = upper / 2;
        }
        while self.srtt <= self.rto && self.srtt < upper {
            self.srtt = (self.srtt * 2).min(upper);
        }
        self.rto = self.srtt;
    }

    /// Record the host's window advertisement unless it is older than what we know
    pub(crate) fn update_outgoing_window(&mut self, seq: u32, ack: u32, window: u16) {
        let newer = seq::lt(self.window_seq, seq)
            || (self.window_seq == seq && seq::lt(self.last_ack_seq, ack))
            || (self.window_seq == seq
                && self.last_ack_seq == ack
                && window > self.receiver_window);
        if newer {
            self.window_seq = seq;
            self.last_ack_seq = ack;
            self.receiver_window = window;
        }
    }

    /// Pull up to `max` encoded bytes of ready host data for the tunnel
    ///
    /// Data is extracted from the reassembly buffer and passed through the connection's writer.
    /// Whatever the writer produces beyond `max` is kept and returned first by the next call.
    /// A returned segment may be empty if it only carries a FIN.
    pub(crate) fn dequeue_locally_received_data(
        &mut self,
        max: usize,
    ) -> Result<Option<Segment<'static>>, CodecError> {
        let mut surplus = self.surplus.take();
        if let Some(data) = surplus.as_mut() {
            let len = data.len() as usize;
            if len > max {
                let mut head = data.split_to(max as u32);
                head.set_flags(TcpFlags::ACK);
                self.surplus = surplus;
                return Ok(Some(head));
            }
            if len == max {
                return Ok(surplus);
            }
        }
        if !self.inbound.is_ready() {
            return Ok(surplus);
        }

        let room = max - surplus.as_ref().map_or(0, |s| s.len() as usize);
        let mut raw = vec![0; room];
        let Some(chunk) = self.inbound.extract(&mut raw) else {
            return Ok(surplus);
        };
        let flush = chunk.flags.intersects(TcpFlags::PSH | TcpFlags::FIN);
        let mut encoded = BytesMut::with_capacity(chunk.len);
        match self.writer.as_mut() {
            Some(writer) => writer.write(&raw[..chunk.len], flush, &mut encoded)?,
            None => encoded.extend_from_slice(&raw[..chunk.len]),
        }

        match surplus {
            None => {
                let mut data = Segment::owned(chunk.seq, chunk.flags, encoded);
                if data.len() as usize > max {
                    let mut head = data.split_to(max as u32);
                    head.set_flags(chunk.flags & TcpFlags::MERGEABLE_NO_PUSH);
                    self.surplus = Some(data);
                    return Ok(Some(head));
                }
                Ok(Some(data))
            }
            Some(mut data) => {
                let remainder = max - data.len() as usize;
                if encoded.len() > remainder {
                    data.append(&encoded[..remainder]);
                    data.add_flags(chunk.flags & TcpFlags::MERGEABLE_NO_PUSH);
                    let rest = encoded.split_off(remainder);
                    self.surplus = Some(Segment::owned(data.following_seq(), chunk.flags, rest));
                } else {
                    data.append(&encoded);
                    data.add_flags(chunk.flags & !(TcpFlags::SYN | TcpFlags::RST));
                }
                Ok(Some(data))
            }
        }
    }

    /// Whether encoded data is waiting to be sent over the tunnel
    pub(crate) fn has_surplus(&self) -> bool {
        self.surplus.is_some()
    }

    /// Pick whether this entry is served in the current sweep of the tunnel transmitter
    ///
    /// Entries below the highest priority seen skip a sweep per missing level, so a
    /// connection of priority `p` is served roughly once every `highest - p + 1` sweeps.
    /// Returns `None` to skip, or `Some(priority)` with the priority to report as seen.
    pub fn take_turn(&mut self, highest: u8) -> Option<u8> {
        if self.assigned_priority > highest {
            self.current_priority = self.assigned_priority;
            return Some(self.assigned_priority);
        }
        if self.current_priority < highest {
            self.current_priority += 1;
            return None;
        }
        self.current_priority = self.assigned_priority;
        Some(self.assigned_priority)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("remote_id", &self.remote_id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("local_state", &self.local_state)
            .field("remote_state", &self.remote_state)
            .field("out_seq", &self.out_seq)
            .field("next_expected", &self.inbound.next_expected())
            .finish_non_exhaustive()
    }
}

fn unspecified() -> SocketAddrV4 {
    SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0)
}
