use std::{fmt, time::Duration};

use thiserror::Error;

/// Parameters governing the relay state machine
///
/// Default values mirror the behaviour of a conventional TCP stack on a LAN: a 1500 byte MTU,
/// retransmission timeouts between 100 ms and 3 s and a two minute maximum segment lifetime.
/// Deployments bridging slow or lossy tunnels mostly want to tune the buffer sizes and the
/// establishment timeout.
pub struct RelayConfig {
    pub(crate) buffer_min_size: usize,
    pub(crate) buffer_max_size: usize,
    pub(crate) mtu: u16,
    pub(crate) max_payload: usize,
    pub(crate) max_unacked: usize,

    pub(crate) msl: Duration,
    pub(crate) rto_lower_bound: Duration,
    pub(crate) rto_upper_bound: Duration,
    pub(crate) rto_recalculation: Duration,
    pub(crate) alpha: f32,
    pub(crate) beta: f32,

    pub(crate) syn_retransmissions: Vec<Duration>,
    pub(crate) syn_sent_timeout: Duration,
    pub(crate) establishment_timeout: Duration,
    pub(crate) idle_retransmit: Duration,
    pub(crate) idle_timeout: Duration,

    pub(crate) window_update_threshold: u8,
    pub(crate) prioritization: bool,
    pub(crate) ignore_time_wait: bool,
    pub(crate) verify_checksums: bool,
}

impl RelayConfig {
    /// Smallest and largest size of each connection's reassembly buffer
    ///
    /// The buffer starts at `min` bytes and doubles on demand up to `max`. The advertised TCP
    /// window never exceeds 65535 bytes, so larger maxima only help absorb out-of-order data.
    pub fn buffer_sizes(&mut self, min: usize, max: usize) -> Result<&mut Self, ConfigError> {
        if min == 0 || min > max {
            return Err(ConfigError::OutOfBounds);
        }
        self.buffer_min_size = min;
        self.buffer_max_size = max;
        Ok(self)
    }

    /// MTU of the network the host lives on; segments carry at most `mtu - 40` payload bytes
    pub fn mtu(&mut self, value: u16) -> Result<&mut Self, ConfigError> {
        if value < 68 {
            return Err(ConfigError::OutOfBounds);
        }
        self.mtu = value;
        Ok(self)
    }

    /// Largest payload of a single data message sent over the tunnel
    pub fn max_payload(&mut self, value: usize) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_payload = value;
        Ok(self)
    }

    /// Buffered inbound bytes that force an immediate ACK
    pub fn max_unacked(&mut self, value: usize) -> &mut Self {
        self.max_unacked = value;
        self
    }

    /// Maximum segment lifetime
    ///
    /// Connections linger in TimeWait for twice this, and a host that leaves a retransmitted
    /// segment unacknowledged for longer is considered gone.
    pub fn msl(&mut self, value: Duration) -> &mut Self {
        self.msl = value;
        self
    }

    /// Range the retransmission timeout is clamped to
    pub fn rto_bounds(
        &mut self,
        lower: Duration,
        upper: Duration,
    ) -> Result<&mut Self, ConfigError> {
        if lower.is_zero() || lower > upper {
            return Err(ConfigError::OutOfBounds);
        }
        self.rto_lower_bound = lower;
        self.rto_upper_bound = upper;
        Ok(self)
    }

    /// Minimum interval between two RTT samples
    pub fn rto_recalculation(&mut self, value: Duration) -> &mut Self {
        self.rto_recalculation = value;
        self
    }

    /// Smoothing factors: `srtt = alpha * srtt + (1 - alpha) * sample` and `rto = beta * srtt`
    pub fn smoothing(&mut self, alpha: f32, beta: f32) -> Result<&mut Self, ConfigError> {
        if !(0.0..=1.0).contains(&alpha) || !(0.0..=4.0).contains(&beta) {
            return Err(ConfigError::OutOfBounds);
        }
        self.alpha = alpha;
        self.beta = beta;
        Ok(self)
    }

    /// Delays, measured from the first attempt, at which a SYN to the host is retransmitted
    ///
    /// Must be increasing. Once the schedule is exhausted the SYN is resent every time the last
    /// delay elapses again, until [`syn_sent_timeout`](Self::syn_sent_timeout).
    pub fn syn_retransmissions(&mut self, value: Vec<Duration>) -> Result<&mut Self, ConfigError> {
        if value.is_empty() || value.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::OutOfBounds);
        }
        self.syn_retransmissions = value;
        Ok(self)
    }

    /// How long a SYN to the host may go unanswered before the connection is reset
    pub fn syn_sent_timeout(&mut self, value: Duration) -> &mut Self {
        self.syn_sent_timeout = value;
        self
    }

    /// How long the peer may take to confirm an open request
    pub fn establishment_timeout(&mut self, value: Duration) -> &mut Self {
        self.establishment_timeout = value;
        self
    }

    /// Idle time after which a duplicate ACK is sent when the inbound buffer has holes
    pub fn idle_retransmit(&mut self, value: Duration) -> &mut Self {
        self.idle_retransmit = value;
        self
    }

    /// Idle time after which a connection whose tunnel went away is reset
    pub fn idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.idle_timeout = value;
        self
    }

    /// Free buffer percentage that, when crossed upward, triggers a window update to the host
    pub fn window_update_threshold(&mut self, percent: u8) -> Result<&mut Self, ConfigError> {
        if percent > 100 {
            return Err(ConfigError::OutOfBounds);
        }
        self.window_update_threshold = percent;
        Ok(self)
    }

    /// Whether the tunnel transmitter honours route priorities
    pub fn prioritization(&mut self, value: bool) -> &mut Self {
        self.prioritization = value;
        self
    }

    /// Whether a peer may reopen a connection whose previous incarnation is still in TimeWait
    pub fn ignore_time_wait(&mut self, value: bool) -> &mut Self {
        self.ignore_time_wait = value;
        self
    }

    /// Whether captured frames with a wrong IPv4 or TCP checksum are dropped
    ///
    /// Off by default: captures taken before checksum offload see partial checksums.
    pub fn verify_checksums(&mut self, value: bool) -> &mut Self {
        self.verify_checksums = value;
        self
    }

    /// Largest TCP payload sent to the host
    pub fn max_segment_size(&self) -> usize {
        usize::from(self.mtu) - 40
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_min_size: 8192,
            buffer_max_size: 65535,
            mtu: 1500,
            max_payload: 8192,
            max_unacked: 8192,

            msl: Duration::from_secs(120),
            rto_lower_bound: Duration::from_millis(100),
            rto_upper_bound: Duration::from_secs(3),
            rto_recalculation: Duration::from_secs(1),
            alpha: 0.85,
            beta: 0.85,

            syn_retransmissions: [1, 3, 7, 15, 31]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            syn_sent_timeout: Duration::from_secs(60),
            establishment_timeout: Duration::from_secs(10),
            idle_retransmit: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),

            window_update_threshold: 30,
            prioritization: false,
            ignore_time_wait: false,
            verify_checksums: false,
        }
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("RelayConfig")
            .field("buffer_min_size", &self.buffer_min_size)
            .field("buffer_max_size", &self.buffer_max_size)
            .field("mtu", &self.mtu)
            .field("max_payload", &self.max_payload)
            .field("msl", &self.msl)
            .field("rto_lower_bound", &self.rto_lower_bound)
            .field("rto_upper_bound", &self.rto_upper_bound)
            .field("syn_sent_timeout", &self.syn_sent_timeout)
            .field("establishment_timeout", &self.establishment_timeout)
            .field("prioritization", &self.prioritization)
            .finish_non_exhaustive()
    }
}

/// Errors in the configuration of a relay
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
}
