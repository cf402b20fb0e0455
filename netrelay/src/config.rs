use std::time::Duration;

/// Timing of the background threads of a [`Relay`](crate::Relay)
///
/// Each thread also wakes early when an event gives it work, so the periods only bound the
/// latency of timer-driven work such as retransmissions.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub(crate) transmit_period: Duration,
    pub(crate) delivery_period: Duration,
    pub(crate) reclaim_period: Duration,
    pub(crate) linger: Duration,
    pub(crate) baseline: usize,
}

impl SchedulerConfig {
    /// How often the tunnel transmitter sweeps the table
    pub fn transmit_period(&mut self, value: Duration) -> &mut Self {
        self.transmit_period = value;
        self
    }

    /// How often the local-delivery scheduler sweeps the table
    ///
    /// Retransmission timers are only checked this often, so it should stay below the lower
    /// RTO bound.
    pub fn delivery_period(&mut self, value: Duration) -> &mut Self {
        self.delivery_period = value;
        self
    }

    /// How often finished connections are reclaimed and the table compacted
    pub fn reclaim_period(&mut self, value: Duration) -> &mut Self {
        self.reclaim_period = value;
        self
    }

    /// How long a finished connection stays in the table before it is reclaimed
    ///
    /// Late segments from the host for a lingering connection are answered with a RST rather
    /// than treated as a new connection attempt.
    pub fn linger(&mut self, value: Duration) -> &mut Self {
        self.linger = value;
        self
    }

    /// Number of table slots kept allocated when the table is compacted
    pub fn baseline(&mut self, value: usize) -> &mut Self {
        self.baseline = value;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            transmit_period: Duration::from_millis(200),
            delivery_period: Duration::from_millis(50),
            reclaim_period: Duration::from_secs(5),
            linger: Duration::from_secs(10),
            baseline: 64,
        }
    }
}
