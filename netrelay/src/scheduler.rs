use std::{
    sync::{atomic::Ordering, Arc, Condvar},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{relay::Shared, table::Cursor};

/// Wakes a scheduler thread ahead of its period
///
/// Notification is best effort: [`wake`](Self::wake) never blocks and is dropped if the
/// scheduler happens to hold the flag at that moment. The periodic timeout in
/// [`wait`](Self::wait) bounds how long such a missed wake-up delays the work.
#[derive(Debug, Default)]
pub(crate) struct Waker {
    pending: std::sync::Mutex<bool>,
    cond: Condvar,
}

impl Waker {
    pub(crate) fn wake(&self) {
        if let Ok(mut pending) = self.pending.try_lock() {
            *pending = true;
            self.cond.notify_one();
        }
    }

    /// Block until woken or until `period` elapses
    pub(crate) fn wait(&self, period: Duration) {
        let mut pending = self.pending.lock().unwrap();
        if !*pending {
            pending = self.cond.wait_timeout(pending, period).unwrap().0;
        }
        *pending = false;
    }
}

/// Sends queued host data and control messages over the tunnels
pub(crate) fn run_transmitter(shared: Arc<Shared>) {
    let mut cursor = Cursor::default();
    while !shared.stop.load(Ordering::Acquire) {
        let now = Instant::now();
        shared.table.reset_cursor(&mut cursor);
        while let Some(slot) = shared.table.next_active_remote(&mut cursor) {
            let Some(mut entry) = slot.try_lock("transmit") else {
                continue;
            };
            cursor.next_highest = cursor.next_highest.max(entry.priority());
            if shared.engine.take_turn(&mut entry, cursor.highest).is_none() {
                trace!(id = entry.id(), "skipping turn");
                continue;
            }
            if let Err(e) = shared.engine.drain_to_tunnel(&mut entry, now) {
                shared.report(entry.id(), "transmit", &e);
            }
        }
        shared.transmitter.wait(shared.config.transmit_period);
    }
    debug!("transmitter stopped");
}

/// Sends, retransmits and acknowledges segments toward the host
pub(crate) fn run_delivery(shared: Arc<Shared>) {
    let mut cursor = Cursor::default();
    while !shared.stop.load(Ordering::Acquire) {
        let now = Instant::now();
        shared.table.reset_cursor(&mut cursor);
        while let Some(slot) = shared.table.next_active_local(&mut cursor) {
            let Some(mut entry) = slot.try_lock("deliver") else {
                continue;
            };
            if let Err(e) = shared.engine.deliver_to_host(&mut entry, now) {
                shared.report(entry.id(), "deliver", &e);
            }
        }
        shared.delivery.wait(shared.config.delivery_period);
    }
    debug!("delivery stopped");
}

/// Returns finished connections to the pool and shrinks the table
pub(crate) fn run_reclaimer(shared: Arc<Shared>) {
    while !shared.stop.load(Ordering::Acquire) {
        shared.reclaimer.wait(shared.config.reclaim_period);
        let now = Instant::now();
        let linger = shared.config.linger;
        let freed = shared
            .table
            .reclaim(now, |entry| shared.engine.is_reclaimable(entry, now, linger));
        let removed = shared.table.compact(shared.config.baseline);
        if freed > 0 || removed > 0 {
            debug!(freed, removed, len = shared.table.len(), "reclaimed entries");
        }
    }
    debug!("reclaimer stopped");
}
