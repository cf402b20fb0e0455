use std::{collections::HashMap, net::SocketAddrV4, sync::Arc, time::Instant};

use proto::{Engine, Entry, Error, MAX_CONNECTIONS};
use slab::Slab;
use tracing::{debug, trace};

use crate::mutex::{Mutex, MutexGuard};

pub(crate) type EntryRef = Arc<Mutex<Entry>>;

/// Every connection the relay knows about, indexed by virtual id
///
/// Slot `key` holds the entry with id `key + 1`. Slots are never removed except from the tail
/// by [`compact`](Self::compact), so ids stay stable for the lifetime of a slot.
///
/// Lock order is always table, then entry. Scans use non-blocking attempts on entry locks and
/// skip entries another thread is working on.
#[derive(Debug)]
pub(crate) struct ConnTable {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    slots: Slab<EntryRef>,
    by_addr: HashMap<(SocketAddrV4, SocketAddrV4), usize>,
}

impl ConnTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Slab::new(),
                by_addr: HashMap::new(),
            }),
        }
    }

    /// Entry tracking `local` <-> `remote`, claiming a slot if there is none yet
    ///
    /// Reuses the first unused slot before growing the table.
    pub(crate) fn get_or_insert(
        &self,
        engine: &Engine,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        now: Instant,
    ) -> Result<EntryRef, Error> {
        let mut inner = self.inner.lock("get_or_insert");
        if let Some(&key) = inner.by_addr.get(&(local, remote)) {
            return Ok(inner.slots[key].clone());
        }

        let unused = inner.slots.iter().find_map(|(key, slot)| {
            let entry = slot.try_lock("find unused")?;
            entry.is_unused().then_some(key)
        });
        let key = match unused {
            Some(key) => key,
            None => {
                if inner.slots.len() >= MAX_CONNECTIONS {
                    return Err(Error::TableFull);
                }
                let vacant = inner.slots.vacant_entry();
                let key = vacant.key();
                let id = key as u16 + 1;
                vacant.insert(Arc::new(Mutex::new(engine.new_entry(id, now))));
                trace!(id, "table grown");
                key
            }
        };

        let slot = inner.slots[key].clone();
        slot.lock("claim").claim(local, remote);
        inner.by_addr.insert((local, remote), key);
        Ok(slot)
    }

    /// Run `f` on the locked entry tracking `local` <-> `remote`, claiming one if needed
    ///
    /// The reclaimer may clear the entry between the lookup and the entry lock being taken; the
    /// lookup is then repeated so that `f` never sees an entry for some other connection.
    pub(crate) fn with_entry<R>(
        &self,
        engine: &Engine,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        now: Instant,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> Result<R, Error> {
        loop {
            let slot = self.get_or_insert(engine, local, remote, now)?;
            if let Some(mut entry) = lock_matching(&slot, local, remote) {
                return Ok(f(&mut entry));
            }
            trace!(%local, %remote, "entry reclaimed before use");
        }
    }

    /// Entry with virtual id `id`, if the slot exists
    pub(crate) fn get(&self, id: u16) -> Option<EntryRef> {
        let key = usize::from(id).checked_sub(1)?;
        self.inner.lock("get").slots.get(key).cloned()
    }

    /// Start a new sweep, beginning one slot later than the previous one
    pub(crate) fn reset_cursor(&self, cursor: &mut Cursor) {
        let len = self.inner.lock("reset cursor").slots.len();
        cursor.first = match len {
            0 => 0,
            _ => (cursor.first + 1) % len,
        };
        cursor.visited = 0;
        cursor.len = len;
        cursor.highest = cursor.next_highest;
        cursor.next_highest = 0;
    }

    /// Next entry with work for the local-delivery scheduler
    pub(crate) fn next_active_local(&self, cursor: &mut Cursor) -> Option<EntryRef> {
        self.next_matching(cursor, "next active local", Entry::is_active_local)
    }

    /// Next entry with work for the tunnel transmitter
    pub(crate) fn next_active_remote(&self, cursor: &mut Cursor) -> Option<EntryRef> {
        self.next_matching(cursor, "next active remote", Entry::is_active_remote)
    }

    fn next_matching(
        &self,
        cursor: &mut Cursor,
        purpose: &'static str,
        predicate: impl Fn(&Entry) -> bool,
    ) -> Option<EntryRef> {
        let inner = self.inner.lock(purpose);
        let len = cursor.len.min(inner.slots.len());
        while cursor.visited < len {
            let key = (cursor.first + cursor.visited) % len;
            cursor.visited += 1;
            let Some(slot) = inner.slots.get(key) else {
                continue;
            };
            let Some(entry) = slot.try_lock(purpose) else {
                continue;
            };
            if predicate(&*entry) {
                return Some(slot.clone());
            }
        }
        None
    }

    /// Return finished entries for which `reclaimable` holds to the unused pool
    ///
    /// Runs under the table lock so that a cleared entry can never be found through the
    /// address index.
    pub(crate) fn reclaim(
        &self,
        now: Instant,
        mut reclaimable: impl FnMut(&Entry) -> bool,
    ) -> usize {
        let mut inner = self.inner.lock("reclaim");
        let Inner { slots, by_addr } = &mut *inner;
        let mut freed = 0;
        for (_, slot) in slots.iter() {
            let Some(mut entry) = slot.try_lock("reclaim") else {
                continue;
            };
            if !entry.is_closed() || !reclaimable(&*entry) {
                continue;
            }
            debug!(id = entry.id(), state = %entry.local_state(), "reclaiming entry");
            by_addr.remove(&(entry.local_addr(), entry.remote_addr()));
            entry.clear(now);
            freed += 1;
        }
        freed
    }

    /// Drop unused slots from the end of the table, keeping at least `baseline`
    ///
    /// Stops at the first slot that is in use or locked by another thread.
    pub(crate) fn compact(&self, baseline: usize) -> usize {
        let mut inner = self.inner.lock("compact");
        let mut removed = 0;
        while inner.slots.len() > baseline {
            let key = inner.slots.len() - 1;
            let idle = inner.slots[key]
                .try_lock("compact")
                .map_or(false, |entry| entry.is_unused());
            if !idle {
                break;
            }
            inner.slots.remove(key);
            removed += 1;
        }
        if removed > 0 {
            trace!(removed, len = inner.slots.len(), "table compacted");
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock("len").slots.len()
    }
}

/// Lock `slot` if it still tracks `local` <-> `remote`
fn lock_matching(
    slot: &EntryRef,
    local: SocketAddrV4,
    remote: SocketAddrV4,
) -> Option<MutexGuard<'_, Entry>> {
    let entry = slot.lock("claimed entry");
    entry.matches(local, remote).then_some(entry)
}

/// Position of one scheduler's round-robin sweep over the table
#[derive(Debug, Default)]
pub(crate) struct Cursor {
    first: usize,
    visited: usize,
    len: usize,
    /// Highest priority seen during the previous sweep
    pub(crate) highest: u8,
    /// Highest priority seen so far during this sweep
    pub(crate) next_highest: u8,
}
