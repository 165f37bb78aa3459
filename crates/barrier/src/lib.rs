//! Deferred set: a read barrier that gates installation of a new mapping on
//! the completion of reads already in flight against the old, shared data
//! block those reads were issued against.
//!
//! Modelled as a fixed ring of slots, each a count of outstanding reads plus
//! a list of waiters parked behind that count. `current` is the slot new
//! increments land in; `sweeper` is the oldest slot that might still be
//! non-zero. `dec` walks `sweeper` forward past drained slots, releasing
//! their waiters as it goes.

use parking_lot::Mutex;

/// Number of ring slots. Matches the source's fixed `N = 64`.
const SLOT_COUNT: usize = 64;

/// A handle naming the slot an in-flight read incremented, to be handed back
/// to [`DeferredSet::dec`] on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredEntry {
    slot: usize,
}

struct Slot<T> {
    count: u64,
    waiters: Vec<T>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Slot { count: 0, waiters: Vec::new() }
    }
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    current: usize,
    sweeper: usize,
}

/// Gates mapping installation on outstanding shared reads.
pub struct DeferredSet<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for DeferredSet<T> {
    fn default() -> Self {
        let slots = (0..SLOT_COUNT).map(|_| Slot::new()).collect();
        DeferredSet { inner: Mutex::new(Inner { slots, current: 0, sweeper: 0 }) }
    }
}

impl<T> DeferredSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new outstanding shared read, returning a handle to decrement
    /// later via [`DeferredSet::dec`].
    pub fn inc(&self) -> DeferredEntry {
        let mut inner = self.inner.lock();
        let current = inner.current;
        inner.slots[current].count += 1;
        DeferredEntry { slot: current }
    }

    /// Record that the read named by `entry` has completed. Returns every
    /// waiter whose slot has now fully drained.
    pub fn dec(&self, entry: DeferredEntry) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.slots[entry.slot].count -= 1;

        let mut drained = Vec::new();
        while inner.sweeper != inner.current && inner.slots[inner.sweeper].count == 0 {
            let sweeper = inner.sweeper;
            drained.append(&mut inner.slots[sweeper].waiters);
            inner.sweeper = (inner.sweeper + 1) % SLOT_COUNT;
        }
        if inner.sweeper == inner.current && inner.slots[inner.sweeper].count == 0 {
            let sweeper = inner.sweeper;
            drained.append(&mut inner.slots[sweeper].waiters);
        }
        if !drained.is_empty() {
            tracing::trace!(count = drained.len(), "barrier drained, waiters released");
        }
        drained
    }

    /// Park `waiter` behind outstanding reads that predate it. Returns
    /// `Some(waiter)` handed straight back if there was nothing to wait on
    /// (no barrier needed, the caller may proceed immediately with it), or
    /// `None` if `waiter` was queued and will instead be returned by a
    /// future [`DeferredSet::dec`].
    pub fn add_work(&self, waiter: T) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.slots[inner.current].count == 0 && inner.sweeper == inner.current {
            return Some(waiter);
        }
        let current = inner.current;
        inner.slots[current].waiters.push(waiter);

        // Advance `current` past an already-empty next slot so reads that
        // start after this waiter land in a slot this waiter isn't gating
        // on, shortening the barrier for everyone after it.
        let next = (current + 1) % SLOT_COUNT;
        if inner.slots[next].count == 0 {
            inner.current = next;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_outstanding_reads_needs_no_barrier() {
        let set: DeferredSet<&'static str> = DeferredSet::new();
        assert_eq!(set.add_work("writer"), Some("writer"));
    }

    #[test]
    fn waiter_drains_when_its_read_completes() {
        let set: DeferredSet<&'static str> = DeferredSet::new();
        let read = set.inc();
        assert_eq!(set.add_work("writer"), None);
        let drained = set.dec(read);
        assert_eq!(drained, vec!["writer"]);
    }

    #[test]
    fn waiter_does_not_drain_while_another_read_is_outstanding() {
        let set: DeferredSet<&'static str> = DeferredSet::new();
        let read_a = set.inc();
        let read_b = set.inc();
        assert_eq!(set.add_work("writer"), None);
        assert!(set.dec(read_a).is_empty());
        assert_eq!(set.dec(read_b), vec!["writer"]);
    }

    #[test]
    fn reads_starting_after_a_waiter_do_not_delay_it() {
        let set: DeferredSet<&'static str> = DeferredSet::new();
        let old_read = set.inc();
        assert_eq!(set.add_work("writer"), None);
        // A read starting after the waiter was queued lands in a later slot
        // (current advanced past the empty next slot in add_work).
        let new_read = set.inc();
        let drained = set.dec(old_read);
        assert_eq!(drained, vec!["writer"]);
        assert!(set.dec(new_read).is_empty());
    }
}
