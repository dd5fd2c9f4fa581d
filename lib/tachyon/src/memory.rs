use crate::error::{Error, NetResult};
use crate::packet::Packet;
use std::sync::Mutex;

/// No ceiling.
pub const NO_LIMIT: usize = usize::max_value();

struct TrackerState {
    used: usize,
    limit: usize,
}

/// Byte accounting over buffers in flight, with an optional ceiling. An increase that would cross
/// the ceiling fails with `MemoryLimitExceeded` and leaves the count untouched; integer overflow
/// in either direction is a hard error.
pub struct MemoryTracker {
    state: Mutex<TrackerState>,
}

impl MemoryTracker {
    #[inline]
    pub fn unbounded() -> MemoryTracker {
        MemoryTracker::bounded(NO_LIMIT)
    }

    #[inline]
    pub fn bounded(limit: usize) -> MemoryTracker {
        MemoryTracker {
            state: Mutex::new(TrackerState { used: 0, limit }),
        }
    }

    pub fn increase(&self, amount: usize) -> NetResult<()> {
        let mut state = self.lock();

        let new_used = state.used.checked_add(amount).ok_or(Error::IntegerOverflow)?;

        if new_used > state.limit {
            return Err(Error::MemoryLimitExceeded);
        }

        state.used = new_used;
        Ok(())
    }

    pub fn decrease(&self, amount: usize) -> NetResult<()> {
        let mut state = self.lock();

        state.used = state.used.checked_sub(amount).ok_or(Error::IntegerOverflow)?;
        Ok(())
    }

    /// Replaces the count outright, still enforcing the ceiling.
    pub fn set_used(&self, used: usize) -> NetResult<()> {
        let mut state = self.lock();

        if used > state.limit {
            return Err(Error::MemoryLimitExceeded);
        }

        state.used = used;
        Ok(())
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.lock().used
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    pub fn set_limit(&self, limit: usize) {
        self.lock().limit = limit;
    }

    fn lock(&self) -> std::sync::MutexGuard<TrackerState> {
        self.state.lock().expect("Memory tracker lock poisoned")
    }
}

/// Bounded FIFO pool of pre-allocated packet shells of one fixed memory size. `get` hands out a
/// recycled shell when one fits, `recycle` returns shells whose allocation still matches.
pub struct PacketRecycler {
    shell_memory: usize,
    max_packets: usize,
    pool: Mutex<Vec<Packet>>,
}

impl PacketRecycler {
    pub fn new(max_packets: usize, shell_memory: usize) -> PacketRecycler {
        PacketRecycler {
            shell_memory,
            max_packets,
            pool: Mutex::new(Vec::with_capacity(max_packets)),
        }
    }

    /// A shell with at least `memory` bytes allocated. Recycled when the request fits the pool's
    /// shell size and a shell is available, freshly allocated otherwise.
    pub fn get(&self, memory: usize) -> Packet {
        if memory <= self.shell_memory {
            if let Some(mut shell) = self.lock().pop() {
                shell.clear();
                return shell;
            }
        }

        Packet::with_memory(memory)
    }

    /// Returns a shell to the pool if its allocation matches and the pool is not full; frees it
    /// otherwise.
    pub fn recycle(&self, packet: Packet) {
        if packet.memory_size() == self.shell_memory {
            let mut pool = self.lock();

            if pool.len() < self.max_packets {
                pool.push(packet);
            }
        }
    }

    #[inline]
    pub fn pooled(&self) -> usize {
        self.lock().len()
    }

    #[inline]
    pub fn shell_memory(&self) -> usize {
        self.shell_memory
    }

    #[inline]
    pub fn max_packets(&self) -> usize {
        self.max_packets
    }

    fn lock(&self) -> std::sync::MutexGuard<Vec<Packet>> {
        self.pool.lock().expect("Recycler lock poisoned")
    }
}

/// A recycler that also charges a memory ceiling for every shell in flight. Backs the per-entity
/// receive accounting of the framing modes.
pub struct BoundedPacketRecycler {
    recycler: PacketRecycler,
    tracker: MemoryTracker,
}

impl BoundedPacketRecycler {
    pub fn new(max_packets: usize, shell_memory: usize, limit: usize) -> BoundedPacketRecycler {
        BoundedPacketRecycler {
            recycler: PacketRecycler::new(max_packets, shell_memory),
            tracker: MemoryTracker::bounded(limit),
        }
    }

    /// A shell charged against the ceiling. On `MemoryLimitExceeded` the shell returns to the
    /// pool and the count is untouched.
    pub fn get(&self, memory: usize) -> NetResult<Packet> {
        let packet = self.recycler.get(memory);

        match self.tracker.increase(packet.memory_size()) {
            Ok(()) => Ok(packet),
            Err(err) => {
                self.recycler.recycle(packet);
                Err(err)
            }
        }
    }

    /// Releases the charge and pools the shell where possible.
    pub fn recycle(&self, packet: Packet) {
        self.tracker
            .decrease(packet.memory_size())
            .expect("Accounting underflow");
        self.recycler.recycle(packet);
    }

    #[inline]
    pub fn memory_size(&self) -> usize {
        self.tracker.used()
    }

    #[inline]
    pub fn memory_limit(&self) -> usize {
        self.tracker.limit()
    }

    #[inline]
    pub fn set_memory_limit(&self, limit: usize) {
        self.tracker.set_limit(limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_limit() {
        let tracker = MemoryTracker::bounded(1024);

        tracker.increase(1000).unwrap();
        assert_eq!(tracker.increase(100).unwrap_err(), Error::MemoryLimitExceeded);
        assert_eq!(tracker.used(), 1000);

        tracker.increase(24).unwrap();
        assert_eq!(tracker.used(), 1024);

        tracker.decrease(1024).unwrap();
        assert_eq!(tracker.used(), 0);
    }

    #[test]
    fn test_tracker_overflow_is_hard_error() {
        let tracker = MemoryTracker::unbounded();

        tracker.increase(usize::max_value()).unwrap();
        assert_eq!(tracker.increase(1).unwrap_err(), Error::IntegerOverflow);

        let tracker = MemoryTracker::unbounded();
        assert_eq!(tracker.decrease(1).unwrap_err(), Error::IntegerOverflow);
    }

    #[test]
    fn test_recycler_roundtrip_bounds_pool() {
        let recycler = PacketRecycler::new(2, 128);

        for _ in 0..16 {
            let shell = recycler.get(100);
            assert!(shell.memory_size() >= 100);
            recycler.recycle(shell);
        }

        assert!(recycler.pooled() <= 2);
    }

    #[test]
    fn test_recycler_reuses_matching_shells() {
        let recycler = PacketRecycler::new(4, 128);

        recycler.recycle(Packet::with_memory(128));
        assert_eq!(recycler.pooled(), 1);

        let shell = recycler.get(64);
        assert_eq!(shell.memory_size(), 128);
        assert_eq!(recycler.pooled(), 0);
    }

    #[test]
    fn test_recycler_frees_mismatched_shells() {
        let recycler = PacketRecycler::new(4, 128);

        recycler.recycle(Packet::with_memory(64));
        assert_eq!(recycler.pooled(), 0);

        // Oversized requests bypass the pool entirely.
        recycler.recycle(Packet::with_memory(128));
        let fresh = recycler.get(256);
        assert_eq!(fresh.memory_size(), 256);
        assert_eq!(recycler.pooled(), 1);
    }

    #[test]
    fn test_bounded_recycler_enforces_ceiling() {
        let recycler = BoundedPacketRecycler::new(4, 128, 256);

        let first = recycler.get(100).unwrap();
        let second = recycler.get(100).unwrap();
        assert_eq!(recycler.get(100).unwrap_err(), Error::MemoryLimitExceeded);
        assert_eq!(recycler.memory_size(), 200);

        recycler.recycle(first);
        recycler.recycle(second);
        assert_eq!(recycler.memory_size(), 0);
    }
}
