//! TTY number allocation.
//!
//! Containers get a TTY number from a fixed range. Numbers below the range
//! belong to the host and are permanently reserved.
//!
//! Allocation draws random candidates instead of scanning linearly so
//! concurrent spin-ups do not all contend for the lowest free number. The
//! trade-off is a bounded draw count: with more slots than
//! [`MAX_DRAWS`] a nearly full pool can report exhaustion while a slot is
//! still free.

use crate::error::{CoreError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Range;

/// Upper bound on candidates tried per allocation.
pub const MAX_DRAWS: usize = 100;

/// An allocated TTY number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tty(u32);

impl Tty {
    /// Wrap a raw TTY number.
    pub fn new(n: u32) -> Self {
        Self(n)
    }

    /// The TTY number.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Tty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Reserved,
    InUse,
}

/// Pool of TTY numbers.
#[derive(Debug)]
pub struct TtyPool {
    range: Range<u32>,
    slots: Mutex<Vec<Slot>>,
}

impl TtyPool {
    /// Create a pool handing out numbers in `range`; everything below
    /// `range.start` is reserved.
    pub fn new(range: Range<u32>) -> Self {
        let slots = (0..range.end)
            .map(|n| {
                if n < range.start {
                    Slot::Reserved
                } else {
                    Slot::Free
                }
            })
            .collect();
        Self {
            range,
            slots: Mutex::new(slots),
        }
    }

    /// Allocate a free TTY number.
    ///
    /// # Errors
    /// [`CoreError::Capacity`] if no free slot was found within the draw cap.
    pub fn allocate(&self) -> Result<Tty> {
        let len = (self.range.end - self.range.start) as usize;
        let draws = MAX_DRAWS.min(len);

        let mut slots = self.slots.lock();
        let candidates = rand::seq::index::sample(&mut rand::thread_rng(), len, draws);
        for offset in candidates.iter() {
            let n = self.range.start + offset as u32;
            let slot = &mut slots[n as usize];
            if *slot == Slot::Free {
                *slot = Slot::InUse;
                tracing::trace!(tty = n, "Allocated TTY");
                return Ok(Tty(n));
            }
        }

        Err(CoreError::capacity(
            "tty",
            format!("no free TTY found after {draws} attempts"),
        ))
    }

    /// Return a TTY to the pool. Reserved, out-of-range and already free
    /// numbers are ignored.
    pub fn free(&self, tty: Tty) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(tty.0 as usize) {
            if *slot == Slot::InUse {
                *slot = Slot::Free;
                tracing::trace!(tty = tty.0, "Freed TTY");
            }
        }
    }

    /// Number of TTYs currently handed out.
    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| **s == Slot::InUse).count()
    }

    /// Whether `tty` is held back for the host.
    pub fn is_reserved(&self, tty: Tty) -> bool {
        matches!(self.slots.lock().get(tty.0 as usize), Some(Slot::Reserved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_exhaust_then_reuse() {
        let pool = TtyPool::new(10..64);
        let mut seen = HashSet::new();
        for _ in 0..54 {
            let tty = pool.allocate().expect("capacity available");
            assert!((10..64).contains(&tty.get()));
            assert!(seen.insert(tty), "duplicate TTY {tty}");
        }
        assert_eq!(pool.in_use(), 54);

        let err = pool.allocate().unwrap_err();
        assert!(err.is_capacity());

        let released = *seen.iter().next().unwrap();
        pool.free(released);
        let again = pool.allocate().unwrap();
        assert_eq!(again, released);
    }

    #[test]
    fn test_free_reserved_is_noop() {
        let pool = TtyPool::new(10..64);
        assert!(pool.is_reserved(Tty::new(3)));
        pool.free(Tty::new(3));
        assert!(pool.is_reserved(Tty::new(3)));
        assert_eq!(pool.in_use(), 0);

        for _ in 0..54 {
            assert!(pool.allocate().unwrap().get() >= 10);
        }
    }

    #[test]
    fn test_double_free_is_noop() {
        let pool = TtyPool::new(10..12);
        let tty = pool.allocate().unwrap();
        pool.free(tty);
        pool.free(tty);
        pool.free(Tty::new(500));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let pool = std::sync::Arc::new(TtyPool::new(10..64));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || (0..9).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for tty in h.join().unwrap() {
                assert!(all.insert(tty));
            }
        }
        assert_eq!(all.len(), 54);
    }
}
