use std::sync::{
    Arc, Weak,
    atomic::{AtomicI64, Ordering},
};

/// An owned 64-bit stream position counter.
///
/// Positions are monotonically non-decreasing byte offsets shared between the
/// sender and conductor threads. All cross-thread traffic goes through the
/// typed operations below; the raw cell is never exposed.
#[derive(Clone, Debug)]
pub struct Position {
    counter_id: i32,
    value: Arc<AtomicI64>,
}

impl Position {
    pub fn new(counter_id: i32, value: Arc<AtomicI64>) -> Self {
        Self { counter_id, value }
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.counter_id
    }

    /// Plain load. Only valid on the counter's single writer thread.
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Cross-thread load.
    #[inline]
    pub fn get_volatile(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_release(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    #[inline]
    pub fn add_release(&self, increment: i64) {
        self.value.fetch_add(increment, Ordering::Release);
    }

    /// Advance to `proposed` if it is ahead of the current value.
    ///
    /// Plain load plus conditional release store; callers uphold the
    /// single-writer discipline, so no RMW is needed.
    #[inline]
    pub fn propose_max_release(&self, proposed: i64) -> bool {
        if self.value.load(Ordering::Relaxed) < proposed {
            self.value.store(proposed, Ordering::Release);
            return true;
        }
        false
    }

    /// Weak observation handle for consumers the publication must not keep
    /// alive.
    pub fn to_readable(&self) -> ReadablePosition {
        ReadablePosition { counter_id: self.counter_id, value: Arc::downgrade(&self.value) }
    }
}

/// A weakly held view of somebody else's position counter.
#[derive(Clone, Debug)]
pub struct ReadablePosition {
    counter_id: i32,
    value: Weak<AtomicI64>,
}

impl ReadablePosition {
    #[inline]
    pub fn id(&self) -> i32 {
        self.counter_id
    }

    /// `None` once the owning counter has been freed.
    #[inline]
    pub fn get_volatile(&self) -> Option<i64> {
        self.value.upgrade().map(|v| v.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn position(id: i32) -> Position {
        Position::new(id, Arc::new(AtomicI64::new(0)))
    }

    #[test]
    fn propose_max_only_advances() {
        let p = position(0);
        assert!(p.propose_max_release(128));
        assert!(!p.propose_max_release(64));
        assert!(!p.propose_max_release(128));
        assert_eq!(p.get(), 128);
        assert!(p.propose_max_release(256));
        assert_eq!(p.get_volatile(), 256);
    }

    #[test]
    fn readable_goes_dark_after_free() {
        let p = position(7);
        let r = p.to_readable();
        p.set_release(42);
        assert_eq!(r.get_volatile(), Some(42));
        drop(p);
        assert_eq!(r.get_volatile(), None);
    }
}
