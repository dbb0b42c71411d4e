use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use tracing::warn;

use crate::Position;

/// A monotonic event counter (sends, heartbeats, dropped packets, ...).
#[derive(Clone, Debug, Default)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    #[inline]
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_release(&self) {
        self.value.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }
}

struct CounterSlot {
    label: String,
    in_use: bool,
}

/// Allocates position counters with stable integer ids.
///
/// Freed ids are recycled. The manager is owned and mutated by the conductor
/// thread only; the cells it hands out are shared.
#[derive(Default)]
pub struct CountersManager {
    slots: Vec<CounterSlot>,
    free_ids: Vec<i32>,
}

impl CountersManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, label: impl Into<String>) -> Position {
        let label = label.into();
        let id = match self.free_ids.pop() {
            Some(id) => {
                let slot = &mut self.slots[id as usize];
                slot.label = label;
                slot.in_use = true;
                id
            }
            None => {
                let id = self.slots.len() as i32;
                self.slots.push(CounterSlot { label, in_use: true });
                id
            }
        };
        Position::new(id, Arc::new(AtomicI64::new(0)))
    }

    pub fn free(&mut self, id: i32) {
        match self.slots.get_mut(id as usize) {
            Some(slot) if slot.in_use => {
                slot.in_use = false;
                self.free_ids.push(id);
            }
            _ => warn!(id, "freeing unknown counter id"),
        }
    }

    pub fn label(&self, id: i32) -> Option<&str> {
        self.slots.get(id as usize).filter(|s| s.in_use).map(|s| s.label.as_str())
    }

    pub fn allocated(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }
}

/// The driver-wide counters every publication reports into.
#[derive(Clone, Debug, Default)]
pub struct SystemCounters {
    pub short_sends: Counter,
    pub heartbeats_sent: Counter,
    pub sender_flow_control_limits: Counter,
    pub retransmits_sent: Counter,
    pub invalid_packets: Counter,
}

impl SystemCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_are_recycled() {
        let mut manager = CountersManager::new();
        let a = manager.allocate("pub-lmt");
        let b = manager.allocate("snd-pos");
        assert_eq!((a.id(), b.id()), (0, 1));
        assert_eq!(manager.label(0), Some("pub-lmt"));

        manager.free(a.id());
        assert_eq!(manager.label(0), None);
        assert_eq!(manager.allocated(), 1);

        let c = manager.allocate("snd-lmt");
        assert_eq!(c.id(), 0);
        assert_eq!(manager.label(0), Some("snd-lmt"));
    }

    #[test]
    fn double_free_is_ignored() {
        let mut manager = CountersManager::new();
        let a = manager.allocate("x");
        manager.free(a.id());
        manager.free(a.id());
        assert_eq!(manager.allocated(), 0);
        assert_eq!(manager.allocate("y").id(), 0);
    }

    #[test]
    fn counters_count() {
        let counters = SystemCounters::new();
        let also = counters.clone();
        counters.short_sends.increment();
        counters.short_sends.increment_release();
        assert_eq!(also.short_sends.get(), 2);
        assert_eq!(also.heartbeats_sent.get(), 0);
    }
}
