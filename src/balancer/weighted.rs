use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Smooth weighted round-robin over arbitrary items.
///
/// Every `sum(weights)` consecutive picks select each available item exactly
/// `weight` times, interleaved rather than in bursts (for weights 5:1:1 the
/// sequence is a, a, b, a, c, a, a). Items with weight 0 are never picked
/// but stay listed. Items marked down are skipped until marked up again.
pub struct WeightedRoundRobin<T> {
    entries: Vec<Entry<T>>,
    current: Mutex<Vec<i64>>,
}

struct Entry<T> {
    item: T,
    weight: u32,
    up: AtomicBool,
}

impl<T> WeightedRoundRobin<T> {
    pub fn new(items: impl IntoIterator<Item = (T, u32)>) -> Self {
        let entries: Vec<Entry<T>> = items
            .into_iter()
            .map(|(item, weight)| Entry {
                item,
                weight,
                up: AtomicBool::new(true),
            })
            .collect();
        let current = Mutex::new(vec![0; entries.len()]);

        Self { entries, current }
    }

    /// Pick the next item, returning its index alongside it.
    pub fn next(&self) -> Option<(usize, &T)> {
        let mut current = self.current.lock();

        let mut total: i64 = 0;
        let mut best: Option<usize> = None;

        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.weight == 0 || !entry.up.load(Ordering::Relaxed) {
                continue;
            }
            let weight = i64::from(entry.weight);
            current[idx] += weight;
            total += weight;

            if best.is_none_or(|b| current[idx] > current[b]) {
                best = Some(idx);
            }
        }

        let idx = best?;
        current[idx] -= total;

        Some((idx, &self.entries[idx].item))
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index).map(|e| &e.item)
    }

    /// Index of the first item satisfying `f`.
    pub fn position(&self, f: impl Fn(&T) -> bool) -> Option<usize> {
        self.entries.iter().position(|e| f(&e.item))
    }

    /// Whether the item at `index` can currently be selected.
    pub fn is_available(&self, index: usize) -> bool {
        self.entries
            .get(index)
            .is_some_and(|e| e.weight > 0 && e.up.load(Ordering::Relaxed))
    }

    pub fn set_up(&self, index: usize, up: bool) {
        if let Some(entry) = self.entries.get(index) {
            entry.up.store(up, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.item)
    }
}
