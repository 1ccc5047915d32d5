use std::collections::BTreeSet;

// Tracks rows waiting to scroll into view. Each row fires at most once:
// reporting it visible also unregisters it.
#[derive(Debug, Default)]
pub struct VisibilityObserver {
    watched: BTreeSet<i64>,
}

impl VisibilityObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, row: i64) {
        self.watched.insert(row);
    }

    pub fn unobserve(&mut self, row: i64) {
        self.watched.remove(&row);
    }

    pub fn is_watching(&self, row: i64) -> bool {
        self.watched.contains(&row)
    }

    pub fn intersect(&mut self, visible: &[i64]) -> Vec<i64> {
        visible
            .iter()
            .copied()
            .filter(|row| self.watched.remove(row))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }
}
