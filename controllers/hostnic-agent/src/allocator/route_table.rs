//! Route table numbers for local NICs

use std::collections::BTreeSet;

/// Hands out the lowest free table number at or above `base`
#[derive(Debug, Clone)]
pub struct RouteTables {
    base: i32,
    used: BTreeSet<i32>,
}

impl RouteTables {
    pub fn new(base: i32) -> Self {
        Self {
            base,
            used: BTreeSet::new(),
        }
    }

    pub fn base(&self) -> i32 {
        self.base
    }

    /// Take the lowest free number
    pub fn take(&mut self) -> i32 {
        let mut n = self.base;
        while self.used.contains(&n) {
            n += 1;
        }
        self.used.insert(n);
        n
    }

    /// Claim `n` if it is valid and free
    pub fn claim(&mut self, n: i32) -> bool {
        n >= self.base && self.used.insert(n)
    }

    pub fn release(&mut self, n: i32) {
        self.used.remove(&n);
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }
}
