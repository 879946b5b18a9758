//! Sparse vector clocks over routine ids
use crate::RoutineId;
use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::{cmp::max, fmt};

/// Result of comparing two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRel {
    Before,
    After,
    Equal,
    Concurrent,
}

/// A sparse mapping routine id -> counter. Routines not present count
/// as zero. `a.compare(b) == Before` iff a happens before b under the
/// order the HB engine computed the clocks for.
#[derive(Debug, Clone, Default)]
pub struct VectorClock(FxHashMap<RoutineId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, r: RoutineId) -> u64 {
        self.0.get(&r).copied().unwrap_or(0)
    }

    pub fn inc(&mut self, r: RoutineId) {
        *self.0.entry(r).or_insert(0) += 1;
    }

    /// pointwise max
    pub fn join(&mut self, other: &Self) {
        for (r, v) in &other.0 {
            if *v > 0 {
                let e = self.0.entry(*r).or_insert(0);
                *e = max(*e, *v);
            }
        }
    }

    pub fn compare(&self, other: &Self) -> ClockRel {
        let mut le = true;
        let mut ge = true;
        for (r, v) in &self.0 {
            match other.get(*r) {
                o if *v < o => ge = false,
                o if *v > o => le = false,
                _ => (),
            }
        }
        for (r, v) in &other.0 {
            match self.get(*r) {
                s if s < *v => le = false,
                s if s > *v => ge = false,
                _ => (),
            }
        }
        match (le, ge) {
            (true, true) => ClockRel::Equal,
            (true, false) => ClockRel::Before,
            (false, true) => ClockRel::After,
            (false, false) => ClockRel::Concurrent,
        }
    }

    pub fn happens_before(&self, other: &Self) -> bool {
        self.compare(other) == ClockRel::Before
    }

    pub fn concurrent_with(&self, other: &Self) -> bool {
        self.compare(other) == ClockRel::Concurrent
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == ClockRel::Equal
    }
}

impl Eq for VectorClock {}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: SmallVec<[(RoutineId, u64); 8]> =
            self.0.iter().map(|(r, v)| (*r, *v)).collect();
        entries.sort();
        write!(f, "[")?;
        for (i, (r, v)) in entries.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{r}:{v}")?;
        }
        write!(f, "]")
    }
}
