//! Scheduling chains, the vocabulary of chain based mutation
//!
//! A chain is an ordered list of events from alternating routines; a
//! mutated chain describes the order the replayer should force those
//! events into. The string form doubles as the deduplication key and
//! includes any forced select choice, chosen default included.
use fxhash::FxHashMap;
use rand::Rng;
use serde::{Serialize, Serializer};
use skein_analysis::conc::ConcIndex;
use skein_trace::{clock::ClockRel, event::EventKind, trace::Trace, Eid};
use std::fmt;

/// Which event kinds may join a chain. Classical chain mutation works
/// on blocking primitives only; the HB guided modes admit everything
/// that can appear in a schedule.
pub fn eligible(kind: &EventKind, hb_mode: bool) -> bool {
    if hb_mode {
        !matches!(
            kind,
            EventKind::Atomic { .. }
                | EventKind::New { .. }
                | EventKind::Replay { .. }
                | EventKind::End
        )
    } else {
        matches!(
            kind,
            EventKind::Mutex { .. } | EventKind::Channel(_) | EventKind::Select(_)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain {
    elems: Vec<Eid>,
    // forced select choices applied when the chain is materialized,
    // -1 means the default case
    choices: FxHashMap<Eid, i32>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pair(trace: &Trace, a: Eid, b: Eid) -> Option<Self> {
        let mut c = Self::new();
        if !c.add(trace, a) || !c.add(trace, b) {
            return None;
        }
        Some(c)
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn elems(&self) -> &[Eid] {
        &self.elems
    }

    pub fn first(&self) -> Option<Eid> {
        self.elems.first().copied()
    }

    pub fn last(&self) -> Option<Eid> {
        self.elems.last().copied()
    }

    pub fn contains(&self, e: Eid) -> bool {
        self.elems.contains(&e)
    }

    pub fn choice(&self, e: Eid) -> Option<i32> {
        self.choices.get(&e).copied()
    }

    /// the element that completed earliest, stuck elements last
    pub fn min_tpost_element(&self, trace: &Trace) -> Option<Eid> {
        self.elems.iter().copied().min_by_key(|e| trace.event(*e).tsort())
    }

    /// Append an event. Refused when the tail is from the same
    /// routine: adjacent chain entries must interleave routines.
    pub fn add(&mut self, trace: &Trace, e: Eid) -> bool {
        if let Some(last) = self.last() {
            if trace.event(last).routine == trace.event(e).routine {
                return false;
            }
        }
        self.elems.push(e);
        true
    }

    /// Replace the element at `i`, keeping routine interleaving
    pub fn replace(&mut self, trace: &Trace, i: usize, e: Eid) -> bool {
        if i >= self.elems.len() || self.contains(e) {
            return false;
        }
        let r = trace.event(e).routine;
        let clash = |j: Option<&Eid>| {
            j.map(|n| trace.event(*n).routine == r).unwrap_or(false)
        };
        if clash(i.checked_sub(1).and_then(|j| self.elems.get(j)))
            || clash(self.elems.get(i + 1))
        {
            return false;
        }
        self.elems[i] = e;
        true
    }

    pub fn remove_head(&mut self) -> Option<Eid> {
        if self.elems.is_empty() {
            None
        } else {
            Some(self.elems.remove(0))
        }
    }

    pub fn remove_tail(&mut self) -> Option<Eid> {
        self.elems.pop()
    }

    /// Swap two elements. Succeeds only when they are HB concurrent
    /// under the strong order and routine interleaving survives.
    pub fn swap(&mut self, trace: &Trace, i: usize, j: usize) -> bool {
        if i >= self.elems.len() || j >= self.elems.len() || i == j {
            return false;
        }
        let (a, b) = (self.elems[i], self.elems[j]);
        if trace.event(a).vc().compare(trace.event(b).vc()) != ClockRel::Concurrent {
            return false;
        }
        self.elems.swap(i, j);
        if !self.interleaved(trace) {
            self.elems.swap(i, j);
            return false;
        }
        true
    }

    fn interleaved(&self, trace: &Trace) -> bool {
        self.elems.windows(2).all(|w| {
            trace.event(w[0]).routine != trace.event(w[1]).routine
        })
    }

    /// A chain is valid when its order could be a linearization of
    /// some schedule: no element may be HB after a later one.
    pub fn is_valid(&self, trace: &Trace) -> bool {
        if !self.interleaved(trace) {
            return false;
        }
        for (i, a) in self.elems.iter().enumerate() {
            for b in self.elems.iter().skip(i + 1) {
                if trace.event(*a).vc().compare(trace.event(*b).vc())
                    == ClockRel::After
                {
                    return false;
                }
            }
        }
        true
    }

    /// force a select element onto a specific case (-1 = default)
    pub fn choose(&mut self, e: Eid, case: i32) {
        self.choices.insert(e, case);
    }

    /// Sibling chains for every select in the chain whose chosen case
    /// has no partner: one per alternative case, plus the default when
    /// present and not the recorded choice.
    pub fn mutate_select(&self, trace: &Trace) -> Vec<Chain> {
        let mut out = Vec::new();
        for e in &self.elems {
            let s = match trace.event(*e).select() {
                Some(s) => s,
                None => continue,
            };
            let unpartnered = match s.chosen_case() {
                Some((_, case)) => case.chan.partner.is_none(),
                None => true,
            };
            if !unpartnered {
                continue;
            }
            for i in 0..s.cases.len() {
                if s.chosen_index == i as i32 {
                    continue;
                }
                let mut c = self.clone();
                c.choose(*e, i as i32);
                out.push(c);
            }
            if s.has_default && !s.chose_default() {
                let mut c = self.clone();
                c.choose(*e, -1);
                out.push(c);
            }
        }
        out
    }

    /// Bias for mutation selection: chains over busy primitives with
    /// many concurrent peers are worth perturbing more.
    pub fn quality(
        &self,
        trace: &Trace,
        idx: &ConcIndex,
        rng: &mut impl Rng,
    ) -> f64 {
        let mut score = 0.0;
        for e in &self.elems {
            let ev = trace.event(*e);
            let same_prim_ops = trace
                .iter()
                .filter(|f| trace.event(*f).kind.same_primitive(&ev.kind))
                .count();
            let conc_all = idx.count(trace, *e, false, false);
            let conc_same = idx.count(trace, *e, false, true);
            let frac = if conc_all == 0 {
                0.0
            } else {
                conc_same as f64 / conc_all as f64
            };
            score += (1.0 + same_prim_ops as f64).ln()
                + 2.0 * frac
                + 0.5 * (1.0 + conc_all as f64).ln();
        }
        score + rng.random_range(0.0..0.1)
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.elems.iter().enumerate() {
            if i > 0 {
                write!(f, "->")?;
            }
            write!(f, "e{e}")?;
            match self.choices.get(e).copied() {
                Some(-1) => write!(f, "[D]")?,
                Some(c) => write!(f, "[c{c}]")?,
                None => (),
            }
        }
        Ok(())
    }
}

impl Serialize for Chain {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
