//! Flow mutations: count how often each source position is exercised
//! and push rarely visited positions over their observed ceiling, so
//! the replayer lets the program take them more often.
use crate::mutation::Mutation;
use fxhash::FxHashMap;
use indexmap::IndexMap;
use skein_trace::{trace::Trace, Pos};

#[derive(Debug, Default)]
pub struct FlowCounts(FxHashMap<Pos, u64>);

impl FlowCounts {
    pub fn get(&self, pos: &Pos) -> u64 {
        self.0.get(pos).copied().unwrap_or(0)
    }
}

pub fn mutations(trace: &Trace, counts: &mut FlowCounts) -> Vec<Mutation> {
    let mut local: FxHashMap<Pos, u64> = FxHashMap::default();
    for eid in trace.iter() {
        let ev = trace.event(eid);
        if ev.pos.is_none() {
            continue;
        }
        *local.entry(ev.pos.clone()).or_insert(0) += 1;
    }
    for (pos, n) in &local {
        let e = counts.0.entry(pos.clone()).or_insert(0);
        *e = (*e).max(*n);
    }
    // positions exercised less often than the busiest one get room to
    // catch up
    let ceiling = counts.0.values().copied().max().unwrap_or(0);
    if ceiling <= 1 {
        return Vec::new();
    }
    let mut ceilings: IndexMap<Pos, u64> = IndexMap::new();
    let mut rare: Vec<(Pos, u64)> = counts
        .0
        .iter()
        .filter(|(_, n)| **n < ceiling)
        .map(|(p, n)| (p.clone(), *n))
        .collect();
    rare.sort();
    for (pos, n) in rare {
        ceilings.insert(pos, (n + 1).max(ceiling));
    }
    if ceilings.is_empty() {
        Vec::new()
    } else {
        vec![Mutation::Flow { ceilings }]
    }
}
