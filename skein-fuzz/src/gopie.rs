//! Chain perturbation
//!
//! Seeds chains from cross routine pairs of eligible operations, then
//! grows a mutation set by applying the four rewriting rules with
//! energy bounded randomness: abridge (drop an end), flip (swap
//! concurrent neighbors), substitute (swap in another op of the same
//! routine), augment (extend with an op concurrent with the tail).
use crate::chain::{eligible, Chain};
use fxhash::FxHashMap;
use rand::{seq::SliceRandom, Rng};
use skein_analysis::conc::{ConcIndex, ConcOpts};
use skein_trace::{trace::Trace, Eid, RoutineId};

/// Rel1 maps each routine to its pool of eligible events; Rel2 maps
/// each eligible event to the events it can neighbor in a chain: ops
/// on the same primitive from other routines, or any concurrent event
/// in the HB guided modes.
#[derive(Debug, Default)]
pub struct Pools {
    rel1: FxHashMap<RoutineId, Vec<Eid>>,
    rel2: FxHashMap<Eid, Vec<Eid>>,
}

impl Pools {
    pub fn build(trace: &Trace, hb_mode: bool, idx: Option<&ConcIndex>) -> Self {
        let mut pools = Self::default();
        let all: Vec<Eid> = trace
            .iter()
            .filter(|e| eligible(&trace.event(*e).kind, hb_mode))
            .collect();
        for e in &all {
            pools.rel1.entry(trace.event(*e).routine).or_default().push(*e);
        }
        for e in &all {
            let ev = trace.event(*e);
            let peers: Vec<Eid> = match (hb_mode, idx) {
                (true, Some(idx)) => idx
                    .concurrent(trace, *e, ConcOpts::all())
                    .into_iter()
                    .filter(|f| eligible(&trace.event(*f).kind, hb_mode))
                    .collect(),
                _ => all
                    .iter()
                    .copied()
                    .filter(|f| {
                        *f != *e
                            && trace.event(*f).routine != ev.routine
                            && trace.event(*f).kind.same_primitive(&ev.kind)
                    })
                    .collect(),
            };
            pools.rel2.insert(*e, peers);
        }
        pools
    }

    pub fn rel1(&self, r: RoutineId) -> &[Eid] {
        self.rel1.get(&r).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn rel2(&self, e: Eid) -> &[Eid] {
        self.rel2.get(&e).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// cross routine seed pairs
    pub fn seeds(&self, trace: &Trace) -> Vec<Chain> {
        let mut out = Vec::new();
        for (e, peers) in &self.rel2 {
            for f in peers {
                if let Some(c) = Chain::pair(trace, *e, *f) {
                    if c.is_valid(trace) {
                        out.push(c);
                    }
                }
            }
        }
        out
    }
}

/// One round of rule application, optionally followed by select case
/// enumeration. `energy` bounds how many descendants each rule may
/// contribute.
pub fn mutate(
    chain: &Chain,
    trace: &Trace,
    pools: &Pools,
    energy: usize,
    select_variants: bool,
    rng: &mut impl Rng,
) -> Vec<Chain> {
    let mut out: Vec<Chain> = Vec::new();
    // abridge
    if chain.len() > 1 {
        let mut head = chain.clone();
        head.remove_head();
        let mut tail = chain.clone();
        tail.remove_tail();
        out.push(head);
        out.push(tail);
    }
    // flip
    for i in 0..chain.len().saturating_sub(1) {
        let mut c = chain.clone();
        if c.swap(trace, i, i + 1) && c.is_valid(trace) {
            out.push(c);
        }
    }
    // substitute
    let mut subs: Vec<Chain> = Vec::new();
    for (i, e) in chain.elems().iter().enumerate() {
        for cand in pools.rel1(trace.event(*e).routine) {
            if chain.contains(*cand) {
                continue;
            }
            let mut c = chain.clone();
            if c.replace(trace, i, *cand) && c.is_valid(trace) {
                subs.push(c);
            }
        }
    }
    subs.shuffle(rng);
    out.extend(subs.into_iter().take(energy));
    // augment
    let mut grown: Vec<Chain> = Vec::new();
    if let Some(last) = chain.last() {
        for cand in pools.rel2(last) {
            if chain.contains(*cand) {
                continue;
            }
            let mut c = chain.clone();
            if c.add(trace, *cand) && c.is_valid(trace) {
                grown.push(c);
            }
        }
    }
    grown.shuffle(rng);
    out.extend(grown.into_iter().take(energy));
    // select case siblings of everything produced so far
    if select_variants {
        let mut siblings = Vec::new();
        for c in &out {
            siblings.extend(c.mutate_select(trace));
        }
        out.extend(siblings);
    }
    out.retain(|c| !c.is_empty());
    out.truncate(energy * 4);
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use skein_trace::{parser::parse_trace, CancelFlag};

    fn analyzed(s: &str) -> Trace {
        let mut t = parse_trace(s).unwrap();
        skein_analysis::hb::annotate(
            &mut t,
            enumflags2::BitFlags::empty(),
            &CancelFlag::new(),
        )
        .unwrap();
        t
    }

    #[test]
    fn seeds_pair_ops_on_one_primitive() {
        let t = analyzed("M,1,2,4,-,L,t,a.go:1\nM,3,4,4,-,L,t,b.go:1");
        let pools = Pools::build(&t, false, None);
        let seeds = pools.seeds(&t);
        assert!(!seeds.is_empty());
        for c in &seeds {
            assert_eq!(c.len(), 2);
            assert!(c.is_valid(&t));
        }
    }

    #[test]
    fn mutation_respects_validity() {
        let t = analyzed(
            "M,1,2,4,-,L,t,a.go:1,M,5,6,5,-,L,t,a.go:2\nM,3,4,4,-,L,t,b.go:1,M,7,8,5,-,L,t,b.go:2",
        );
        let pools = Pools::build(&t, false, None);
        let mut rng = StdRng::seed_from_u64(7);
        for seed in pools.seeds(&t) {
            for m in mutate(&seed, &t, &pools, 4, true, &mut rng) {
                assert!(m.is_valid(&t), "invalid descendant {m}");
            }
        }
    }
}
