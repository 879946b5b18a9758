//! Partial order graph index: nodes are events, edges are the
//! immediate HB edges the sweep recorded. Two events are concurrent
//! iff neither reaches the other.
use super::ConcOpts;
use crate::hb::HbEdge;
use skein_trace::{trace::Trace, Eid};

#[derive(Debug, Default)]
pub struct PoGraph {
    fwd_strong: Vec<Vec<u32>>,
    bwd_strong: Vec<Vec<u32>>,
    fwd_weak: Vec<Vec<u32>>,
    bwd_weak: Vec<Vec<u32>>,
}

impl PoGraph {
    pub fn build(trace: &Trace, edges: &[HbEdge]) -> Self {
        let n = trace
            .routines()
            .flat_map(|(_, seq)| seq.iter())
            .map(|e| e.0 as usize + 1)
            .max()
            .unwrap_or(0);
        let mut g = Self {
            fwd_strong: vec![Vec::new(); n],
            bwd_strong: vec![Vec::new(); n],
            fwd_weak: vec![Vec::new(); n],
            bwd_weak: vec![Vec::new(); n],
        };
        for e in edges {
            let (from, to) = (e.from.0 as usize, e.to.0 as usize);
            if from >= n || to >= n {
                continue;
            }
            g.fwd_strong[from].push(e.to.0);
            g.bwd_strong[to].push(e.from.0);
            if !e.critical_section {
                g.fwd_weak[from].push(e.to.0);
                g.bwd_weak[to].push(e.from.0);
            }
        }
        g
    }

    fn reach(&self, start: Eid, fwd: bool, weak: bool, seen: &mut [bool]) {
        let adj = match (fwd, weak) {
            (true, false) => &self.fwd_strong,
            (false, false) => &self.bwd_strong,
            (true, true) => &self.fwd_weak,
            (false, true) => &self.bwd_weak,
        };
        let mut stack = vec![start.0];
        while let Some(i) = stack.pop() {
            if seen[i as usize] {
                continue;
            }
            seen[i as usize] = true;
            stack.extend(adj[i as usize].iter().copied().filter(|j| !seen[*j as usize]));
        }
    }

    pub fn concurrent(&self, trace: &Trace, e: Eid, opts: ConcOpts) -> Vec<Eid> {
        let n = self.fwd_strong.len();
        if e.0 as usize >= n {
            return Vec::new();
        }
        let mut ordered = vec![false; n];
        self.reach(e, true, opts.weak, &mut ordered);
        self.reach(e, false, opts.weak, &mut ordered);
        let ev = trace.event(e);
        let mut out = Vec::new();
        for f in trace.iter() {
            if f == e || f.0 as usize >= n || ordered[f.0 as usize] {
                continue;
            }
            if opts.same_primitive && !trace.event(f).kind.same_primitive(&ev.kind) {
                continue;
            }
            out.push(f);
            if !opts.all {
                return out;
            }
        }
        out.sort();
        out
    }
}
