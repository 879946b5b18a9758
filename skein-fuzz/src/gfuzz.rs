//! Select biasing mutations
//!
//! For every select in the recorded trace, emit one mutation per
//! alternative case. In the HB aware modes a case qualifies only if
//! some operation in the trace could pair with it under a different
//! schedule; classically every case qualifies. Per trace results are
//! merged into a session wide per file map so pairs never tried
//! before come out first.
use crate::mutation::Mutation;
use arcstr::ArcStr;
use fxhash::{FxHashMap, FxHashSet};
use indexmap::IndexMap;
use skein_trace::{
    event::EventKind,
    trace::Trace,
    Eid,
};

/// (position line, case) pairs already emitted, per source file
#[derive(Debug, Default)]
pub struct SelectHistory(FxHashMap<ArcStr, FxHashSet<(u32, i32)>>);

impl SelectHistory {
    fn seen(&self, file: &ArcStr, line: u32, case: i32) -> bool {
        self.0.get(file).map(|s| s.contains(&(line, case))).unwrap_or(false)
    }

    fn record(&mut self, file: &ArcStr, line: u32, case: i32) {
        self.0.entry(file.clone()).or_default().insert((line, case));
    }
}

// a case can fire iff some op in the trace runs the opposite
// direction on the same channel, concurrently with the select
fn case_has_partner(trace: &Trace, sel: Eid, case_idx: usize) -> bool {
    let s = match trace.event(sel).select() {
        Some(s) => s,
        None => return false,
    };
    let case = &s.cases[case_idx];
    let opposite = match case.chan.op.opposite() {
        Some(o) => o,
        None => return false,
    };
    let svc = trace.event(sel).vc();
    trace.chan_ops().into_iter().any(|o| {
        if o.eid == sel {
            return false;
        }
        match trace.chan(o) {
            Some(c) => {
                c.prim == case.chan.prim
                    && c.op == opposite
                    && (svc.concurrent_with(trace.event(o.eid).vc())
                        || trace.event(o.eid).vc().happens_before(svc))
            }
            None => false,
        }
    })
}

pub fn mutations(
    trace: &Trace,
    use_hb: bool,
    history: &mut SelectHistory,
) -> Vec<Mutation> {
    let mut fresh = Vec::new();
    let mut stale = Vec::new();
    for eid in trace.iter() {
        let s = match &trace.event(eid).kind {
            EventKind::Select(s) => s,
            _ => continue,
        };
        let pos = trace.event(eid).pos.clone();
        let mut alternatives: Vec<i32> = Vec::new();
        for i in 0..s.cases.len() {
            if s.chosen_index == i as i32 {
                continue;
            }
            if use_hb && !case_has_partner(trace, eid, i) {
                continue;
            }
            alternatives.push(i as i32);
        }
        if s.has_default && !s.chose_default() {
            alternatives.push(-1);
        }
        for case in alternatives {
            let mut choices = IndexMap::new();
            choices.insert(pos.clone(), vec![case]);
            let m = Mutation::Select { choices };
            if history.seen(&pos.file, pos.line, case) {
                stale.push(m);
            } else {
                history.record(&pos.file, pos.line, case);
                fresh.push(m);
            }
        }
    }
    fresh.extend(stale);
    fresh
}

#[cfg(test)]
mod test {
    use super::*;
    use skein_trace::parser::parse_trace;

    #[test]
    fn every_alternative_case_once() {
        let t = parse_trace("S,2,4,8,7.R.f.1.0~9.S.f.2.0~d,0,a.go:1").unwrap();
        let mut h = SelectHistory::default();
        let ms = mutations(&t, false, &mut h);
        // case 1 and the default; case 0 was the recorded choice
        assert_eq!(ms.len(), 2);
        // the same trace again yields the same pairs, now stale but
        // still proposed
        let again = mutations(&t, false, &mut h);
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn hb_mode_requires_a_partner() {
        let mut t = parse_trace(
            "S,2,4,8,7.R.f.1.0~9.S.f.2.0,0,a.go:1\nC,3,0,9,R,f,9,0,0,b.go:1",
        )
        .unwrap();
        let _ = skein_analysis::hb::annotate(
            &mut t,
            enumflags2::BitFlags::empty(),
            &skein_trace::CancelFlag::new(),
        )
        .unwrap();
        let mut h = SelectHistory::default();
        let ms = mutations(&t, true, &mut h);
        // only case 1 (send on 9) has a peer, the stuck receive on 9
        assert_eq!(ms.len(), 1);
    }
}
