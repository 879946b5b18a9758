//! Negative wait group counters, actual and schedulable
use super::{Bug, BugKind, Report};
use fxhash::FxHashMap;
use skein_trace::{
    clock::ClockRel,
    event::{EventKind, OpRef, WgOp},
    trace::Trace,
    Eid, PrimitiveId,
};

pub(super) fn detect(trace: &Trace, report: &mut Report) {
    let mut groups: FxHashMap<PrimitiveId, Vec<Eid>> = FxHashMap::default();
    for eid in trace.iter() {
        let ev = trace.event(eid);
        if let EventKind::WaitGroup { prim, .. } = &ev.kind {
            groups.entry(*prim).or_default().push(eid);
        }
    }
    for (_, evs) in groups {
        let mut adds: Vec<(Eid, i64)> = Vec::new();
        let mut dones: Vec<Eid> = Vec::new();
        for eid in &evs {
            let ev = trace.event(*eid);
            if let EventKind::WaitGroup { op: WgOp::Add, delta, val, .. } = &ev.kind {
                if *val < 0 {
                    report.push(
                        trace,
                        Bug::new(BugKind::ActualNegativeWg, [OpRef::plain(*eid)], []),
                    );
                }
                if ev.is_stuck() {
                    continue;
                }
                if *delta > 0 {
                    adds.push((*eid, *delta));
                } else if *delta < 0 {
                    dones.push(*eid);
                }
            }
        }
        // For a done d, every done not HB-after d can run in one block
        // ending at d; only the adds HB-before one of those dones are
        // forced to precede the block. If they do not cover it, the
        // counter can be driven negative.
        for d in &dones {
            let dvc = trace.event(*d).vc();
            let block: Vec<Eid> = dones
                .iter()
                .copied()
                .filter(|d2| {
                    *d2 == *d
                        || dvc.compare(trace.event(*d2).vc()) != ClockRel::Before
                })
                .collect();
            let forced: Vec<(Eid, i64)> = adds
                .iter()
                .copied()
                .filter(|(a, _)| {
                    block.iter().any(|d2| {
                        trace.event(*a).vc().compare(trace.event(*d2).vc())
                            == ClockRel::Before
                    })
                })
                .collect();
            let sum: i64 = forced.iter().map(|(_, delta)| *delta).sum();
            if sum < block.len() as i64 {
                report.push(
                    trace,
                    Bug::new(
                        BugKind::PossibleNegativeWg,
                        block.iter().map(|e| OpRef::plain(*e)),
                        forced.iter().map(|(a, _)| OpRef::plain(*a)),
                    ),
                );
                break;
            }
        }
    }
}
