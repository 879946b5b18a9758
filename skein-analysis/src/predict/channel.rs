//! Concurrent receives on one channel and select cases with no
//! possible partner anywhere in the trace
use super::{Bug, BugKind, Report};
use fxhash::FxHashMap;
use skein_trace::{
    clock::ClockRel,
    event::{ChannelOp, EventKind, OpRef},
    trace::Trace,
    PrimitiveId,
};

pub(super) fn detect(trace: &Trace, report: &mut Report) {
    let ops = trace.chan_ops();
    let mut recvs: FxHashMap<PrimitiveId, Vec<OpRef>> = FxHashMap::default();
    for r in &ops {
        // only receives that actually ran can race each other
        if let Some(i) = r.case {
            let chosen = trace
                .event(r.eid)
                .select()
                .map(|s| s.chosen_index == i as i32)
                .unwrap_or(false);
            if !chosen {
                continue;
            }
        }
        let c = match trace.chan(*r) {
            Some(c) => c,
            None => continue,
        };
        if c.op == ChannelOp::Recv && !trace.event(r.eid).is_stuck() {
            recvs.entry(c.prim).or_default().push(*r);
        }
    }
    for (_, rs) in &recvs {
        for (i, a) in rs.iter().enumerate() {
            for b in rs.iter().skip(i + 1) {
                if a.eid == b.eid {
                    continue;
                }
                let rel =
                    trace.event(a.eid).vc().compare(trace.event(b.eid).vc());
                if rel == ClockRel::Concurrent {
                    report.push(
                        trace,
                        Bug::new(BugKind::ConcurrentRecv, [*a, *b], []),
                    );
                }
            }
        }
    }
    for eid in trace.iter() {
        let s = match &trace.event(eid).kind {
            EventKind::Select(s) => s,
            _ => continue,
        };
        for (i, case) in s.cases.iter().enumerate() {
            let me = OpRef::case(eid, i);
            let peer = ops.iter().any(|o| {
                if o.eid == eid {
                    return false;
                }
                match trace.chan(*o) {
                    Some(c) => {
                        c.prim == case.chan.prim
                            && Some(c.op) == case.chan.op.opposite()
                    }
                    None => false,
                }
            });
            if !peer {
                report.push(trace, Bug::new(BugKind::SelectWithoutPartner, [me], []));
            }
        }
    }
}
