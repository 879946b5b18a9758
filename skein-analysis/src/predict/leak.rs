//! Leak detection: operations that never completed and routines that
//! outlived the recording
use super::{Bug, BugKind, Report};
use crate::conc::ConcIndex;
use skein_trace::{
    event::{ChannelEv, CondOp, EventKind, OpRef, WgOp},
    trace::Trace,
    Eid,
};

// a partner the stuck op could have paired with in another schedule:
// opposite direction, same channel, HB concurrent
fn possible_partner(trace: &Trace, stuck: Eid, chan: &ChannelEv) -> Option<OpRef> {
    let opposite = chan.op.opposite()?;
    let svc = trace.event(stuck).vc();
    trace.chan_ops().into_iter().find(|o| {
        if o.eid == stuck {
            return false;
        }
        match trace.chan(*o) {
            Some(c) => {
                c.prim == chan.prim
                    && c.op == opposite
                    && svc.concurrent_with(trace.event(o.eid).vc())
            }
            None => false,
        }
    })
}

pub(super) fn detect(trace: &Trace, _idx: &ConcIndex, report: &mut Report) {
    let ended = trace.routines().any(|(_, seq)| {
        seq.last()
            .map(|e| matches!(trace.event(*e).kind, EventKind::End))
            .unwrap_or(false)
    });
    for (_, seq) in trace.routines() {
        let last = match seq.last() {
            Some(last) => *last,
            None => continue,
        };
        let ev = trace.event(last);
        if !ev.is_stuck() {
            // a routine that neither ended nor blocked leaked while
            // still running, but only recordings that saw clean ends
            // can tell
            if ended && !matches!(ev.kind, EventKind::End) {
                report.push(
                    trace,
                    Bug::new(BugKind::LeakNoBlock, [OpRef::plain(last)], []),
                );
            }
            continue;
        }
        match &ev.kind {
            EventKind::Channel(c) => {
                if c.prim.is_nil() {
                    report.push(
                        trace,
                        Bug::new(BugKind::LeakNil, [OpRef::plain(last)], []),
                    );
                    continue;
                }
                let partner = possible_partner(trace, last, c);
                let kind = match (c.buffered(), partner) {
                    (false, Some(_)) => BugKind::LeakUnbufferedWith,
                    (false, None) => BugKind::LeakUnbufferedWithout,
                    (true, Some(_)) => BugKind::LeakBufferedWith,
                    (true, None) => BugKind::LeakBufferedWithout,
                };
                report.push(trace, Bug::new(kind, [OpRef::plain(last)], partner));
            }
            EventKind::Select(s) => {
                let mut found = None;
                for (i, case) in s.cases.iter().enumerate() {
                    if let Some(p) = possible_partner(trace, last, &case.chan) {
                        found = Some((OpRef::case(last, i), p));
                        break;
                    }
                }
                match found {
                    Some((me, p)) => {
                        report.push(
                            trace,
                            Bug::new(BugKind::LeakSelectWith, [me], [p]),
                        );
                    }
                    None => {
                        report.push(
                            trace,
                            Bug::new(
                                BugKind::LeakSelectWithout,
                                [OpRef::plain(last)],
                                [],
                            ),
                        );
                    }
                }
            }
            EventKind::Mutex { prim, op, .. } if op.is_acquire() => {
                // the holder whose release never came
                let holder = trace
                    .iter()
                    .filter(|e| {
                        let f = trace.event(*e);
                        !f.is_stuck()
                            && matches!(
                                &f.kind,
                                EventKind::Mutex { prim: p, op, suc, .. }
                                    if p == prim
                                        && op.is_acquire()
                                        && (!op.is_try() || *suc)
                            )
                    })
                    .last();
                report.push(
                    trace,
                    Bug::new(
                        BugKind::LeakMutex,
                        [OpRef::plain(last)],
                        holder.map(OpRef::plain),
                    ),
                );
            }
            EventKind::WaitGroup { op: WgOp::Wait, .. } => {
                report.push(trace, Bug::new(BugKind::LeakWg, [OpRef::plain(last)], []));
            }
            EventKind::Cond { prim, op: CondOp::Wait } => {
                let prim = *prim;
                // concurrent wake ups the rewrite can replay after the wait
                let svc = trace.event(last).vc();
                let wakes: Vec<OpRef> = trace
                    .iter()
                    .filter(|e| {
                        let f = trace.event(*e);
                        !f.is_stuck()
                            && matches!(
                                &f.kind,
                                EventKind::Cond { prim: p, op } if *p == prim
                                    && !matches!(op, CondOp::Wait)
                            )
                            && svc.concurrent_with(f.vc())
                    })
                    .map(OpRef::plain)
                    .collect();
                report.push(
                    trace,
                    Bug::new(BugKind::LeakCond, [OpRef::plain(last)], wakes),
                );
            }
            _ => {
                report.push(
                    trace,
                    Bug::new(BugKind::LeakNoBlock, [OpRef::plain(last)], []),
                );
            }
        }
    }
}
