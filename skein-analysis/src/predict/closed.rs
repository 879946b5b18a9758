//! Send, receive and close on a closed channel
use super::{Bug, BugKind, Report};
use fxhash::FxHashMap;
use skein_trace::{
    clock::ClockRel,
    event::{ChannelOp, OpRef},
    trace::Trace,
    PrimitiveId,
};

pub(super) fn detect(trace: &Trace, report: &mut Report) {
    let ops = trace.chan_ops();
    let mut closes: FxHashMap<PrimitiveId, Vec<OpRef>> = FxHashMap::default();
    for r in &ops {
        let c = match trace.chan(*r) {
            Some(c) => c,
            None => continue,
        };
        if c.op == ChannelOp::Close {
            closes.entry(c.prim).or_default().push(*r);
        }
    }
    for (prim, cs) in &closes {
        if prim.is_nil() {
            report.push(trace, Bug::new(BugKind::ActualCloseNil, [cs[0]], []));
        }
        for extra in &cs[1..] {
            report.push(trace, Bug::new(BugKind::ActualCloseClosed, [*extra], [cs[0]]));
        }
    }
    for r in &ops {
        // an unchosen select case never ran, it cannot hit the close
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
        let close = match closes.get(&c.prim).and_then(|cs| cs.first()) {
            Some(close) => *close,
            None => continue,
        };
        if close == *r {
            continue;
        }
        let cvc = trace.event(close.eid).vc();
        let evc = trace.event(r.eid).vc();
        match c.op {
            ChannelOp::Close => (),
            ChannelOp::Send => match cvc.compare(evc) {
                // the recorded order already put the close first: the
                // recording must have panicked on this send
                ClockRel::Before if !trace.event(r.eid).is_stuck() => {
                    report.push(
                        trace,
                        Bug::new(BugKind::ActualSendClosed, [*r], [close]),
                    );
                }
                ClockRel::Concurrent => {
                    report.push(
                        trace,
                        Bug::new(BugKind::PossibleSendClosed, [*r], [close]),
                    );
                }
                _ => (),
            },
            ChannelOp::Recv => {
                if c.closed {
                    report.push(
                        trace,
                        Bug::new(BugKind::ActualRecvClosed, [*r], [close]),
                    );
                } else if cvc.compare(evc) == ClockRel::Concurrent {
                    report.push(
                        trace,
                        Bug::new(BugKind::PossibleRecvClosed, [*r], [close]),
                    );
                }
            }
        }
    }
}
