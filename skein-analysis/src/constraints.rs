//! Read-from and recv-from constraints
//!
//! Positive constraints tie each atomic load to the chronologically
//! last store of the same variable and each unbuffered receive to its
//! send. Negative constraints are minted by predictors when a pairing
//! must be forbidden; together they steer the replay runtime and the
//! chain builder toward feasible reschedulings.
use fxhash::FxHashMap;
use skein_trace::{
    event::{EventKind, OpRef},
    trace::Trace,
    Eid, PrimitiveId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// the load observes the store
    ReadFrom { read: Eid, write: Eid },
    /// the receive consumes the send's value
    RecvFrom { recv: OpRef, send: OpRef },
    /// the load must not observe the store
    NotReadFrom { read: Eid, write: Eid },
    /// the receive must not pair with the send
    NotRecvFrom { recv: OpRef, send: OpRef },
}

impl Constraint {
    /// the forbidding form of a positive constraint; negative
    /// constraints are returned unchanged
    pub fn negate(self) -> Constraint {
        match self {
            Self::ReadFrom { read, write } => Self::NotReadFrom { read, write },
            Self::RecvFrom { recv, send } => Self::NotRecvFrom { recv, send },
            neg => neg,
        }
    }
}

/// Extract the positive constraint set of a trace in t-sort order
pub fn extract(trace: &Trace) -> Vec<Constraint> {
    let mut out = Vec::new();
    let mut last_store: FxHashMap<PrimitiveId, Eid> = FxHashMap::default();
    for eid in trace.iter() {
        let ev = trace.event(eid);
        if ev.is_stuck() {
            continue;
        }
        match &ev.kind {
            EventKind::Atomic { prim, op } => {
                if op.is_read() {
                    if let Some(w) = last_store.get(prim) {
                        out.push(Constraint::ReadFrom { read: eid, write: *w });
                    }
                }
                if op.is_write() {
                    last_store.insert(*prim, eid);
                }
            }
            EventKind::Channel(c) => {
                if c.op == skein_trace::event::ChannelOp::Recv
                    && !c.buffered()
                    && !c.closed
                {
                    if let Some(send) = c.partner {
                        out.push(Constraint::RecvFrom {
                            recv: OpRef::plain(eid),
                            send,
                        });
                    }
                }
            }
            EventKind::Select(s) => {
                if let Some((i, case)) = s.chosen_case() {
                    let c = &case.chan;
                    if c.op == skein_trace::event::ChannelOp::Recv
                        && !c.buffered()
                        && !c.closed
                    {
                        if let Some(send) = c.partner {
                            out.push(Constraint::RecvFrom {
                                recv: OpRef::case(eid, i),
                                send,
                            });
                        }
                    }
                }
            }
            _ => (),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use skein_trace::{parser::parse_trace, RoutineId};

    #[test]
    fn loads_read_the_last_store() {
        let t = parse_trace(
            "A,1,5,S,a.go:1,A,3,5,S,a.go:2\nA,4,5,L,b.go:1,A,2,5,L,b.go:2",
        )
        .unwrap();
        let r1 = t.routine(RoutineId(1)).unwrap().to_vec();
        let r2 = t.routine(RoutineId(2)).unwrap().to_vec();
        let cs = extract(&t);
        // t order: store@1, load@2 (reads store@1), store@3, load@4
        assert_eq!(
            cs,
            vec![
                Constraint::ReadFrom { read: r2[0], write: r1[0] },
                Constraint::ReadFrom { read: r2[1], write: r1[1] },
            ]
        );
    }

    #[test]
    fn unbuffered_recv_from_send() {
        let t =
            parse_trace("C,2,3,7,S,f,1,0,0,a.go:1\nC,2,4,7,R,f,1,0,0,b.go:1").unwrap();
        let send = t.routine(RoutineId(1)).unwrap()[0];
        let recv = t.routine(RoutineId(2)).unwrap()[0];
        assert_eq!(
            extract(&t),
            vec![Constraint::RecvFrom {
                recv: OpRef::plain(recv),
                send: OpRef::plain(send),
            }]
        );
    }

    #[test]
    fn negate_flips_positive_only() {
        let c = Constraint::ReadFrom { read: Eid(1), write: Eid(2) };
        let n = c.negate();
        assert_eq!(n, Constraint::NotReadFrom { read: Eid(1), write: Eid(2) });
        assert_eq!(n.negate(), n);
    }
}
