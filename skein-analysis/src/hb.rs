//! The happens before engine
//!
//! One sweep over the trace in t-sort order, maintaining a strong and
//! a weak clock per routine plus per primitive synchronization state.
//! Every executed event gets inc-then-snapshot clocks; stuck events
//! are clocked from their routine's final state and synchronize
//! nothing. Each join is also recorded as an immediate HB edge so the
//! partial order graph reproduces exactly the clock order.
use crate::AnalyzerFlag;
use anyhow::Result;
use enumflags2::BitFlags;
use fxhash::FxHashMap;
use log::{debug, warn};
use skein_trace::{
    clock::VectorClock,
    event::{ChannelOp, CondOp, EventKind, OpRef, WgOp},
    trace::Trace,
    CancelFlag, Eid, PrimitiveId, RoutineId,
};

/// An immediate happens before edge. Critical section edges (release
/// to acquire) are marked, the weak order drops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HbEdge {
    pub from: Eid,
    pub to: Eid,
    pub critical_section: bool,
}

impl HbEdge {
    fn new(from: Eid, to: Eid) -> Self {
        Self { from, to, critical_section: false }
    }

    fn critical(from: Eid, to: Eid) -> Self {
        Self { from, to, critical_section: true }
    }
}

#[derive(Debug, Clone, Default)]
struct Snap {
    strong: VectorClock,
    weak: VectorClock,
}

// the add/done events of one zero crossing of a wait group. A wait
// marks the episode consumed; the next add starts a fresh one, so a
// reused wait group never leaks edges across rounds.
#[derive(Debug, Default)]
struct WgEpisode {
    contributors: Vec<Eid>,
    acc: Snap,
    waited: bool,
}

#[derive(Debug, Default)]
struct State {
    strong: FxHashMap<RoutineId, VectorClock>,
    weak: FxHashMap<RoutineId, VectorClock>,
    // stashed clock of each buffered send, keyed by the send's event
    buf: FxHashMap<Eid, Snap>,
    close: FxHashMap<PrimitiveId, (Eid, Snap)>,
    release: FxHashMap<PrimitiveId, (Eid, VectorClock)>,
    wg: FxHashMap<PrimitiveId, WgEpisode>,
    signals: FxHashMap<PrimitiveId, Vec<(Eid, Snap)>>,
    bcast: FxHashMap<PrimitiveId, (Eid, Snap)>,
    once: FxHashMap<PrimitiveId, (Eid, Snap)>,
    store: FxHashMap<PrimitiveId, (Eid, Snap)>,
    // events whose snapshot was joined into a routine's clock; an edge
    // to that routine's next event is still owed
    pending: FxHashMap<RoutineId, Vec<Eid>>,
    last: FxHashMap<RoutineId, Eid>,
    edges: Vec<HbEdge>,
}

// the synchronization behavior of one event, extracted up front so
// the clock updates can borrow the trace mutably
#[derive(Debug, Clone)]
enum Op {
    Chan {
        prim: PrimitiveId,
        op: ChannelOp,
        buffered: bool,
        closed: bool,
        partner: Option<OpRef>,
    },
    Acquire(PrimitiveId),
    Release(PrimitiveId),
    WgAdd(PrimitiveId),
    WgWait(PrimitiveId),
    CondWait(PrimitiveId),
    CondSignal(PrimitiveId),
    CondBroadcast(PrimitiveId),
    OnceFirst(PrimitiveId),
    OnceLater(PrimitiveId),
    Atomic { prim: PrimitiveId, read: bool, write: bool },
    Fork(RoutineId),
    Nop,
}

fn classify(trace: &Trace, eid: Eid) -> Op {
    let ev = trace.event(eid);
    match &ev.kind {
        EventKind::Channel(c) => Op::Chan {
            prim: c.prim,
            op: c.op,
            buffered: c.buffered(),
            closed: c.closed,
            partner: c.partner,
        },
        EventKind::Select(s) => match s.chosen_case() {
            None => Op::Nop,
            Some((_, case)) => Op::Chan {
                prim: case.chan.prim,
                op: case.chan.op,
                buffered: case.chan.buffered(),
                closed: case.chan.closed,
                partner: case.chan.partner,
            },
        },
        EventKind::Mutex { prim, op, suc, .. } => {
            if op.is_try() && !suc {
                Op::Nop
            } else if op.is_acquire() {
                Op::Acquire(*prim)
            } else if op.is_release() {
                Op::Release(*prim)
            } else {
                Op::Nop
            }
        }
        EventKind::WaitGroup { prim, op, .. } => match op {
            WgOp::Add => Op::WgAdd(*prim),
            WgOp::Wait => Op::WgWait(*prim),
        },
        EventKind::Cond { prim, op } => match op {
            CondOp::Wait => Op::CondWait(*prim),
            CondOp::Signal => Op::CondSignal(*prim),
            CondOp::Broadcast => Op::CondBroadcast(*prim),
        },
        EventKind::Once { prim, suc } => {
            if *suc {
                Op::OnceFirst(*prim)
            } else {
                Op::OnceLater(*prim)
            }
        }
        EventKind::Atomic { prim, op } => {
            Op::Atomic { prim: *prim, read: op.is_read(), write: op.is_write() }
        }
        EventKind::Fork { routine } => Op::Fork(*routine),
        EventKind::New { .. } | EventKind::End | EventKind::Replay { .. } => Op::Nop,
    }
}

/// Annotate every event with its strong (and, when enabled, weak)
/// vector clock and return the immediate HB edge list. Malformed
/// links are tolerated and logged, the sweep continues without them.
pub fn annotate(
    trace: &mut Trace,
    flags: BitFlags<AnalyzerFlag>,
    cancel: &CancelFlag,
) -> Result<Vec<HbEdge>> {
    trace.sort();
    let weak_on = flags.contains(AnalyzerFlag::WeakClocks);
    let order: Vec<Eid> = trace.iter().collect();
    let mut st = State::default();
    for eid in order {
        cancel.check()?;
        step(trace, &mut st, eid, weak_on);
    }
    debug!("hb annotation done, {} edges", st.edges.len());
    Ok(st.edges)
}

fn step(trace: &mut Trace, st: &mut State, eid: Eid, weak_on: bool) {
    let (r, stuck) = {
        let ev = trace.event(eid);
        (ev.routine, ev.is_stuck())
    };
    let op = if stuck { Op::Nop } else { classify(trace, eid) };
    // incoming joins
    match &op {
        Op::Chan { op: ChannelOp::Recv, closed: true, prim, .. } => {
            match st.close.get(prim) {
                Some((c, snap)) => {
                    let (c, snap) = (*c, snap.clone());
                    join(st, r, &snap, weak_on);
                    st.edges.push(HbEdge::new(c, eid));
                }
                None => warn!("receive from closed channel {prim} without a close"),
            }
        }
        Op::Chan { op: ChannelOp::Recv, partner: Some(p), buffered, .. } => {
            let p = *p;
            if *buffered {
                match st.buf.get(&p.eid) {
                    Some(snap) => {
                        let snap = snap.clone();
                        join(st, r, &snap, weak_on);
                        st.edges.push(HbEdge::new(p.eid, eid));
                    }
                    None => warn!("buffered receive {eid} dequeued an unseen send"),
                }
            } else if trace.event(p.eid).vc.is_some() {
                // rendezvous, the later side joins and the sender's
                // routine learns of the receive below
                let snap = snap_of(trace, p.eid);
                join(st, r, &snap, weak_on);
                st.edges.push(HbEdge::new(p.eid, eid));
            }
        }
        Op::Chan { op: ChannelOp::Send, partner: Some(p), buffered: false, .. } => {
            // only when the receive was recorded first
            let p = *p;
            if trace.event(p.eid).vc.is_some() {
                let snap = snap_of(trace, p.eid);
                join(st, r, &snap, weak_on);
                st.edges.push(HbEdge::new(p.eid, eid));
            }
        }
        Op::Acquire(prim) => {
            if let Some((rel, vc)) = st.release.get(prim) {
                let (rel, vc) = (*rel, vc.clone());
                st.strong.entry(r).or_default().join(&vc);
                st.edges.push(HbEdge::critical(rel, eid));
            }
        }
        Op::WgWait(prim) => {
            let episode = st.wg.get_mut(prim).map(|ep| {
                ep.waited = true;
                (ep.contributors.clone(), ep.acc.clone())
            });
            if let Some((contributors, snap)) = episode {
                join(st, r, &snap, weak_on);
                for c in contributors {
                    st.edges.push(HbEdge::new(c, eid));
                }
            }
        }
        Op::CondWait(prim) => {
            let sig = st.signals.get_mut(prim).and_then(|q| {
                if q.is_empty() {
                    None
                } else {
                    Some(q.remove(0))
                }
            });
            match sig {
                Some((s, snap)) => {
                    join(st, r, &snap, weak_on);
                    st.edges.push(HbEdge::new(s, eid));
                }
                None => {
                    if let Some((b, snap)) = st.bcast.get(prim) {
                        let (b, snap) = (*b, snap.clone());
                        join(st, r, &snap, weak_on);
                        st.edges.push(HbEdge::new(b, eid));
                    }
                }
            }
        }
        Op::OnceLater(prim) => {
            if let Some((first, snap)) = st.once.get(prim) {
                let (first, snap) = (*first, snap.clone());
                join(st, r, &snap, weak_on);
                st.edges.push(HbEdge::new(first, eid));
            }
        }
        Op::Atomic { prim, read: true, .. } => {
            if let Some((w, snap)) = st.store.get(prim) {
                let (w, snap) = (*w, snap.clone());
                join(st, r, &snap, weak_on);
                st.edges.push(HbEdge::new(w, eid));
            }
        }
        Op::Chan { .. }
        | Op::Release(_)
        | Op::WgAdd(_)
        | Op::CondSignal(_)
        | Op::CondBroadcast(_)
        | Op::OnceFirst(_)
        | Op::Atomic { .. }
        | Op::Fork(_)
        | Op::Nop => (),
    }
    // program order tick and snapshot
    st.strong.entry(r).or_default().inc(r);
    let snap_s = st.strong[&r].clone();
    let snap_w = if weak_on {
        st.weak.entry(r).or_default().inc(r);
        st.weak[&r].clone()
    } else {
        VectorClock::new()
    };
    {
        let ev = trace.event_mut(eid);
        ev.vc = Some(snap_s.clone());
        ev.wvc = if weak_on { Some(snap_w.clone()) } else { None };
    }
    if let Some(prev) = st.last.insert(r, eid) {
        st.edges.push(HbEdge::new(prev, eid));
    }
    if let Some(owed) = st.pending.remove(&r) {
        for src in owed {
            st.edges.push(HbEdge::new(src, eid));
        }
    }
    if stuck {
        return;
    }
    // outgoing state updates
    let snap = Snap { strong: snap_s, weak: snap_w };
    match op {
        Op::Chan { op: ChannelOp::Send, buffered: true, .. } => {
            st.buf.insert(eid, snap);
        }
        Op::Chan { op: ChannelOp::Send, buffered: false, partner: Some(p), .. } => {
            // if the receive already ran, its routine learns of us now
            if trace.event(p.eid).vc.is_some() {
                let pr = trace.event(p.eid).routine;
                join(st, pr, &snap, weak_on);
                st.pending.entry(pr).or_default().push(eid);
            }
        }
        Op::Chan { op: ChannelOp::Recv, buffered: false, closed: false, partner: Some(p), .. } => {
            // rendezvous back edge into the sender's routine
            if trace.event(p.eid).vc.is_some() {
                let pr = trace.event(p.eid).routine;
                join(st, pr, &snap, weak_on);
                st.pending.entry(pr).or_default().push(eid);
            }
        }
        Op::Chan { op: ChannelOp::Close, prim, .. } => {
            st.close.insert(prim, (eid, snap));
        }
        Op::Release(prim) => {
            st.release.insert(prim, (eid, snap.strong));
        }
        Op::WgAdd(prim) => {
            let ep = st.wg.entry(prim).or_default();
            if ep.waited {
                // the previous zero crossing is over, this add opens
                // the next one
                ep.contributors.clear();
                ep.acc = Snap::default();
                ep.waited = false;
            }
            ep.contributors.push(eid);
            ep.acc.strong.join(&snap.strong);
            ep.acc.weak.join(&snap.weak);
        }
        Op::CondSignal(prim) => {
            st.signals.entry(prim).or_default().push((eid, snap));
        }
        Op::CondBroadcast(prim) => {
            st.bcast.insert(prim, (eid, snap));
        }
        Op::OnceFirst(prim) => {
            st.once.insert(prim, (eid, snap));
        }
        Op::Atomic { prim, write: true, .. } => {
            st.store.insert(prim, (eid, snap));
        }
        Op::Fork(child) => {
            st.strong.entry(child).or_default().join(&snap.strong);
            if weak_on {
                st.weak.entry(child).or_default().join(&snap.weak);
            }
            st.pending.entry(child).or_default().push(eid);
        }
        Op::Chan { .. }
        | Op::Acquire(_)
        | Op::WgWait(_)
        | Op::CondWait(_)
        | Op::OnceLater(_)
        | Op::Atomic { .. }
        | Op::Nop => (),
    }
}

fn snap_of(trace: &Trace, eid: Eid) -> Snap {
    let ev = trace.event(eid);
    Snap {
        strong: ev.vc.clone().unwrap_or_default(),
        weak: ev.wvc.clone().unwrap_or_default(),
    }
}

fn join(st: &mut State, r: RoutineId, snap: &Snap, weak_on: bool) {
    st.strong.entry(r).or_default().join(&snap.strong);
    if weak_on {
        st.weak.entry(r).or_default().join(&snap.weak);
    }
}

#[cfg(test)]
mod test;
