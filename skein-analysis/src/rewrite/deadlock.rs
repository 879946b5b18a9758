//! Rewrite for a cyclic lock deadlock: cut the trace at the cycle,
//! line the guard holding routine segments up in front of it, and
//! spread the cycle's lock attempts so replay can exhibit them
//! racing.
use super::{shift_events, validate, Rewrite};
use crate::predict::Bug;
use anyhow::{bail, Result};
use fxhash::FxHashSet;
use skein_trace::{
    event::{EventKind, OpRef},
    trace::Trace,
    Eid, ExitCode, PrimitiveId, RoutineId,
};

pub(super) fn rewrite(orig: &Trace, bug: &Bug) -> Result<Rewrite> {
    let locks: Vec<OpRef> = bug.group1.to_vec();
    let guards: Vec<OpRef> = bug.group2.to_vec();
    if locks.len() < 2 || guards.len() != locks.len() {
        bail!("a lock cycle needs at least two locks, each with its holding guard")
    }
    let t_max = locks.iter().map(|l| orig.event(l.eid).tpre).max().unwrap_or(0);
    let mut t = orig.copy(true);
    t.shorten_to_time(t_max);
    // nothing in a cycle routine may run past its blocking lock; in
    // particular a recorded release of a cycle primitive after the
    // attempt must not reach the replayer
    for l in &locks {
        let (r, i) = {
            let ev = t.event(l.eid);
            (ev.routine, ev.index)
        };
        t.shorten_routine_to_index(r, i + 1);
    }
    // Move each guard's routine segment, the guard acquire and
    // everything after it, to just before the cycle. A segment whose
    // unlocks another guard depends on goes first, keeping the unlock
    // visible to the replayer.
    let mut cursor = t_max;
    let mut placed: FxHashSet<RoutineId> = FxHashSet::default();
    for gi in segment_order(&t, &locks, &guards) {
        let (r, start) = {
            let gev = t.event(guards[gi].eid);
            (gev.routine, gev.tpre)
        };
        if !placed.insert(r) {
            continue;
        }
        let seg: Vec<Eid> = match t.routine(r) {
            None => continue,
            Some(seq) => {
                seq.iter().copied().filter(|e| t.event(*e).tpre >= start).collect()
            }
        };
        let first = match seg.first() {
            None => continue,
            Some(e) => t.event(*e).tpre,
        };
        shift_events(&mut t, &seg, cursor + 1 - first);
        cursor =
            seg.iter().map(|e| t.event(*e).end_time()).max().unwrap_or(cursor);
    }
    // spread the attempts by the longest acquire the recording saw, so
    // the replay scheduler has room to interleave them
    let spread = orig
        .iter()
        .filter_map(|e| {
            let ev = orig.event(e);
            match &ev.kind {
                EventKind::Mutex { op, .. } if op.is_acquire() && !ev.is_stuck() => {
                    Some(ev.tpost - ev.tpre)
                }
                _ => None,
            }
        })
        .max()
        .unwrap_or(0)
        .max(2);
    for (i, l) in locks.iter().enumerate() {
        let ev = t.event_mut(l.eid);
        ev.tpre = cursor + 1 + i as u64 * spread;
        // the attempts stay stuck, replay is expected to block here
        ev.tpost = 0;
    }
    let penultimate = t.event(locks[locks.len() - 2].eid).tpre;
    t.append_replay_end(penultimate + 1, ExitCode::CyclicDeadlock)?;
    validate(&mut t)?;
    let mut enforce = guards;
    enforce.extend(locks);
    Ok(Rewrite {
        trace: t,
        exit: ExitCode::CyclicDeadlock,
        enforce,
        start_time: 0,
    })
}

// Guard i holds the primitive lock i is blocked on. Segment j must be
// placed before segment i when j's routine releases that primitive
// inside its own segment; ties keep the cycle order, an unsatisfiable
// ordering falls back to it.
fn segment_order(t: &Trace, locks: &[OpRef], guards: &[OpRef]) -> Vec<usize> {
    let n = guards.len();
    let prims: Vec<Option<PrimitiveId>> =
        locks.iter().map(|l| t.event(l.eid).prim()).collect();
    let releases = |j: usize, p: PrimitiveId| -> bool {
        let gev = t.event(guards[j].eid);
        match t.routine(gev.routine) {
            None => false,
            Some(seq) => seq.iter().any(|e| {
                let ev = t.event(*e);
                ev.tpre >= gev.tpre
                    && !ev.is_stuck()
                    && matches!(
                        &ev.kind,
                        EventKind::Mutex { prim, op, .. }
                            if *prim == p && op.is_release()
                    )
            }),
        }
    };
    let mut order = Vec::with_capacity(n);
    let mut left: Vec<usize> = (0..n).collect();
    while !left.is_empty() {
        let pick = left
            .iter()
            .position(|i| {
                !left.iter().any(|j| {
                    j != i && prims[*i].map(|p| releases(*j, p)).unwrap_or(false)
                })
            })
            .unwrap_or(0);
        order.push(left.remove(pick));
    }
    order
}
