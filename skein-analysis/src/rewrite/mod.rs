//! Trace rewriting: per predicted bug, a transformation of the
//! recorded trace into a schedule expected to trigger the bug at
//! replay, plus the replay exit code and the events the replayer must
//! enforce.
//!
//! Every transformation works on a deep copy, re-times events only,
//! and ends by validating that the result is still sortable without
//! violating per routine order and that no channel partner dangles.
//! A failed precondition or validation marks the bug non rewritable;
//! it stays in the report either way.
use crate::predict::{Bug, BugKind};
use anyhow::{anyhow, bail, Result};
use log::debug;
use skein_trace::{
    clock::ClockRel,
    event::{EventKind, OpRef, WgOp},
    trace::Trace,
    Eid, ExitCode, PrimitiveId, RoutineId,
};

mod closed;
mod deadlock;
mod leak_chan;
mod leak_sync;
mod mutex;
mod waitgroup;
#[cfg(test)]
mod test;

/// A rewritten schedule ready to be written out for partial replay
#[derive(Debug)]
pub struct Rewrite {
    pub trace: Trace,
    pub exit: ExitCode,
    /// events whose order the replayer must enforce, schedule order
    pub enforce: Vec<OpRef>,
    /// t-sort time at which guided replay engages, 0 from the start
    pub start_time: u64,
}

/// Derive the rewrite for a predicted bug. Errors mean the bug is not
/// rewritable under this recording.
pub fn rewrite(trace: &Trace, bug: &Bug) -> Result<Rewrite> {
    let res = match bug.kind {
        BugKind::PossibleSendClosed | BugKind::PossibleRecvClosed => {
            closed::rewrite(trace, bug)
        }
        BugKind::PossibleNegativeWg => waitgroup::rewrite(trace, bug),
        BugKind::PossibleUnlockBeforeLock => mutex::rewrite(trace, bug),
        BugKind::CyclicDeadlock => deadlock::rewrite(trace, bug),
        BugKind::LeakUnbufferedWith
        | BugKind::LeakBufferedWith
        | BugKind::LeakSelectWith => leak_chan::rewrite(trace, bug),
        BugKind::LeakMutex | BugKind::LeakWg | BugKind::LeakCond => {
            leak_sync::rewrite(trace, bug)
        }
        k => bail!("{} has no rewrite", k.code()),
    };
    if let Err(e) = &res {
        debug!("bug {} not rewritable: {e:#}", bug.kind.code());
    }
    res
}

pub(super) fn group1(bug: &Bug) -> Result<OpRef> {
    bug.group1
        .first()
        .copied()
        .ok_or_else(|| anyhow!("bug record carries no causing event"))
}

pub(super) fn group2(bug: &Bug) -> Result<OpRef> {
    bug.group2
        .first()
        .copied()
        .ok_or_else(|| anyhow!("bug record carries no rewrite peer"))
}

// every event concurrent with or HB-after x under the strong clocks.
// Within each routine this is a suffix, so shifting it by one delta
// preserves program order.
pub(super) fn concurrent_or_after(t: &Trace, x: Eid) -> Vec<Eid> {
    let xvc = t.event(x).vc().clone();
    let mut out = Vec::new();
    for (_, seq) in t.routines() {
        for eid in seq {
            if *eid == x {
                continue;
            }
            match xvc.compare(t.event(*eid).vc()) {
                ClockRel::Before | ClockRel::Concurrent => out.push(*eid),
                ClockRel::After | ClockRel::Equal => (),
            }
        }
    }
    out
}

pub(super) fn shift_events(t: &mut Trace, eids: &[Eid], delta: u64) {
    for eid in eids {
        let ev = t.event_mut(*eid);
        ev.tpre += delta;
        if ev.tpost != 0 {
            ev.tpost += delta;
        }
    }
}

/// shift a routine's events starting at time `from` by `delta`
pub(super) fn shift_routine_from(t: &mut Trace, r: RoutineId, from: u64, delta: u64) {
    let eids: Vec<Eid> = match t.routine(r) {
        Some(seq) => seq.iter().copied().filter(|e| t.event(*e).tpre >= from).collect(),
        None => return,
    };
    shift_events(t, &eids, delta)
}

/// smallest prefix sum of a wait group's deltas in t-sort order
pub(super) fn wg_min_prefix(t: &Trace, prim: PrimitiveId) -> i64 {
    let mut sum = 0;
    let mut min = 0;
    for eid in t.iter() {
        let ev = t.event(eid);
        if ev.is_stuck() {
            continue;
        }
        if let EventKind::WaitGroup { prim: p, op: WgOp::Add, delta, .. } = &ev.kind {
            if *p == prim {
                sum += delta;
                min = min.min(sum);
            }
        }
    }
    min
}

// post rewrite checks shared by every transformation
pub(super) fn validate(t: &mut Trace) -> Result<()> {
    let before: Vec<Vec<Eid>> =
        t.routines().map(|(_, seq)| seq.to_vec()).collect();
    t.sort();
    let after: Vec<Vec<Eid>> = t.routines().map(|(_, seq)| seq.to_vec()).collect();
    if before != after {
        bail!("rewrite violates per routine order")
    }
    for r in t.chan_ops() {
        if let Some(c) = t.chan(r) {
            if let Some(p) = c.partner {
                let back = t.chan(p).and_then(|c| c.partner);
                if back != Some(r) {
                    bail!("rewrite left a dangling channel partner")
                }
            }
        }
    }
    Ok(())
}
