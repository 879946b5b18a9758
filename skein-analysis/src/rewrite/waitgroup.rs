//! Rewrite for a schedulable negative wait group counter: hold the
//! non forced adds back until the dones have drained the counter.
use super::{group1, shift_routine_from, validate, wg_min_prefix, Rewrite};
use crate::predict::Bug;
use anyhow::{anyhow, bail, Result};
use fxhash::FxHashMap;
use skein_trace::{
    event::{EventKind, WgOp},
    trace::Trace,
    Eid, ExitCode, RoutineId,
};

pub(super) fn rewrite(orig: &Trace, bug: &Bug) -> Result<Rewrite> {
    let first = group1(bug)?;
    let prim = orig
        .event(first.eid)
        .prim()
        .ok_or_else(|| anyhow!("bug record does not name a wait group"))?;
    let dones: Vec<Eid> = bug.group1.iter().map(|r| r.eid).collect();
    let forced: Vec<Eid> = bug.group2.iter().map(|r| r.eid).collect();
    let mut t = orig.copy(true);
    let target = dones.iter().map(|d| t.event(*d).end_time()).max().unwrap_or(0);
    // adds not forced before the dones step aside until the dones ran
    let mut late_by_routine: FxHashMap<RoutineId, u64> = FxHashMap::default();
    for eid in t.iter() {
        let ev = t.event(eid);
        if ev.is_stuck() || forced.contains(&eid) || dones.contains(&eid) {
            continue;
        }
        if let EventKind::WaitGroup { prim: p, op: WgOp::Add, delta, .. } = &ev.kind {
            if *p == prim && *delta > 0 && ev.tpre <= target {
                let e = late_by_routine.entry(ev.routine).or_insert(ev.tpre);
                *e = (*e).min(ev.tpre);
            }
        }
    }
    for (r, from) in late_by_routine {
        shift_routine_from(&mut t, r, from, target + 1 - from);
    }
    if wg_min_prefix(&t, prim) >= 0 {
        bail!("reordering does not drive the counter negative")
    }
    t.append_replay_end(t.max_time() + 1, ExitCode::NegativeWg)?;
    validate(&mut t)?;
    let mut enforce: Vec<_> = bug.group2.to_vec();
    enforce.extend(bug.group1.iter().copied());
    Ok(Rewrite { trace: t, exit: ExitCode::NegativeWg, enforce, start_time: 0 })
}
