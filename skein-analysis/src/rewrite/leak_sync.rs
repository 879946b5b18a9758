//! Rewrites for leaked mutex, wait group and cond operations
use super::{
    concurrent_or_after, group1, shift_events, shift_routine_from, validate,
    wg_min_prefix, Rewrite,
};
use crate::predict::{Bug, BugKind};
use anyhow::{anyhow, bail, Result};
use skein_trace::{clock::ClockRel, event::OpRef, trace::Trace, Eid, ExitCode};

pub(super) fn rewrite(orig: &Trace, bug: &Bug) -> Result<Rewrite> {
    match bug.kind {
        BugKind::LeakMutex => mutex(orig, bug),
        BugKind::LeakWg => waitgroup(orig, bug),
        BugKind::LeakCond => cond(orig, bug),
        k => bail!("{} is not a synchronization leak", k.code()),
    }
}

// drop everything that raced with the stuck lock, the last holder
// included, so the lock can acquire at replay
fn mutex(orig: &Trace, bug: &Bug) -> Result<Rewrite> {
    let l = group1(bug)?;
    let holder = super::group2(bug)?;
    let lvc = orig.event(l.eid).vc();
    if lvc.compare(orig.event(holder.eid).vc()) != ClockRel::Concurrent {
        bail!("the last holder is ordered against the stuck lock")
    }
    let mut t = orig.copy(true);
    let ltpre = t.event(l.eid).tpre;
    t.shorten_to_time(ltpre);
    let racing: Vec<Eid> = t
        .iter()
        .filter(|e| {
            *e != l.eid
                && orig.event(l.eid).vc().compare(t.event(*e).vc())
                    == ClockRel::Concurrent
        })
        .collect();
    for e in racing {
        t.remove(e);
    }
    t.event_mut(l.eid).tpost = ltpre;
    t.append_replay_end(ltpre + 1, ExitCode::LeakMutex)?;
    validate(&mut t)?;
    Ok(Rewrite {
        trace: t,
        exit: ExitCode::LeakMutex,
        enforce: vec![l],
        start_time: 0,
    })
}

// push everything racing with or following the stuck wait past it and
// make sure the reordering never dips the counter below zero
fn waitgroup(orig: &Trace, bug: &Bug) -> Result<Rewrite> {
    let w = group1(bug)?;
    let prim = orig
        .event(w.eid)
        .prim()
        .ok_or_else(|| anyhow!("stuck wait does not name a wait group"))?;
    let mut t = orig.copy(true);
    let wpre = t.event(w.eid).tpre;
    let moved: Vec<Eid> = concurrent_or_after(&t, w.eid);
    if let Some(min) = moved.iter().map(|e| t.event(*e).tpre).min() {
        if min <= wpre {
            shift_events(&mut t, &moved, wpre + 1 - min);
        }
    }
    if wg_min_prefix(&t, prim) < 0 {
        bail!("reordering breaks the add/done balance")
    }
    t.append_replay_end(t.max_time() + 1, ExitCode::LeakWg)?;
    validate(&mut t)?;
    Ok(Rewrite { trace: t, exit: ExitCode::LeakWg, enforce: vec![w], start_time: 0 })
}

// replay a racing wake up after the stuck wait has started
fn cond(orig: &Trace, bug: &Bug) -> Result<Rewrite> {
    let w = group1(bug)?;
    let wake: OpRef = *bug
        .group2
        .first()
        .ok_or_else(|| anyhow!("no concurrent signal or broadcast to move"))?;
    let mut t = orig.copy(true);
    let wpre = t.event(w.eid).tpre;
    let stpre = t.event(wake.eid).tpre;
    if stpre <= wpre {
        let r = t.event(wake.eid).routine;
        shift_routine_from(&mut t, r, stpre, wpre + 1 - stpre);
    }
    let send = t.event(wake.eid).end_time();
    t.append_replay_end(send.max(wpre) + 1, ExitCode::LeakCond)?;
    validate(&mut t)?;
    Ok(Rewrite {
        trace: t,
        exit: ExitCode::LeakCond,
        enforce: vec![w, wake],
        start_time: 0,
    })
}
