//! Rewrite for predicted send/recv on a closed channel: run the
//! violating op first, then the close, then stop.
use super::{concurrent_or_after, group1, group2, shift_events, validate, Rewrite};
use crate::predict::Bug;
use anyhow::{bail, Result};
use skein_trace::trace::Trace;

pub(super) fn rewrite(orig: &Trace, bug: &Bug) -> Result<Rewrite> {
    let x = group1(bug)?;
    let c = group2(bug)?;
    let exit = match bug.kind.exit_code() {
        Some(e) => e,
        None => bail!("{} carries no exit code", bug.kind.code()),
    };
    if orig.event(c.eid).vc().happens_before(orig.event(x.eid).vc()) {
        bail!("the close precedes the operation in every schedule")
    }
    let mut t = orig.copy(true);
    // the stuck op completes in the rewritten schedule
    let xend = {
        let ev = t.event_mut(x.eid);
        if ev.tpost == 0 {
            ev.tpost = ev.tpre + 1;
        }
        ev.tpost
    };
    // push everything that could run alongside or after the op, the
    // close included, past its completion
    let moved: Vec<_> = concurrent_or_after(&t, x.eid)
        .into_iter()
        .filter(|e| *e != x.eid)
        .collect();
    if let Some(min) = moved.iter().map(|e| t.event(*e).tpre).min() {
        if min <= xend {
            shift_events(&mut t, &moved, xend + 1 - min);
        }
    }
    let cend = t.event(c.eid).tpost.max(t.event(c.eid).tpre);
    t.append_replay_end(cend + 1, exit)?;
    validate(&mut t)?;
    Ok(Rewrite { trace: t, exit, enforce: vec![x, c], start_time: 0 })
}
