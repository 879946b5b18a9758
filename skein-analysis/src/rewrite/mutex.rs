//! Rewrite for a schedulable unlock before lock: delay the lock and
//! its routine's tail until after the unlock.
use super::{group1, group2, shift_routine_from, validate, Rewrite};
use crate::predict::Bug;
use anyhow::{bail, Result};
use skein_trace::{clock::ClockRel, trace::Trace, ExitCode};

pub(super) fn rewrite(orig: &Trace, bug: &Bug) -> Result<Rewrite> {
    let u = group1(bug)?;
    let l = group2(bug)?;
    let uev = orig.event(u.eid);
    let lev = orig.event(l.eid);
    if uev.wvc().compare(lev.wvc()) != ClockRel::Concurrent {
        bail!("the lock is ordered against the unlock outside the critical section")
    }
    let mut t = orig.copy(true);
    let uend = uev.tpost;
    let ltpre = lev.tpre;
    let lroutine = lev.routine;
    if ltpre <= uend {
        shift_routine_from(&mut t, lroutine, ltpre, uend + 1 - ltpre);
    }
    let lend = t.event(l.eid).end_time();
    t.append_replay_end(lend + 1, ExitCode::UnlockBeforeLock)?;
    validate(&mut t)?;
    Ok(Rewrite {
        trace: t,
        exit: ExitCode::UnlockBeforeLock,
        enforce: vec![u, l],
        start_time: 0,
    })
}
