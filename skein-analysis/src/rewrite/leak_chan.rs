//! Rewrites for leaked channel and select operations that have a
//! possible partner: step the recorded peer aside, pair the stuck op
//! with the partner, and stop once it completes.
//!
//! Covers the four unbuffered shapes (chan/select on either side) and
//! the buffered case.
use super::{group1, group2, shift_routine_from, validate, Rewrite};
use crate::predict::{Bug, BugKind};
use anyhow::{anyhow, bail, Result};
use skein_trace::{event::ChannelOp, trace::Trace, ExitCode};

pub(super) fn rewrite(orig: &Trace, bug: &Bug) -> Result<Rewrite> {
    let e = group1(bug)?;
    let f = group2(bug)?;
    let exit = match bug.kind {
        BugKind::LeakBufferedWith => ExitCode::LeakBuffered,
        _ => ExitCode::LeakUnbuffered,
    };
    let chan = orig
        .chan(e)
        .ok_or_else(|| anyhow!("stuck op is not a channel operation"))?
        .clone();
    let mut t = orig.copy(true);
    // the peer the partner matched in the recording steps aside
    if let Some(g) = t.chan(f).and_then(|c| c.partner) {
        t.remove(g.eid);
    }
    // a partner select commits to the case that matches the pairing
    if let Some(i) = f.case {
        t.set_chosen_case(f.eid, Some(i as usize))?;
    }
    let (fpre, fpost) =
        t.op_times(f).ok_or_else(|| anyhow!("partner is not a channel operation"))?;
    if fpost == 0 {
        bail!("the possible partner never completed either")
    }
    let send_first = !chan.buffered() && chan.op == ChannelOp::Send;
    if send_first {
        // the stuck send completes in place, the partner receive and
        // its routine tail move after it
        let eend = {
            let ev = t.event_mut(e.eid);
            ev.tpost = ev.tpre + 1;
            ev.tpost
        };
        if fpre <= eend {
            let r = t.event(f.eid).routine;
            shift_routine_from(&mut t, r, fpre, eend + 1 - fpre);
        }
    } else {
        // the stuck op completes right after the partner; it is the
        // last event of its routine, so lifting its times is safe
        let ev = t.event_mut(e.eid);
        let start = ev.tpre.max(fpost + 1);
        ev.tpre = start;
        ev.tpost = start + 1;
    }
    // with the completion time known, a stuck select can commit to
    // the case it pairs on
    if let Some(i) = e.case {
        t.set_chosen_case(e.eid, Some(i as usize))?;
    }
    t.link(e, f);
    t.append_replay_end(t.max_time() + 1, exit)?;
    validate(&mut t)?;
    let enforce = if send_first { vec![e, f] } else { vec![f, e] };
    Ok(Rewrite { trace: t, exit, enforce, start_time: 0 })
}
