use super::{rewrite, wg_min_prefix};
use crate::{
    conc::ConcIndex,
    hb::annotate,
    predict::{run_all, Bug, BugKind, Report},
    AnalyzerFlag,
};
use enumflags2::BitFlags;
use skein_trace::{
    event::{EventKind, OpRef},
    parser::parse_trace,
    trace::Trace,
    CancelFlag, Eid, ExitCode, PrimitiveId, RoutineId,
};

fn analyzed(s: &str) -> (Trace, Report) {
    let mut t = parse_trace(s).expect("trace did not parse");
    let edges =
        annotate(&mut t, BitFlags::from(AnalyzerFlag::WeakClocks), &CancelFlag::new())
            .unwrap();
    let idx = ConcIndex::build(&t, &edges, BitFlags::empty());
    let report = run_all(&t, &idx, &CancelFlag::new()).unwrap();
    (t, report)
}

fn bug(report: &Report, kind: BugKind) -> Bug {
    report.bugs().find(|b| b.kind == kind).unwrap_or_else(|| {
        panic!("no {} in report", kind.code())
    }).clone()
}

fn sentinel(t: &Trace) -> (Eid, ExitCode) {
    let eid = t
        .iter()
        .find(|e| matches!(t.event(*e).kind, EventKind::Replay { .. }))
        .expect("no replay sentinel");
    match t.event(eid).kind {
        EventKind::Replay { exit } => (eid, exit),
        _ => unreachable!(),
    }
}

#[test]
fn send_on_closed_puts_the_send_first() {
    let (t, report) = analyzed(
        "G,1,2,a.go:1,C,2,3,7,S,f,1,0,0,a.go:2,C,3,4,7,C,f,0,0,0,a.go:3\nC,2,0,7,S,f,0,0,0,a.go:5",
    );
    let b = bug(&report, BugKind::PossibleSendClosed);
    let rw = rewrite(&t, &b).expect("rewrite refused");
    assert_eq!(rw.exit, ExitCode::SendClosed);
    assert_eq!(rw.start_time, 0);
    let send = b.group1[0].eid;
    let close = b.group2[0].eid;
    let sev = rw.trace.event(send);
    let cev = rw.trace.event(close);
    assert!(!sev.is_stuck(), "the stuck send completes in the rewrite");
    assert!(sev.tpost < cev.tpre, "the send must precede the close");
    let (s, exit) = sentinel(&rw.trace);
    assert_eq!(exit, ExitCode::SendClosed);
    assert!(rw.trace.event(s).tpre > cev.tpost);
    assert_eq!(rw.enforce, vec![b.group1[0], b.group2[0]]);
}

#[test]
fn send_on_closed_refused_when_ordered() {
    // the close happens before the send by program order
    let (t, _) = analyzed("C,2,3,7,C,f,0,0,0,a.go:1,C,4,5,7,S,f,1,0,0,a.go:2");
    let b = Bug::new(
        BugKind::PossibleSendClosed,
        [OpRef::plain(t.routine(RoutineId(1)).unwrap()[1])],
        [OpRef::plain(t.routine(RoutineId(1)).unwrap()[0])],
    );
    assert!(rewrite(&t, &b).is_err());
}

#[test]
fn leak_unbuffered_repairs_the_pairing() {
    let (t, report) = analyzed(
        "C,2,0,7,R,f,5,0,0,a.go:1\nC,3,4,7,S,f,1,0,0,b.go:1\nC,3,5,7,R,f,1,0,0,c.go:1",
    );
    let b = bug(&report, BugKind::LeakUnbufferedWith);
    let rw = rewrite(&t, &b).expect("rewrite refused");
    let stuck = b.group1[0];
    let send = b.group2[0];
    // the recorded peer is gone
    assert_eq!(rw.trace.routine(RoutineId(3)).unwrap().len(), 0);
    // the stuck receive now completes after the send, paired with it
    let rev = rw.trace.event(stuck.eid);
    assert!(!rev.is_stuck());
    assert!(rw.trace.event(send.eid).tpost < rev.tpre);
    assert_eq!(rw.trace.chan(send).unwrap().partner, Some(stuck));
    assert_eq!(rw.trace.chan(stuck).unwrap().partner, Some(send));
    let (_, exit) = sentinel(&rw.trace);
    assert_eq!(exit, ExitCode::LeakUnbuffered);
    assert_eq!(rw.enforce, vec![send, stuck]);
}

#[test]
fn cyclic_deadlock_shortens_aligns_and_terminates() {
    let (t, report) = analyzed(
        "M,1,2,1,-,L,t,a.go:1,M,5,0,2,-,L,t,a.go:2\nM,3,4,2,-,L,t,b.go:1,M,6,0,1,-,L,t,b.go:2",
    );
    let b = bug(&report, BugKind::CyclicDeadlock);
    let rw = rewrite(&t, &b).expect("rewrite refused");
    // the guard locks survive the shortening
    for g in &b.group2 {
        assert!(!rw.trace.event(g.eid).is_stuck());
    }
    // the cycle locks stay blocked, spread apart
    let mut tpres: Vec<u64> =
        b.group1.iter().map(|l| rw.trace.event(l.eid).tpre).collect();
    tpres.sort();
    assert!(tpres[1] - tpres[0] >= 2);
    for l in &b.group1 {
        assert!(rw.trace.event(l.eid).is_stuck());
    }
    let (_, exit) = sentinel(&rw.trace);
    assert_eq!(exit, ExitCode::CyclicDeadlock);
}

#[test]
fn cyclic_deadlock_three_routines_with_lock_reuse() {
    // routine 1 takes and releases mutex 2 before holding mutex 1 and
    // blocking on mutex 2 again; routines 2 and 3 close a three way
    // cycle over mutexes 2, 3 and 1
    let (t, report) = analyzed(
        "M,1,2,2,-,L,t,a.go:1,M,3,4,2,-,U,t,a.go:2,M,5,6,1,-,L,t,a.go:3,M,11,0,2,-,L,t,a.go:4\n\
         M,7,8,2,-,L,t,b.go:1,M,12,0,3,-,L,t,b.go:2\n\
         M,9,10,3,-,L,t,c.go:1,M,13,0,1,-,L,t,c.go:2",
    );
    let b = bug(&report, BugKind::CyclicDeadlock);
    assert_eq!(b.group1.len(), 3);
    assert_eq!(b.group2.len(), 3);
    // each guard holds exactly the primitive its lock is blocked on
    for (l, g) in b.group1.iter().zip(b.group2.iter()) {
        assert_eq!(t.event(l.eid).prim(), t.event(g.eid).prim());
    }
    let rw = rewrite(&t, &b).expect("rewrite refused");
    let t_max = b.group1.iter().map(|l| t.event(l.eid).tpre).max().unwrap();
    // the guard segments moved past the cut, still acquired
    for g in &b.group2 {
        let gev = rw.trace.event(g.eid);
        assert!(!gev.is_stuck());
        assert!(gev.tpre > t_max);
    }
    // routine 1's earlier unlock of mutex 2 stays in the prefix, so
    // the replayer sees it before routine 2 re-acquires the mutex
    let unlock = rw.trace.event(t.routine(RoutineId(1)).unwrap()[1]);
    assert!(matches!(
        &unlock.kind,
        EventKind::Mutex { op, .. } if op.is_release()
    ));
    let min_guard =
        b.group2.iter().map(|g| rw.trace.event(g.eid).tpre).min().unwrap();
    assert!(unlock.tpost < min_guard);
    // the attempts stay blocked, spread apart
    let mut tpres: Vec<u64> =
        b.group1.iter().map(|l| rw.trace.event(l.eid).tpre).collect();
    tpres.sort();
    for w in tpres.windows(2) {
        assert!(w[1] - w[0] >= 2);
    }
    for l in &b.group1 {
        assert!(rw.trace.event(l.eid).is_stuck());
    }
    let (_, exit) = sentinel(&rw.trace);
    assert_eq!(exit, ExitCode::CyclicDeadlock);
}

#[test]
fn concurrent_recv_has_no_rewrite() {
    let (t, report) =
        analyzed("C,2,3,7,R,f,1,1,0,a.go:1\nC,4,5,7,R,f,2,1,0,b.go:1");
    let b = bug(&report, BugKind::ConcurrentRecv);
    assert!(rewrite(&t, &b).is_err());
}

#[test]
fn negative_wg_rewrite_drives_the_counter_negative() {
    let (t, report) = analyzed("W,1,2,9,A,1,1,a.go:1\nW,3,4,9,A,-1,0,b.go:1");
    let b = bug(&report, BugKind::PossibleNegativeWg);
    let rw = rewrite(&t, &b).expect("rewrite refused");
    assert_eq!(rw.exit, ExitCode::NegativeWg);
    assert!(wg_min_prefix(&rw.trace, PrimitiveId(9)) < 0);
    let (_, exit) = sentinel(&rw.trace);
    assert_eq!(exit, ExitCode::NegativeWg);
}

#[test]
fn unlock_before_lock_delays_the_lock() {
    let (t, report) = analyzed("M,1,2,4,-,L,t,a.go:1\nM,3,4,4,-,U,t,b.go:1");
    let b = bug(&report, BugKind::PossibleUnlockBeforeLock);
    let rw = rewrite(&t, &b).expect("rewrite refused");
    let unlock = b.group1[0].eid;
    let lock = b.group2[0].eid;
    assert!(rw.trace.event(unlock).tpost < rw.trace.event(lock).tpre);
    let (_, exit) = sentinel(&rw.trace);
    assert_eq!(exit, ExitCode::UnlockBeforeLock);
}

#[test]
fn leak_mutex_removes_the_race() {
    let (t, report) = analyzed("M,1,2,4,-,L,t,a.go:1\nM,3,0,4,-,L,t,b.go:1");
    let b = bug(&report, BugKind::LeakMutex);
    let rw = rewrite(&t, &b).expect("rewrite refused");
    let stuck = b.group1[0].eid;
    // the racing holder is gone and the lock completes
    assert!(!rw.trace.routine(RoutineId(1)).unwrap().contains(&b.group2[0].eid));
    let ev = rw.trace.event(stuck);
    assert_eq!(ev.tpost, ev.tpre);
    let (_, exit) = sentinel(&rw.trace);
    assert_eq!(exit, ExitCode::LeakMutex);
}

#[test]
fn leak_wg_keeps_the_balance() {
    let (t, report) = analyzed(
        "W,1,2,9,A,1,1,a.go:1,W,3,4,9,A,-1,0,a.go:2\nW,5,0,9,W,0,0,b.go:1",
    );
    let b = bug(&report, BugKind::LeakWg);
    let rw = rewrite(&t, &b).expect("rewrite refused");
    assert!(wg_min_prefix(&rw.trace, PrimitiveId(9)) >= 0);
    let (_, exit) = sentinel(&rw.trace);
    assert_eq!(exit, ExitCode::LeakWg);
}

#[test]
fn leak_cond_moves_a_wake_up_after_the_wait() {
    let (t, report) = analyzed("D,2,3,5,S,a.go:1\nD,4,0,5,W,b.go:1");
    let b = bug(&report, BugKind::LeakCond);
    let rw = rewrite(&t, &b).expect("rewrite refused");
    let wait = b.group1[0].eid;
    let signal = b.group2[0].eid;
    assert!(rw.trace.event(signal).tpre > rw.trace.event(wait).tpre);
    let (_, exit) = sentinel(&rw.trace);
    assert_eq!(exit, ExitCode::LeakCond);
}

#[test]
fn select_partner_rewrite_reassigns_the_case() {
    // a stuck select whose second case could pair with the send
    let (t, report) = analyzed(
        "S,2,0,8,9.S.f.4.0~7.R.f.5.0~d,-1,a.go:1\nC,3,4,7,S,f,1,0,0,b.go:1\nC,3,5,7,R,f,1,0,0,c.go:1",
    );
    let b = bug(&report, BugKind::LeakSelectWith);
    assert_eq!(b.group1[0].case, Some(1));
    let rw = rewrite(&t, &b).expect("rewrite refused");
    let sel = rw.trace.event(b.group1[0].eid).select().unwrap();
    assert_eq!(sel.chosen_index, 1);
    assert!(sel.cases[1].chosen);
    assert!(!sel.chose_default());
    assert_eq!(sel.cases[1].tpost, rw.trace.event(b.group1[0].eid).tpost);
    // the canonical form survives a round trip
    let printed = rw.trace.to_string();
    let back = parse_trace(&printed).expect("reparse");
    assert_eq!(printed, back.to_string());
}
