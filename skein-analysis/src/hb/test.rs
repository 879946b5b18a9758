use crate::{hb::annotate, AnalyzerFlag};
use enumflags2::BitFlags;
use skein_trace::{
    clock::ClockRel,
    parser::parse_trace,
    trace::Trace,
    CancelFlag, Eid, RoutineId,
};

fn annotated(s: &str) -> Trace {
    let _ = env_logger::try_init();
    let mut t = parse_trace(s).expect("trace did not parse");
    annotate(&mut t, BitFlags::from(AnalyzerFlag::WeakClocks), &CancelFlag::new())
        .expect("annotation failed");
    t
}

fn rel(t: &Trace, a: Eid, b: Eid) -> ClockRel {
    t.event(a).vc().compare(t.event(b).vc())
}

fn ev(t: &Trace, r: u32, i: usize) -> Eid {
    t.routine(RoutineId(r)).unwrap()[i]
}

#[test]
fn program_order_dominates() {
    let t = annotated("A,1,9,S,a.go:1,A,2,9,S,a.go:2,A,3,9,S,a.go:3");
    for i in 0..2 {
        assert_eq!(rel(&t, ev(&t, 1, i), ev(&t, 1, i + 1)), ClockRel::Before);
    }
    assert_eq!(rel(&t, ev(&t, 1, 2), ev(&t, 1, 0)), ClockRel::After);
}

#[test]
fn fork_orders_the_child() {
    let t = annotated("G,1,2,m.go:1,A,2,9,S,m.go:2\nA,3,8,L,x.go:1");
    let fork = ev(&t, 1, 0);
    let child = ev(&t, 2, 0);
    assert_eq!(rel(&t, fork, child), ClockRel::Before);
    // nothing else orders the two routines
    let store = ev(&t, 1, 1);
    assert_eq!(rel(&t, store, child), ClockRel::Concurrent);
}

#[test]
fn unbuffered_rendezvous_synchronizes_both_ways() {
    let t = annotated(
        "C,2,4,7,S,f,1,0,0,a.go:1,A,6,9,S,a.go:2\nC,3,5,7,R,f,1,0,0,b.go:1",
    );
    let send = ev(&t, 1, 0);
    let after_send = ev(&t, 1, 1);
    let recv = ev(&t, 2, 0);
    assert_eq!(rel(&t, send, recv), ClockRel::Before);
    // the sender's continuation is also after the receive
    assert_eq!(rel(&t, recv, after_send), ClockRel::Before);
}

#[test]
fn buffered_send_does_not_wait_for_the_receive() {
    let t = annotated(
        "C,2,3,7,S,f,1,1,1,a.go:1,A,6,9,S,a.go:2\nC,4,5,7,R,f,1,1,0,b.go:1",
    );
    let send = ev(&t, 1, 0);
    let after_send = ev(&t, 1, 1);
    let recv = ev(&t, 2, 0);
    assert_eq!(rel(&t, send, recv), ClockRel::Before);
    assert_eq!(rel(&t, recv, after_send), ClockRel::Concurrent);
}

#[test]
fn close_orders_receives_from_closed() {
    let t = annotated("C,2,3,7,C,f,0,0,0,a.go:1\nC,4,5,7,R,t,0,0,0,b.go:1");
    assert_eq!(rel(&t, ev(&t, 1, 0), ev(&t, 2, 0)), ClockRel::Before);
}

#[test]
fn mutex_edge_is_strong_only() {
    let t = annotated(
        "M,2,3,4,-,L,t,a.go:1,M,4,5,4,-,U,t,a.go:2\nM,6,7,4,-,L,t,b.go:1",
    );
    let unlock = ev(&t, 1, 1);
    let lock2 = ev(&t, 2, 0);
    assert_eq!(rel(&t, unlock, lock2), ClockRel::Before);
    assert_eq!(
        t.event(unlock).wvc().compare(t.event(lock2).wvc()),
        ClockRel::Concurrent
    );
}

#[test]
fn wait_group_wait_joins_every_contribution() {
    // two rounds of the reuse idiom: add/done/wait, then add/wait
    // again from unrelated routines
    let t = annotated(
        "W,2,3,9,A,1,1,a.go:1\nW,4,5,9,A,-1,0,b.go:1\nW,6,7,9,W,0,0,c.go:1\nW,8,9,9,A,1,1,d.go:1\nW,10,11,9,W,0,0,e.go:1",
    );
    let add = ev(&t, 1, 0);
    let done = ev(&t, 2, 0);
    let wait = ev(&t, 3, 0);
    assert_eq!(rel(&t, add, wait), ClockRel::Before);
    assert_eq!(rel(&t, done, wait), ClockRel::Before);
    assert_eq!(rel(&t, add, done), ClockRel::Concurrent);
    // the first wait closed the episode: the second round joins only
    // its own contribution
    let add2 = ev(&t, 4, 0);
    let wait2 = ev(&t, 5, 0);
    assert_eq!(rel(&t, add2, wait2), ClockRel::Before);
    assert_eq!(rel(&t, add, wait2), ClockRel::Concurrent);
    assert_eq!(rel(&t, done, wait2), ClockRel::Concurrent);
    assert_eq!(rel(&t, wait, wait2), ClockRel::Concurrent);
}

#[test]
fn cond_wait_joins_its_signal() {
    let t = annotated("D,2,3,5,S,a.go:1\nD,4,5,5,W,b.go:1");
    assert_eq!(rel(&t, ev(&t, 1, 0), ev(&t, 2, 0)), ClockRel::Before);
}

#[test]
fn once_orders_later_callers() {
    let t = annotated("O,2,3,6,t,a.go:1\nO,4,5,6,f,b.go:1");
    assert_eq!(rel(&t, ev(&t, 1, 0), ev(&t, 2, 0)), ClockRel::Before);
}

#[test]
fn atomic_load_sees_the_last_store() {
    let t = annotated("A,2,9,S,a.go:1\nA,3,9,L,b.go:1,A,4,9,S,b.go:2\nA,5,9,L,c.go:1");
    let store1 = ev(&t, 1, 0);
    let load1 = ev(&t, 2, 0);
    let store2 = ev(&t, 2, 1);
    let load2 = ev(&t, 3, 0);
    assert_eq!(rel(&t, store1, load1), ClockRel::Before);
    assert_eq!(rel(&t, store2, load2), ClockRel::Before);
    assert_eq!(rel(&t, store1, load2), ClockRel::Before);
}

#[test]
fn select_synchronizes_like_its_chosen_case() {
    let t = annotated("S,3,5,8,7.R.f.1.0,0,a.go:1\nC,2,4,7,S,f,1,0,0,b.go:1");
    assert_eq!(rel(&t, ev(&t, 2, 0), ev(&t, 1, 0)), ClockRel::Before);
}

#[test]
fn stuck_events_are_clocked_but_inert() {
    let t = annotated("C,2,3,7,S,f,1,0,0,a.go:1,C,4,0,8,R,f,1,0,0,a.go:2\nA,5,9,L,b.go:1");
    let stuck = ev(&t, 1, 1);
    assert!(t.event(stuck).is_stuck());
    assert!(t.event(stuck).vc.is_some());
    // program order still holds into the stuck op
    assert_eq!(rel(&t, ev(&t, 1, 0), stuck), ClockRel::Before);
    // but it synchronizes nothing across routines
    assert_eq!(rel(&t, stuck, ev(&t, 2, 0)), ClockRel::Concurrent);
}

#[test]
fn every_pair_is_exactly_one_relation() {
    let t = annotated(
        "C,2,4,7,S,f,1,0,0,a.go:1,A,6,9,S,a.go:2\nC,3,5,7,R,f,1,0,0,b.go:1,C,7,0,8,R,f,2,0,0,b.go:2",
    );
    let all: Vec<Eid> = t.iter().collect();
    for a in &all {
        for b in &all {
            let ab = rel(&t, *a, *b);
            let ba = rel(&t, *b, *a);
            if a == b {
                assert_eq!(ab, ClockRel::Equal);
                continue;
            }
            match ab {
                ClockRel::Before => assert_eq!(ba, ClockRel::After),
                ClockRel::After => assert_eq!(ba, ClockRel::Before),
                ClockRel::Concurrent => assert_eq!(ba, ClockRel::Concurrent),
                ClockRel::Equal => panic!("distinct events with equal clocks"),
            }
        }
    }
}

#[test]
fn cancellation_aborts_the_sweep() {
    let mut t = parse_trace("A,1,9,S,a.go:1").unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = annotate(&mut t, BitFlags::empty(), &cancel).unwrap_err();
    assert!(skein_trace::is_cancelled(&err));
}
