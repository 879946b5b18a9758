use super::parse_trace;
use crate::{
    event::{
        AtomicOp, ChannelOp, CondOp, EventKind, MutexOp, OpRef, SelectCase, WgOp,
    },
    trace::Trace,
    Eid, Pos, PrimitiveId, RoutineId,
};
use proptest::prelude::*;

fn p(s: &str) -> Trace {
    let _ = env_logger::try_init();
    parse_trace(s).expect("trace did not parse")
}

#[test]
fn atomic_line() {
    let t = p("A,3,11,L,main.go:4,A,5,11,S,main.go:5");
    let seq = t.routine(RoutineId(1)).unwrap();
    assert_eq!(seq.len(), 2);
    let ev = t.event(seq[0]);
    assert_eq!(ev.tpre, 3);
    assert_eq!(ev.tpost, 3);
    match ev.kind {
        EventKind::Atomic { prim, op } => {
            assert_eq!(prim, PrimitiveId(11));
            assert_eq!(op, AtomicOp::Load);
        }
        ref k => panic!("wrong kind {k:?}"),
    }
    assert_eq!(ev.pos, "main.go:4".parse::<Pos>().unwrap());
}

#[test]
fn channel_partners_resolve() {
    let t = p("G,1,2,main.go:5\nC,2,3,7,S,f,1,0,0,main.go:6\nC,2,4,7,R,f,1,0,0,main.go:10");
    // line layout: r1 forks, r2 sends, r3 receives
    let send = t.routine(RoutineId(2)).unwrap()[0];
    let recv = t.routine(RoutineId(3)).unwrap()[0];
    assert_eq!(
        t.chan(OpRef::plain(send)).unwrap().partner,
        Some(OpRef::plain(recv))
    );
    assert_eq!(
        t.chan(OpRef::plain(recv)).unwrap().partner,
        Some(OpRef::plain(send))
    );
}

#[test]
fn stuck_ops_stay_unpartnered() {
    let t = p("C,2,3,7,S,f,1,0,0,a.go:1\nC,2,0,7,R,f,1,0,0,a.go:2");
    let send = t.routine(RoutineId(1)).unwrap()[0];
    let recv = t.routine(RoutineId(2)).unwrap()[0];
    assert!(t.event(recv).is_stuck());
    assert_eq!(t.chan(OpRef::plain(send)).unwrap().partner, None);
    assert_eq!(t.unmatched().collect::<Vec<_>>(), vec![OpRef::plain(send)]);
}

#[test]
fn closed_recv_finds_close() {
    let t = p("C,2,3,7,C,f,0,0,0,a.go:1\nC,4,5,7,R,t,0,0,0,a.go:2");
    let close = t.routine(RoutineId(1)).unwrap()[0];
    let recv = t.routine(RoutineId(2)).unwrap()[0];
    assert_eq!(t.close_of(PrimitiveId(7)), Some(close));
    let c = t.chan(OpRef::plain(recv)).unwrap();
    assert!(c.closed);
    assert_eq!(c.partner, None);
}

#[test]
fn select_chosen_case() {
    let t = p("S,5,9,8,7.R.f.2.0~9.S.f.3.0~d,0,main.go:20");
    let eid = t.routine(RoutineId(1)).unwrap()[0];
    let s = t.event(eid).select().unwrap();
    assert_eq!(s.cases.len(), 2);
    assert!(s.has_default);
    assert_eq!(s.chosen_index, 0);
    let (i, case): (usize, &SelectCase) = s.chosen_case().unwrap();
    assert_eq!(i, 0);
    assert!(case.chosen);
    assert_eq!(case.tpost, 9);
    assert_eq!(case.chan.op, ChannelOp::Recv);
    assert_eq!(s.cases[1].tpost, 0);
}

#[test]
fn select_case_pairs_with_channel() {
    let t = p("S,5,9,8,7.R.f.2.0,0,main.go:20\nC,5,8,7,S,f,2,0,0,main.go:30");
    let sel = t.routine(RoutineId(1)).unwrap()[0];
    let send = t.routine(RoutineId(2)).unwrap()[0];
    assert_eq!(
        t.chan(OpRef::case(sel, 0)).unwrap().partner,
        Some(OpRef::plain(send))
    );
    assert_eq!(
        t.chan(OpRef::plain(send)).unwrap().partner,
        Some(OpRef::case(sel, 0))
    );
}

#[test]
fn mutex_wg_cond_once() {
    let t = p(
        "M,1,2,4,-,L,t,m.go:1,M,3,4,4,-,U,t,m.go:2,W,5,6,9,A,1,1,m.go:3,\
         W,7,8,9,W,0,1,m.go:4,D,9,10,5,S,m.go:5,O,11,12,6,t,m.go:6",
    );
    let seq: Vec<Eid> = t.routine(RoutineId(1)).unwrap().to_vec();
    assert_eq!(seq.len(), 6);
    match t.event(seq[0]).kind {
        EventKind::Mutex { op: MutexOp::Lock, rw: false, suc: true, .. } => (),
        ref k => panic!("wrong kind {k:?}"),
    }
    match t.event(seq[2]).kind {
        EventKind::WaitGroup { op: WgOp::Add, delta: 1, val: 1, .. } => (),
        ref k => panic!("wrong kind {k:?}"),
    }
    match t.event(seq[4]).kind {
        EventKind::Cond { op: CondOp::Signal, .. } => (),
        ref k => panic!("wrong kind {k:?}"),
    }
    match t.event(seq[5]).kind {
        EventKind::Once { suc: true, .. } => (),
        ref k => panic!("wrong kind {k:?}"),
    }
}

#[test]
fn malformed_inputs_reject() {
    // non numeric timestamp
    assert!(parse_trace("A,x,11,L,main.go:4").is_err());
    // unknown op letter
    assert!(parse_trace("M,1,2,4,-,Z,t,m.go:1").is_err());
    // position without a line number
    assert!(parse_trace("A,3,11,L,main").is_err());
    // select choosing a case it does not have
    assert!(parse_trace("S,5,9,8,7.R.f.2.0,3,main.go:20").is_err());
    // wait carrying a delta
    assert!(parse_trace("W,7,8,9,W,1,1,m.go:4").is_err());
    // trailing garbage
    assert!(parse_trace("E,5,zzz").is_err());
}

#[test]
fn sentinels() {
    let t = p("E,9\nX,12,30");
    let e = t.routine(RoutineId(1)).unwrap()[0];
    assert!(matches!(t.event(e).kind, EventKind::End));
    assert!(t.event(e).pos.is_none());
    let x = t.routine(RoutineId(2)).unwrap()[0];
    match t.event(x).kind {
        EventKind::Replay { exit } => assert_eq!(exit.code(), 30),
        ref k => panic!("wrong kind {k:?}"),
    }
}

#[test]
fn fixed_round_trips() {
    for s in [
        "G,1,2,main.go:5\nC,2,3,7,S,f,1,0,0,main.go:6\nC,2,4,7,R,f,1,0,0,main.go:10",
        "S,5,9,8,7.R.f.2.0~9.S.f.3.0~d,0,main.go:20",
        "M,1,2,4,t,R,t,m.go:1,M,3,4,4,t,N,t,m.go:2",
        "N,1,7,NC,2,a.go:1,C,2,0,7,S,f,1,0,0,a.go:2",
        "W,5,6,9,A,-1,0,m.go:3",
        "",
    ] {
        let once = p(s).to_string();
        let twice = p(&once).to_string();
        assert_eq!(once, twice);
    }
}

fn arb_kind() -> impl Strategy<Value = EventKind> {
    let prim = (1u64..6).prop_map(PrimitiveId);
    prop_oneof![
        (prim.clone(), prop_oneof![
            Just(AtomicOp::Load),
            Just(AtomicOp::Store),
            Just(AtomicOp::Add),
            Just(AtomicOp::CompSwap),
        ])
            .prop_map(|(prim, op)| EventKind::Atomic { prim, op }),
        (prim.clone(), any::<bool>(), prop_oneof![
            Just(MutexOp::Lock),
            Just(MutexOp::Unlock),
            Just(MutexOp::TryLock),
        ])
            .prop_map(|(prim, rw, op)| EventKind::Mutex { prim, rw, op, suc: true }),
        (prim.clone(), 1i64..3)
            .prop_map(|(prim, d)| EventKind::WaitGroup {
                prim,
                op: WgOp::Add,
                delta: d,
                val: d,
            }),
        (prim.clone(), prop_oneof![
            Just(CondOp::Wait),
            Just(CondOp::Signal),
            Just(CondOp::Broadcast),
        ])
            .prop_map(|(prim, op)| EventKind::Cond { prim, op }),
        prim.prop_map(|prim| EventKind::Once { prim, suc: true }),
    ]
}

fn arb_trace() -> impl Strategy<Value = Trace> {
    proptest::collection::vec(proptest::collection::vec(arb_kind(), 0..6), 1..4)
        .prop_map(|routines| {
            let mut t = Trace::new();
            let mut time = 1;
            for (i, evs) in routines.into_iter().enumerate() {
                let r = RoutineId(i as u32 + 1);
                t.add_routine(r);
                for kind in evs {
                    t.insert(
                        r,
                        time,
                        time + 1,
                        Pos::new(arcstr::literal!("gen.go"), 1),
                        kind,
                    )
                    .expect("insert");
                    time += 2;
                }
            }
            t.sort();
            t
        })
}

proptest! {
    #[test]
    fn print_parse_round_trip(t in arb_trace()) {
        let once = t.to_string();
        let back = parse_trace(&once).expect("round trip parse");
        prop_assert_eq!(once, back.to_string());
    }
}
