//! Mutex misuse: unlock of an unheld mutex, unlock before lock, and
//! cyclic lock deadlocks (Goodlock style lock dependency cycles)
use super::{Bug, BugKind, Report};
use fxhash::FxHashMap;
use log::debug;
use skein_trace::{
    clock::ClockRel,
    event::{EventKind, OpRef},
    trace::Trace,
    Eid, PrimitiveId, RoutineId,
};
use smallvec::SmallVec;

// one "acquired l while holding S" observation
#[derive(Debug, Clone)]
struct Dep {
    routine: RoutineId,
    lock: Eid,
    lock_prim: PrimitiveId,
    held: SmallVec<[(PrimitiveId, Eid); 4]>,
}

impl Dep {
    fn holds(&self, prim: PrimitiveId) -> bool {
        self.held.iter().any(|(p, _)| *p == prim)
    }

    fn disjoint(&self, other: &Dep) -> bool {
        !self.held.iter().any(|(p, _)| other.holds(*p))
    }
}

pub(super) fn detect(trace: &Trace, report: &mut Report) {
    // active acquires per primitive, owner routine included
    let mut held: FxHashMap<PrimitiveId, Vec<Eid>> = FxHashMap::default();
    let mut last_acq: FxHashMap<PrimitiveId, Eid> = FxHashMap::default();
    let mut routine_held: FxHashMap<RoutineId, Vec<(PrimitiveId, Eid)>> =
        FxHashMap::default();
    let mut deps: Vec<Dep> = Vec::new();
    for eid in trace.iter() {
        let ev = trace.event(eid);
        let (prim, op, suc) = match &ev.kind {
            EventKind::Mutex { prim, op, suc, .. } => (*prim, *op, *suc),
            _ => continue,
        };
        if op.is_acquire() {
            let holds = routine_held.entry(ev.routine).or_default();
            if !holds.is_empty() {
                deps.push(Dep {
                    routine: ev.routine,
                    lock: eid,
                    lock_prim: prim,
                    held: holds.iter().copied().collect(),
                });
            }
            if ev.is_stuck() || (op.is_try() && !suc) {
                continue;
            }
            holds.push((prim, eid));
            held.entry(prim).or_default().push(eid);
            last_acq.insert(prim, eid);
        } else if op.is_release() && !ev.is_stuck() {
            if let Some(l) = last_acq.get(&prim) {
                let rel = trace.event(*l).wvc().compare(ev.wvc());
                if rel == ClockRel::Concurrent {
                    report.push(
                        trace,
                        Bug::new(
                            BugKind::PossibleUnlockBeforeLock,
                            [OpRef::plain(eid)],
                            [OpRef::plain(*l)],
                        ),
                    );
                }
            }
            match held.get_mut(&prim).and_then(|s| s.pop()) {
                None => {
                    report.push(
                        trace,
                        Bug::new(BugKind::ActualUnlockUnheld, [OpRef::plain(eid)], []),
                    );
                }
                Some(owner) => {
                    let r = trace.event(owner).routine;
                    if let Some(holds) = routine_held.get_mut(&r) {
                        holds.retain(|(p, _)| *p != prim);
                    }
                }
            }
        }
    }
    if let Some(cycle) = find_cycle(trace, &deps) {
        let locks: Vec<OpRef> = cycle.iter().map(|d| OpRef::plain(d.lock)).collect();
        // guard i: the acquire, elsewhere in the cycle, that holds the
        // primitive lock i is blocked on
        let guards: Vec<OpRef> = (0..cycle.len())
            .map(|i| {
                let d = cycle[i];
                let h = cycle[(i + 1) % cycle.len()];
                h.held
                    .iter()
                    .find(|(p, _)| *p == d.lock_prim)
                    .map(|(_, e)| OpRef::plain(*e))
                    .unwrap_or(OpRef::plain(d.lock))
            })
            .collect();
        debug!("lock dependency cycle over {} routines", cycle.len());
        report.push(trace, Bug::new(BugKind::CyclicDeadlock, locks, guards));
    }
}

// a chain d1..dn of dependencies from pairwise distinct routines with
// pairwise disjoint locksets where each link acquires a lock the next
// one holds
fn find_cycle<'a>(trace: &Trace, deps: &'a [Dep]) -> Option<Vec<&'a Dep>> {
    fn extend<'a>(
        deps: &'a [Dep],
        path: &mut Vec<&'a Dep>,
    ) -> Option<Vec<&'a Dep>> {
        let tail_prim = path.last().unwrap().lock_prim;
        for d in deps {
            if path.len() > 1 && std::ptr::eq(*path.first().unwrap(), d) {
                // closed: the head must hold what the tail acquires
                if d.holds(tail_prim) {
                    return Some(path.clone());
                }
                continue;
            }
            let fresh = !path.iter().any(|p| {
                p.routine == d.routine || !p.disjoint(d) || std::ptr::eq(*p, d)
            });
            if fresh && d.holds(tail_prim) {
                path.push(d);
                if let Some(c) = extend(deps, path) {
                    return Some(c);
                }
                path.pop();
            }
        }
        None
    }
    for start in deps {
        let mut path = vec![start];
        if let Some(cycle) = extend(deps, &mut path) {
            // the cycle is real only if the locks can race
            let concurrent = cycle.iter().enumerate().all(|(i, a)| {
                cycle.iter().skip(i + 1).all(|b| {
                    trace
                        .event(a.lock)
                        .vc()
                        .compare(trace.event(b.lock).vc())
                        == ClockRel::Concurrent
                })
            });
            if concurrent {
                return Some(cycle);
            }
        }
    }
    None
}
