//! The event arena and per routine sequences
use crate::{
    event::{ChannelEv, ChannelOp, Event, EventKind, OpRef, WgOp},
    Eid, ExitCode, OpId, Pos, PrimitiveId, RoutineId,
};
use anyhow::{bail, Result};
use fxhash::FxHashMap;
use indexmap::IndexMap;
use log::warn;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// A recorded execution: one ordered event sequence per routine,
/// backed by a single arena. Events are created at load, mutated only
/// by the HB engine (clock annotation) and the rewriter (timestamp
/// shifts, case reassignment), and dropped with the trace. All cross
/// references are [`OpRef`] handles into the arena, so cloning
/// preserves their sharing for free.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<Event>,
    routines: IndexMap<RoutineId, Vec<Eid>>,
    // unpartnered executed send/recv ends, keyed by primitive and op id
    pending: FxHashMap<(PrimitiveId, OpId), (OpRef, ChannelOp)>,
    closes: FxHashMap<PrimitiveId, Eid>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routines.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.values().all(|s| s.is_empty())
    }

    /// Register a routine with no events yet (an empty line in the
    /// trace file)
    pub fn add_routine(&mut self, r: RoutineId) {
        self.routines.entry(r).or_default();
    }

    /// Append an event to `routine`, assign its arena handle, and
    /// eagerly resolve channel partners.
    pub fn insert(
        &mut self,
        routine: RoutineId,
        tpre: u64,
        tpost: u64,
        pos: Pos,
        kind: EventKind,
    ) -> Result<Eid> {
        if tpost != 0 && tpre > tpost {
            bail!("event at {pos} completed at {tpost} before it started at {tpre}")
        }
        if tpre == 0 && tpost != 0 {
            bail!("executed event at {pos} has no start time")
        }
        let mut kind = kind;
        match &mut kind {
            EventKind::Select(s) => {
                let n = s.cases.len() as i32;
                if s.chosen_index >= n {
                    bail!(
                        "select at {pos} chose case {} of {n}",
                        s.chosen_index
                    )
                }
                for c in s.cases.iter_mut() {
                    c.chosen = false;
                    c.tpost = 0;
                }
                if tpost != 0 && s.chosen_index >= 0 {
                    let c = &mut s.cases[s.chosen_index as usize];
                    c.chosen = true;
                    c.tpost = tpost;
                }
            }
            EventKind::WaitGroup { op: WgOp::Wait, delta, .. } => {
                if *delta != 0 {
                    bail!("wait group wait at {pos} carries delta {delta}")
                }
            }
            _ => (),
        }
        let eid = Eid(self.events.len() as u32);
        let seq = self.routines.entry(routine).or_default();
        let index = seq.len();
        seq.push(eid);
        self.events.push(Event {
            eid,
            routine,
            index,
            tpre,
            tpost,
            pos,
            vc: None,
            wvc: None,
            conc: Default::default(),
            kind,
        });
        self.link_new(eid);
        Ok(eid)
    }

    // pair the freshly inserted event's channel ends, if any
    fn link_new(&mut self, eid: Eid) {
        let to_link = {
            let ev = &self.events[eid.0 as usize];
            if ev.is_stuck() {
                None
            } else {
                match &ev.kind {
                    EventKind::Channel(c) => {
                        Some((OpRef::plain(eid), c.prim, c.op, c.oid, c.closed))
                    }
                    EventKind::Select(s) => s.chosen_case().map(|(i, case)| {
                        let c = &case.chan;
                        (OpRef::case(eid, i), c.prim, c.op, c.oid, c.closed)
                    }),
                    _ => None,
                }
            }
        };
        if let Some((me, prim, op, oid, closed)) = to_link {
            self.link_op(me, prim, op, oid, closed)
        }
    }

    fn link_op(
        &mut self,
        me: OpRef,
        prim: PrimitiveId,
        op: ChannelOp,
        oid: OpId,
        closed: bool,
    ) {
        match op {
            ChannelOp::Close => {
                if self.closes.insert(prim, me.eid).is_some() {
                    warn!("channel {prim} closed more than once")
                }
            }
            // a receive that completed because the channel closed has
            // no send partner, the close is found through the channel
            ChannelOp::Recv if closed => (),
            ChannelOp::Send | ChannelOp::Recv => match self.pending.remove(&(prim, oid))
            {
                Some((other, oop)) if oop != op => {
                    self.link(me, other);
                }
                Some((other, oop)) => {
                    warn!("two {oop:?} ends on channel {prim} op {oid}, keeping first");
                    self.pending.insert((prim, oid), (other, oop));
                }
                None => {
                    self.pending.insert((prim, oid), (me, op));
                }
            },
        }
    }

    pub fn event(&self, eid: Eid) -> &Event {
        &self.events[eid.0 as usize]
    }

    pub fn event_mut(&mut self, eid: Eid) -> &mut Event {
        &mut self.events[eid.0 as usize]
    }

    pub fn get(&self, eid: Eid) -> Option<&Event> {
        self.events.get(eid.0 as usize)
    }

    /// Resolve an op handle to its channel payload
    pub fn chan(&self, r: OpRef) -> Option<&ChannelEv> {
        let ev = self.get(r.eid)?;
        match (&ev.kind, r.case) {
            (EventKind::Channel(c), None) => Some(c),
            (EventKind::Select(s), Some(i)) => s.cases.get(i as usize).map(|c| &c.chan),
            _ => None,
        }
    }

    pub fn chan_mut(&mut self, r: OpRef) -> Option<&mut ChannelEv> {
        let ev = self.events.get_mut(r.eid.0 as usize)?;
        match (&mut ev.kind, r.case) {
            (EventKind::Channel(c), None) => Some(c),
            (EventKind::Select(s), Some(i)) => {
                s.cases.get_mut(i as usize).map(|c| &mut c.chan)
            }
            _ => None,
        }
    }

    /// entry and completion timestamps of an op handle
    pub fn op_times(&self, r: OpRef) -> Option<(u64, u64)> {
        let ev = self.get(r.eid)?;
        match (&ev.kind, r.case) {
            (EventKind::Channel(_), None) => Some((ev.tpre, ev.tpost)),
            (EventKind::Select(s), Some(i)) => {
                s.cases.get(i as usize).map(|c| (ev.tpre, c.tpost))
            }
            _ => None,
        }
    }

    /// Link two channel ends as partners, both directions
    pub fn link(&mut self, a: OpRef, b: OpRef) {
        if let Some(c) = self.chan_mut(a) {
            c.partner = Some(b);
        }
        if let Some(c) = self.chan_mut(b) {
            c.partner = Some(a);
        }
    }

    /// Drop the partner link of `a`, clearing the back link too
    pub fn unlink(&mut self, a: OpRef) {
        let partner = self.chan(a).and_then(|c| c.partner);
        if let Some(p) = partner {
            if let Some(c) = self.chan_mut(p) {
                if c.partner == Some(a) {
                    c.partner = None;
                }
            }
        }
        if let Some(c) = self.chan_mut(a) {
            c.partner = None;
        }
    }

    /// the close event of a channel, if it was closed
    pub fn close_of(&self, prim: PrimitiveId) -> Option<Eid> {
        self.closes.get(&prim).copied()
    }

    /// executed send/recv ends that never found a partner
    pub fn unmatched(&self) -> impl Iterator<Item = OpRef> + '_ {
        self.pending.values().map(|(r, _)| *r)
    }

    pub fn routine(&self, r: RoutineId) -> Option<&[Eid]> {
        self.routines.get(&r).map(|s| s.as_slice())
    }

    pub fn routines(&self) -> impl Iterator<Item = (RoutineId, &[Eid])> + '_ {
        self.routines.iter().map(|(r, s)| (*r, s.as_slice()))
    }

    pub fn routine_ids(&self) -> impl Iterator<Item = RoutineId> + '_ {
        self.routines.keys().copied()
    }

    pub fn num_routines(&self) -> usize {
        self.routines.len()
    }

    /// Sort every routine by t-sort (stuck events to the end, program
    /// order preserved among ties) and refresh the per routine indexes.
    pub fn sort(&mut self) {
        let Self { events, routines, .. } = self;
        for (_, seq) in routines.iter_mut() {
            seq.sort_by_key(|eid| events[eid.0 as usize].tsort());
        }
        self.reindex()
    }

    fn reindex(&mut self) {
        let Self { events, routines, .. } = self;
        for (r, seq) in routines.iter() {
            for (i, eid) in seq.iter().enumerate() {
                let ev = &mut events[eid.0 as usize];
                ev.routine = *r;
                ev.index = i;
            }
        }
    }

    /// Drop every event that started after `t`
    pub fn shorten_to_time(&mut self, t: u64) {
        let mut dropped = Vec::new();
        {
            let Self { events, routines, .. } = self;
            for (_, seq) in routines.iter_mut() {
                seq.retain(|eid| {
                    let keep = events[eid.0 as usize].tpre <= t;
                    if !keep {
                        dropped.push(*eid)
                    }
                    keep
                });
            }
        }
        self.forget(&dropped);
        self.reindex()
    }

    /// Truncate one routine to its first `len` events
    pub fn shorten_routine_to_index(&mut self, r: RoutineId, len: usize) {
        let dropped = match self.routines.get_mut(&r) {
            None => return,
            Some(seq) => {
                if seq.len() <= len {
                    return;
                }
                seq.split_off(len)
            }
        };
        self.forget(&dropped);
        self.reindex()
    }

    /// Remove a single event from its routine's sequence
    pub fn remove(&mut self, eid: Eid) {
        let r = self.events[eid.0 as usize].routine;
        if let Some(seq) = self.routines.get_mut(&r) {
            seq.retain(|e| *e != eid);
        }
        self.forget(&[eid]);
        self.reindex()
    }

    // unlink partners of events that left the trace and drop their
    // close registrations. Arena slots are left orphaned, handles of
    // live events stay valid.
    fn forget(&mut self, dropped: &[Eid]) {
        for eid in dropped {
            let refs: smallvec::SmallVec<[OpRef; 4]> =
                match &self.events[eid.0 as usize].kind {
                    EventKind::Channel(_) => [OpRef::plain(*eid)].into_iter().collect(),
                    EventKind::Select(s) => (0..s.cases.len())
                        .map(|i| OpRef::case(*eid, i))
                        .collect(),
                    _ => continue,
                };
            for r in refs {
                self.unlink(r);
            }
            self.closes.retain(|_, c| *c != *eid);
        }
    }

    /// Deep copy. With `keep` false, timestamps and clocks are cleared
    /// so the copy can be re-timed from scratch; concurrency caches
    /// are dropped either way.
    pub fn copy(&self, keep: bool) -> Trace {
        let mut t = self.clone();
        for ev in &mut t.events {
            ev.conc.clear();
            if !keep {
                ev.tpre = 0;
                ev.tpost = 0;
                ev.vc = None;
                ev.wvc = None;
            }
        }
        t
    }

    /// largest completion timestamp of any executed event
    pub fn max_time(&self) -> u64 {
        self.routines
            .values()
            .flat_map(|s| s.iter())
            .map(|eid| self.events[eid.0 as usize].tpost)
            .max()
            .unwrap_or(0)
    }

    /// Append the terminating replay sentinel at time `t`. It lands
    /// on a routine that is not blocked and whose events all complete
    /// before `t`, or on a fresh routine when none qualifies, so the
    /// per routine order stays consistent.
    pub fn append_replay_end(&mut self, t: u64, exit: ExitCode) -> Result<Eid> {
        let mut ids: Vec<RoutineId> = self.routines.keys().copied().collect();
        ids.sort();
        let mut routine = RoutineId(ids.last().map(|r| r.0).unwrap_or(0) + 1);
        for r in ids {
            let fits = match self.routines.get(&r).and_then(|s| s.last()) {
                None => true,
                Some(last) => {
                    let ev = &self.events[last.0 as usize];
                    !ev.is_stuck() && ev.tsort() <= t
                }
            };
            if fits {
                routine = r;
                break;
            }
        }
        self.insert(routine, t, t, Pos::none(), EventKind::Replay { exit })
    }

    /// Re-point a select at a different case: the previously chosen
    /// case is cleared, `case` inherits the select's completion time.
    /// Choosing the default is expressed with `case == None`.
    pub fn set_chosen_case(&mut self, eid: Eid, case: Option<usize>) -> Result<()> {
        let tpost = self.events[eid.0 as usize].tpost;
        match &mut self.events[eid.0 as usize].kind {
            EventKind::Select(s) => {
                if let Some((_, c)) = s.chosen_case_mut() {
                    c.chosen = false;
                    c.tpost = 0;
                }
                match case {
                    None => {
                        if !s.has_default {
                            bail!("select has no default case")
                        }
                        s.chosen_index = -1;
                    }
                    Some(i) => {
                        let c = match s.cases.get_mut(i) {
                            Some(c) => c,
                            None => bail!("select has no case {i}"),
                        };
                        c.chosen = true;
                        c.tpost = tpost;
                        s.chosen_index = i as i32;
                    }
                }
                Ok(())
            }
            k => bail!("cannot choose a case of {k:?}"),
        }
    }

    /// Iterate event handles in global t-sort order: the smallest
    /// unconsumed completion time across all routines, ties broken by
    /// routine id. Stuck events surface after every executed event, in
    /// routine order, so they are visible without participating in the
    /// executed order. Assumes [`Trace::sort`] ran after the last
    /// timestamp mutation.
    pub fn iter(&self) -> TraceIter<'_> {
        TraceIter {
            trace: self,
            cursors: self.routines.iter().map(|(r, _)| (*r, 0)).collect(),
        }
    }

    /// every channel op handle, select cases included, in t-sort order
    /// of the carrying event
    pub fn chan_ops(&self) -> Vec<OpRef> {
        let mut out = Vec::new();
        for eid in self.iter() {
            match &self.event(eid).kind {
                EventKind::Channel(_) => out.push(OpRef::plain(eid)),
                EventKind::Select(s) => {
                    out.extend((0..s.cases.len()).map(|i| OpRef::case(eid, i)))
                }
                _ => (),
            }
        }
        out
    }

    /// 1-based occurrence index of the event among events of its
    /// routine recorded at the same source position, the
    /// disambiguating counter of the replay active file
    pub fn occurrence(&self, eid: Eid) -> usize {
        let ev = self.event(eid);
        match self.routines.get(&ev.routine) {
            None => 1,
            Some(seq) => {
                let mut n = 0;
                for e in seq {
                    let other = self.event(*e);
                    if other.pos == ev.pos {
                        n += 1;
                    }
                    if *e == eid {
                        break;
                    }
                }
                n.max(1)
            }
        }
    }
}

pub struct TraceIter<'a> {
    trace: &'a Trace,
    cursors: Vec<(RoutineId, usize)>,
}

impl<'a> Iterator for TraceIter<'a> {
    type Item = Eid;

    fn next(&mut self) -> Option<Eid> {
        let mut best: Option<(u64, RoutineId, usize)> = None;
        for (i, (r, cur)) in self.cursors.iter().enumerate() {
            let seq = match self.trace.routines.get(r) {
                Some(s) => s,
                None => continue,
            };
            if *cur >= seq.len() {
                continue;
            }
            let key = self.trace.event(seq[*cur]).tsort();
            match best {
                Some((bk, br, _)) if (bk, br) <= (key, *r) => (),
                _ => best = Some((key, *r, i)),
            }
        }
        let (_, r, i) = best?;
        let cur = &mut self.cursors[i].1;
        let eid = self.trace.routines[&r][*cur];
        *cur += 1;
        Some(eid)
    }
}

impl FromStr for Trace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        crate::parser::parse_trace(s)
    }
}

impl Serialize for Trace {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Clone, Copy)]
struct TraceVisitor;

impl<'de> de::Visitor<'de> for TraceVisitor {
    type Value = Trace;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected trace text")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Trace::from_str(s).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Trace {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        de.deserialize_str(TraceVisitor)
    }
}
