//! Serialization back to the on disk trace format
//!
//! `Display` of a [`Trace`] is the canonical file form: line n carries
//! routine n's events in their stored (t-sorted) order. A select's
//! default marker always prints after the channel cases.
use crate::{
    event::{Event, EventKind, SelectEv},
    trace::Trace,
    RoutineId,
};
use std::fmt;

fn tf(b: bool) -> char {
    if b {
        't'
    } else {
        'f'
    }
}

fn fmt_select(s: &SelectEv, ev: &Event, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "S,{},{},{},", ev.tpre, ev.tpost, s.prim)?;
    for (i, case) in s.cases.iter().enumerate() {
        if i > 0 {
            write!(f, "~")?;
        }
        let c = &case.chan;
        write!(
            f,
            "{}.{}.{}.{}.{}",
            c.prim,
            c.op.letter(),
            tf(c.closed),
            c.oid,
            c.qsize
        )?;
    }
    if s.has_default {
        if !s.cases.is_empty() {
            write!(f, "~")?;
        }
        let chosen = ev.tpost != 0 && s.chosen_index < 0;
        write!(f, "{}", if chosen { 'D' } else { 'd' })?;
    }
    write!(f, ",{},{}", s.chosen_index, ev.pos)
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::Atomic { prim, op } => {
                write!(f, "A,{},{},{},{}", self.tpost, prim, op.letter(), self.pos)
            }
            EventKind::Channel(c) => write!(
                f,
                "C,{},{},{},{},{},{},{},{},{}",
                self.tpre,
                self.tpost,
                c.prim,
                c.op.letter(),
                tf(c.closed),
                c.oid,
                c.qsize,
                c.qcount,
                self.pos
            ),
            EventKind::Select(s) => fmt_select(s, self, f),
            EventKind::Mutex { prim, rw, op, suc } => write!(
                f,
                "M,{},{},{},{},{},{},{}",
                self.tpre,
                self.tpost,
                prim,
                if *rw { 't' } else { '-' },
                op.letter(),
                tf(*suc),
                self.pos
            ),
            EventKind::WaitGroup { prim, op, delta, val } => write!(
                f,
                "W,{},{},{},{},{},{},{}",
                self.tpre,
                self.tpost,
                prim,
                op.letter(),
                delta,
                val,
                self.pos
            ),
            EventKind::Cond { prim, op } => write!(
                f,
                "D,{},{},{},{},{}",
                self.tpre,
                self.tpost,
                prim,
                op.letter(),
                self.pos
            ),
            EventKind::Once { prim, suc } => write!(
                f,
                "O,{},{},{},{},{}",
                self.tpre,
                self.tpost,
                prim,
                tf(*suc),
                self.pos
            ),
            EventKind::Fork { routine } => {
                write!(f, "G,{},{},{}", self.tpost, routine, self.pos)
            }
            EventKind::New { prim, of, num } => {
                write!(f, "N,{},{},{},{},{}", self.tpost, prim, of.code(), num, self.pos)
            }
            EventKind::End => write!(f, "E,{}", self.tpost),
            EventKind::Replay { exit } => write!(f, "X,{},{}", self.tpost, exit.code()),
        }
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let max = self.routine_ids().map(|r| r.0).max().unwrap_or(0);
        for r in 1..=max {
            if r > 1 {
                writeln!(f)?;
            }
            if let Some(seq) = self.routine(RoutineId(r)) {
                for (i, eid) in seq.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", self.event(*eid))?;
                }
            }
        }
        Ok(())
    }
}
