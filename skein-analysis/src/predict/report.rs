//! Bug records and the deduplicated report
use indexmap::IndexMap;
use skein_trace::{event::OpRef, trace::Trace, ExitCode};
use smallvec::SmallVec;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BugKind {
    // bugs that occurred in the recording itself
    ActualSendClosed,
    ActualRecvClosed,
    ActualCloseClosed,
    ActualCloseNil,
    ActualNegativeWg,
    ActualUnlockUnheld,
    ConcurrentRecv,
    SelectWithoutPartner,
    // bugs a feasible reschedule could trigger
    PossibleSendClosed,
    PossibleRecvClosed,
    PossibleNegativeWg,
    PossibleUnlockBeforeLock,
    CyclicDeadlock,
    /// reserved: mixed mutex plus channel deadlock, no predictor yet
    MixedDeadlock,
    // routines stuck at recording end
    LeakNoBlock,
    LeakUnbufferedWith,
    LeakUnbufferedWithout,
    LeakBufferedWith,
    LeakBufferedWithout,
    LeakNil,
    LeakSelectWith,
    LeakSelectWithout,
    LeakMutex,
    LeakWg,
    LeakCond,
    // replay outcomes
    ReplayPanic,
    ReplayTimeout,
}

impl BugKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::ActualSendClosed => "A01",
            Self::ActualRecvClosed => "A02",
            Self::ActualCloseClosed => "A03",
            Self::ActualCloseNil => "A04",
            Self::ActualNegativeWg => "A05",
            Self::ActualUnlockUnheld => "A06",
            Self::ConcurrentRecv => "A07",
            Self::SelectWithoutPartner => "A08",
            Self::PossibleSendClosed => "P01",
            Self::PossibleRecvClosed => "P02",
            Self::PossibleNegativeWg => "P03",
            Self::PossibleUnlockBeforeLock => "P04",
            Self::CyclicDeadlock => "P05",
            Self::MixedDeadlock => "P06",
            Self::LeakNoBlock => "L00",
            Self::LeakUnbufferedWith => "L01",
            Self::LeakUnbufferedWithout => "L02",
            Self::LeakBufferedWith => "L03",
            Self::LeakBufferedWithout => "L04",
            Self::LeakNil => "L05",
            Self::LeakSelectWith => "L06",
            Self::LeakSelectWithout => "L07",
            Self::LeakMutex => "L08",
            Self::LeakWg => "L09",
            Self::LeakCond => "L10",
            Self::ReplayPanic => "R01",
            Self::ReplayTimeout => "R02",
        }
    }

    /// The replay exit code a rewrite for this bug terminates with.
    /// None means the bug has no rewrite.
    pub fn exit_code(self) -> Option<ExitCode> {
        match self {
            Self::PossibleSendClosed => Some(ExitCode::SendClosed),
            Self::PossibleRecvClosed => Some(ExitCode::RecvClosed),
            Self::PossibleNegativeWg => Some(ExitCode::NegativeWg),
            Self::PossibleUnlockBeforeLock => Some(ExitCode::UnlockBeforeLock),
            Self::CyclicDeadlock => Some(ExitCode::CyclicDeadlock),
            Self::LeakUnbufferedWith | Self::LeakSelectWith => {
                Some(ExitCode::LeakUnbuffered)
            }
            Self::LeakBufferedWith => Some(ExitCode::LeakBuffered),
            Self::LeakMutex => Some(ExitCode::LeakMutex),
            Self::LeakWg => Some(ExitCode::LeakWg),
            Self::LeakCond => Some(ExitCode::LeakCond),
            _ => None,
        }
    }

    /// Which clock family the detector compares with. Only
    /// unlock-before-lock needs the weak order, the strong one
    /// already contains the very lock edge in question.
    pub fn uses_weak(self) -> bool {
        matches!(self, Self::PossibleUnlockBeforeLock)
    }

    pub fn is_leak(self) -> bool {
        matches!(
            self,
            Self::LeakNoBlock
                | Self::LeakUnbufferedWith
                | Self::LeakUnbufferedWithout
                | Self::LeakBufferedWith
                | Self::LeakBufferedWithout
                | Self::LeakNil
                | Self::LeakSelectWith
                | Self::LeakSelectWithout
                | Self::LeakMutex
                | Self::LeakWg
                | Self::LeakCond
        )
    }
}

/// A detected or predicted bug: the causing events and the events a
/// rewrite needs to express the reschedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bug {
    pub kind: BugKind,
    pub group1: SmallVec<[OpRef; 2]>,
    pub group2: SmallVec<[OpRef; 4]>,
}

impl Bug {
    pub fn new(
        kind: BugKind,
        group1: impl IntoIterator<Item = OpRef>,
        group2: impl IntoIterator<Item = OpRef>,
    ) -> Self {
        Self {
            kind,
            group1: group1.into_iter().collect(),
            group2: group2.into_iter().collect(),
        }
    }

    fn render_ref(trace: &Trace, r: OpRef, out: &mut String) {
        let ev = trace.event(r.eid);
        match r.case {
            None => {
                let _ = write!(
                    out,
                    "T:{}:{}:{}:{}:{}",
                    ev.routine, ev.index, ev.tpre, ev.tpost, ev.pos
                );
            }
            Some(i) => {
                let tpost = trace.op_times(r).map(|(_, t)| t).unwrap_or(0);
                let _ = write!(
                    out,
                    "S:{}:{}:{}:{}:{}:{}",
                    ev.routine, ev.index, ev.tpre, tpost, ev.pos, i
                );
            }
        }
    }

    /// one report line: `code,ref[;ref..][,ref[;ref..]]`
    pub fn render(&self, trace: &Trace) -> String {
        let mut out = String::new();
        out.push_str(self.kind.code());
        for group in [self.group1.as_slice(), self.group2.as_slice()] {
            if group.is_empty() {
                continue;
            }
            out.push(',');
            for (i, r) in group.iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                Self::render_ref(trace, *r, &mut out);
            }
        }
        out
    }
}

/// Insertion ordered, deduplicated by the rendered line
#[derive(Debug, Default)]
pub struct Report {
    entries: IndexMap<String, Bug>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// record the bug unless an identical line is already present
    pub fn push(&mut self, trace: &Trace, bug: Bug) -> bool {
        let line = bug.render(trace);
        if self.entries.contains_key(&line) {
            return false;
        }
        self.entries.insert(line, bug);
        true
    }

    pub fn bugs(&self) -> impl Iterator<Item = &Bug> + '_ {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_bug(&self) -> bool {
        !self.entries.is_empty()
    }

    /// the bug report file, one line per bug
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in self.entries.keys() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}
