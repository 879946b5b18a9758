//! Data model for recorded executions of concurrent programs.
//!
//! A trace is a set of routines, each an ordered sequence of typed
//! events (channel operations, mutexes, wait groups, conds, onces,
//! atomics, forks). This crate owns the event arena, the on disk
//! format, and the vector clock algebra the analysis layers are built
//! on. It knows nothing about happens before inference or bug
//! prediction, see `skein-analysis` for those.
#[macro_use]
extern crate serde_derive;

pub mod clock;
pub mod event;
pub mod parser;
pub mod print;
pub mod trace;

use anyhow::{anyhow, bail, Result};
use arcstr::ArcStr;
use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};
use triomphe::Arc;

macro_rules! id {
    ($(#[$m:meta])* $name:ident, $repr:ty) => {
        $(#[$m])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub $repr);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$repr> for $name {
            fn from(v: $repr) -> Self {
                Self(v)
            }
        }
    };
}

id!(
    /// Handle of an event in the owning trace's arena. Doubles as the
    /// globally unique trace id, assigned monotonically on insertion.
    Eid,
    u32
);

id!(
    /// Routine (thread) identifier. Routine n is recorded on line n of
    /// the trace file, 1 based.
    RoutineId,
    u32
);

id!(
    /// Identity of a concurrency primitive (channel, mutex, wait
    /// group, cond, once, atomic variable). Id 0 is the nil channel.
    PrimitiveId,
    u64
);

id!(
    /// Channel operation id. A send and the receive that consumed its
    /// value carry the same op id on the same primitive.
    OpId,
    u64
);

impl PrimitiveId {
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }
}

/// Source location an event was recorded at
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pos {
    pub file: ArcStr,
    pub line: u32,
}

impl Pos {
    pub fn new(file: ArcStr, line: u32) -> Self {
        Self { file, line }
    }

    /// position of synthetic sentinels (routine end, replay marker)
    pub fn none() -> Self {
        Self { file: arcstr::literal!(""), line: 0 }
    }

    pub fn is_none(&self) -> bool {
        self.file.is_empty() && self.line == 0
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

impl FromStr for Pos {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (file, line) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("malformed position {s}, expected file:line"))?;
        let line = line.parse::<u32>().map_err(|_| anyhow!("malformed line in {s}"))?;
        Ok(Self { file: ArcStr::from(file), line })
    }
}

/// Reserved replay exit codes. A replay run exiting with the code a
/// rewrite was constructed for confirms the targeted bug; 0 means the
/// replay completed without hitting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitCode {
    Ok,
    SendClosed,
    RecvClosed,
    NegativeWg,
    UnlockBeforeLock,
    CyclicDeadlock,
    LeakUnbuffered,
    LeakBuffered,
    LeakMutex,
    LeakWg,
    LeakCond,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::SendClosed => 30,
            Self::RecvClosed => 31,
            Self::NegativeWg => 32,
            Self::UnlockBeforeLock => 33,
            Self::CyclicDeadlock => 34,
            Self::LeakUnbuffered => 35,
            Self::LeakBuffered => 36,
            Self::LeakMutex => 37,
            Self::LeakWg => 38,
            Self::LeakCond => 39,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            0 => Self::Ok,
            30 => Self::SendClosed,
            31 => Self::RecvClosed,
            32 => Self::NegativeWg,
            33 => Self::UnlockBeforeLock,
            34 => Self::CyclicDeadlock,
            35 => Self::LeakUnbuffered,
            36 => Self::LeakBuffered,
            37 => Self::LeakMutex,
            38 => Self::LeakWg,
            39 => Self::LeakCond,
            c => bail!("unknown replay exit code {c}"),
        })
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One shot cancellation flag shared between the analysis worker and
/// the memory supervisor. It is polled at designated points only: per
/// event in the HB sweep, per routine in trace iteration, per mutation
/// in the fuzz loop. Partial work is abandoned, already written
/// artifacts are kept.
#[derive(Debug, Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// bail with [`Cancelled`] if the flag was raised
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            bail!(Cancelled)
        }
        Ok(())
    }
}

/// Marker error returned when the supervisor cancelled an analysis
#[derive(Debug, Clone, Copy)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled by the resource supervisor")
    }
}

pub fn is_cancelled(e: &anyhow::Error) -> bool {
    e.downcast_ref::<Cancelled>().is_some()
}
