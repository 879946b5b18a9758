//! Typed trace events
//!
//! One [`EventKind`] variant per recorded operation kind. Channel
//! payloads are shared between standalone channel events and select
//! cases; cross references between events are non owning [`OpRef`]
//! handles into the owning trace's arena.
use crate::{clock::VectorClock, Eid, ExitCode, OpId, Pos, PrimitiveId, RoutineId};
use anyhow::{bail, Result};
use smallvec::SmallVec;
use std::{cell::Cell, fmt, mem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicOp {
    Load,
    Store,
    Add,
    Swap,
    CompSwap,
    And,
    Or,
}

impl AtomicOp {
    pub fn letter(self) -> char {
        match self {
            Self::Load => 'L',
            Self::Store => 'S',
            Self::Add => 'A',
            Self::Swap => 'W',
            Self::CompSwap => 'C',
            Self::And => 'N',
            Self::Or => 'O',
        }
    }

    pub fn from_letter(c: char) -> Result<Self> {
        Ok(match c {
            'L' => Self::Load,
            'S' => Self::Store,
            'A' => Self::Add,
            'W' => Self::Swap,
            'C' => Self::CompSwap,
            'N' => Self::And,
            'O' => Self::Or,
            c => bail!("unknown atomic op {c}"),
        })
    }

    /// read-modify-write ops behave as store + load in the HB rules
    pub fn is_write(self) -> bool {
        !matches!(self, Self::Load)
    }

    pub fn is_read(self) -> bool {
        !matches!(self, Self::Store)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelOp {
    Send,
    Recv,
    Close,
}

impl ChannelOp {
    pub fn letter(self) -> char {
        match self {
            Self::Send => 'S',
            Self::Recv => 'R',
            Self::Close => 'C',
        }
    }

    pub fn from_letter(c: char) -> Result<Self> {
        Ok(match c {
            'S' => Self::Send,
            'R' => Self::Recv,
            'C' => Self::Close,
            c => bail!("unknown channel op {c}"),
        })
    }

    /// the op a partner must carry
    pub fn opposite(self) -> Option<Self> {
        match self {
            Self::Send => Some(Self::Recv),
            Self::Recv => Some(Self::Send),
            Self::Close => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutexOp {
    Lock,
    RLock,
    TryLock,
    TryRLock,
    Unlock,
    RUnlock,
}

impl MutexOp {
    pub fn letter(self) -> char {
        match self {
            Self::Lock => 'L',
            Self::RLock => 'R',
            Self::TryLock => 'T',
            Self::TryRLock => 'Y',
            Self::Unlock => 'U',
            Self::RUnlock => 'N',
        }
    }

    pub fn from_letter(c: char) -> Result<Self> {
        Ok(match c {
            'L' => Self::Lock,
            'R' => Self::RLock,
            'T' => Self::TryLock,
            'Y' => Self::TryRLock,
            'U' => Self::Unlock,
            'N' => Self::RUnlock,
            c => bail!("unknown mutex op {c}"),
        })
    }

    pub fn is_acquire(self) -> bool {
        matches!(self, Self::Lock | Self::RLock | Self::TryLock | Self::TryRLock)
    }

    pub fn is_release(self) -> bool {
        matches!(self, Self::Unlock | Self::RUnlock)
    }

    pub fn is_try(self) -> bool {
        matches!(self, Self::TryLock | Self::TryRLock)
    }

    pub fn is_read(self) -> bool {
        matches!(self, Self::RLock | Self::TryRLock | Self::RUnlock)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WgOp {
    /// add or done, distinguished by the sign of the delta
    Add,
    Wait,
}

impl WgOp {
    pub fn letter(self) -> char {
        match self {
            Self::Add => 'A',
            Self::Wait => 'W',
        }
    }

    pub fn from_letter(c: char) -> Result<Self> {
        Ok(match c {
            'A' => Self::Add,
            'W' => Self::Wait,
            c => bail!("unknown wait group op {c}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CondOp {
    Wait,
    Signal,
    Broadcast,
}

impl CondOp {
    pub fn letter(self) -> char {
        match self {
            Self::Wait => 'W',
            Self::Signal => 'S',
            Self::Broadcast => 'B',
        }
    }

    pub fn from_letter(c: char) -> Result<Self> {
        Ok(match c {
            'W' => Self::Wait,
            'S' => Self::Signal,
            'B' => Self::Broadcast,
            c => bail!("unknown cond op {c}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Atomic,
    Channel,
    Cond,
    Mutex,
    Once,
    WaitGroup,
}

impl PrimitiveKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::Atomic => "NA",
            Self::Channel => "NC",
            Self::Cond => "ND",
            Self::Mutex => "NM",
            Self::Once => "NO",
            Self::WaitGroup => "NW",
        }
    }

    pub fn from_code(s: &str) -> Result<Self> {
        Ok(match s {
            "NA" => Self::Atomic,
            "NC" => Self::Channel,
            "ND" => Self::Cond,
            "NM" => Self::Mutex,
            "NO" => Self::Once,
            "NW" => Self::WaitGroup,
            s => bail!("unknown primitive kind {s}"),
        })
    }
}

/// Non owning reference to a channel operation: either a standalone
/// channel event (`case == None`) or one case of a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpRef {
    pub eid: Eid,
    pub case: Option<u32>,
}

impl OpRef {
    pub fn plain(eid: Eid) -> Self {
        Self { eid, case: None }
    }

    pub fn case(eid: Eid, i: usize) -> Self {
        Self { eid, case: Some(i as u32) }
    }
}

impl fmt::Display for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.case {
            None => write!(f, "e{}", self.eid),
            Some(i) => write!(f, "e{}.{i}", self.eid),
        }
    }
}

/// Payload of a channel operation, shared by standalone channel
/// events and select cases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEv {
    pub prim: PrimitiveId,
    pub op: ChannelOp,
    /// a receive that completed because the channel was closed
    pub closed: bool,
    pub oid: OpId,
    pub qsize: u32,
    /// queue occupancy after the op completed
    pub qcount: u32,
    /// resolved at load time by pairing identical primitive id and op
    /// id with the opposite direction
    pub partner: Option<OpRef>,
}

impl ChannelEv {
    pub fn buffered(&self) -> bool {
        self.qsize > 0
    }
}

/// One case of a select. `tpost` is nonzero on the chosen case only,
/// mirroring the enclosing select's completion time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectCase {
    pub chan: ChannelEv,
    pub tpost: u64,
    pub chosen: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectEv {
    pub prim: PrimitiveId,
    pub cases: SmallVec<[SelectCase; 4]>,
    pub has_default: bool,
    /// index of the chosen case, -1 when the default was chosen (or
    /// nothing was, for a select that never completed)
    pub chosen_index: i32,
}

impl SelectEv {
    pub fn chose_default(&self) -> bool {
        self.has_default && self.chosen_index < 0
    }

    pub fn chosen_case(&self) -> Option<(usize, &SelectCase)> {
        let i = usize::try_from(self.chosen_index).ok()?;
        self.cases.get(i).map(|c| (i, c))
    }

    pub fn chosen_case_mut(&mut self) -> Option<(usize, &mut SelectCase)> {
        let i = usize::try_from(self.chosen_index).ok()?;
        self.cases.get_mut(i).map(|c| (i, c))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Atomic { prim: PrimitiveId, op: AtomicOp },
    Channel(ChannelEv),
    Select(SelectEv),
    Mutex { prim: PrimitiveId, rw: bool, op: MutexOp, suc: bool },
    WaitGroup { prim: PrimitiveId, op: WgOp, delta: i64, val: i64 },
    Cond { prim: PrimitiveId, op: CondOp },
    Once { prim: PrimitiveId, suc: bool },
    Fork { routine: RoutineId },
    New { prim: PrimitiveId, of: PrimitiveKind, num: u64 },
    End,
    Replay { exit: ExitCode },
}

impl EventKind {
    pub fn prim(&self) -> Option<PrimitiveId> {
        match self {
            Self::Atomic { prim, .. }
            | Self::Mutex { prim, .. }
            | Self::WaitGroup { prim, .. }
            | Self::Cond { prim, .. }
            | Self::Once { prim, .. }
            | Self::New { prim, .. } => Some(*prim),
            Self::Channel(c) => Some(c.prim),
            Self::Select(s) => Some(s.prim),
            Self::Fork { .. } | Self::End | Self::Replay { .. } => None,
        }
    }

    /// same primitive id and same kind of primitive
    pub fn same_primitive(&self, other: &Self) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
            && match (self.prim(), other.prim()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
    }

    /// synthetic sentinels carry no position
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::End | Self::Replay { .. })
    }
}

/// Per event cache of concurrency counts, four slots for
/// {strong, weak} x {all, same primitive}. Unknown until the first
/// query fills it; a hit must equal what a fresh scan would return.
#[derive(Debug, Clone, Default)]
pub struct ConcCache([Cell<Option<usize>>; 4]);

impl ConcCache {
    fn slot(weak: bool, same: bool) -> usize {
        ((weak as usize) << 1) | (same as usize)
    }

    pub fn get(&self, weak: bool, same: bool) -> Option<usize> {
        self.0[Self::slot(weak, same)].get()
    }

    pub fn set(&self, weak: bool, same: bool, count: usize) {
        self.0[Self::slot(weak, same)].set(Some(count))
    }

    pub fn clear(&self) {
        for c in &self.0 {
            c.set(None)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    /// arena handle, assigned on insertion
    pub eid: Eid,
    pub routine: RoutineId,
    /// position within the routine's sequence
    pub index: usize,
    pub tpre: u64,
    /// 0 means the operation never completed
    pub tpost: u64,
    pub pos: Pos,
    /// strong clock, with critical section edges; filled by the HB engine
    pub vc: Option<VectorClock>,
    /// weak clock, without critical section edges
    pub wvc: Option<VectorClock>,
    pub conc: ConcCache,
    pub kind: EventKind,
}

impl Event {
    /// Global sort key. Stuck events sort after every executed event.
    pub fn tsort(&self) -> u64 {
        if self.tpost == 0 {
            u64::MAX
        } else {
            self.tpost
        }
    }

    pub fn is_stuck(&self) -> bool {
        self.tpost == 0
    }

    /// last timestamp the event is known to have existed at
    pub fn end_time(&self) -> u64 {
        if self.tpost == 0 {
            self.tpre
        } else {
            self.tpost
        }
    }

    pub fn prim(&self) -> Option<PrimitiveId> {
        self.kind.prim()
    }

    pub fn chan(&self) -> Option<&ChannelEv> {
        match &self.kind {
            EventKind::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn select(&self) -> Option<&SelectEv> {
        match &self.kind {
            EventKind::Select(s) => Some(s),
            _ => None,
        }
    }

    pub fn vc(&self) -> &VectorClock {
        static EMPTY: std::sync::LazyLock<VectorClock> =
            std::sync::LazyLock::new(VectorClock::new);
        self.vc.as_ref().unwrap_or(&EMPTY)
    }

    pub fn wvc(&self) -> &VectorClock {
        static EMPTY: std::sync::LazyLock<VectorClock> =
            std::sync::LazyLock::new(VectorClock::new);
        self.wvc.as_ref().unwrap_or(&EMPTY)
    }

    pub fn clock(&self, weak: bool) -> &VectorClock {
        if weak {
            self.wvc()
        } else {
            self.vc()
        }
    }
}
