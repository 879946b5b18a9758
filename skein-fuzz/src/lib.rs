//! Schedule fuzzing
//!
//! Drives repeated runs of an instrumented program: parse the
//! recorded trace, predict bugs, derive mutations of the schedule
//! (select biasing, flow expansion, chain perturbation, HB guided
//! flips), write each mutation out and trigger the next run through
//! the [`Runner`] seam. The record/replay runtime itself lives
//! outside this crate; a `Runner` implementation is the only thing it
//! asks of its host.
use anyhow::{bail, Result};
use derive_builder::Builder;
use skein_trace::CancelFlag;
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

pub mod chain;
mod driver;
pub mod flow;
pub mod gfuzz;
pub mod gopie;
pub mod guided;
pub mod mutation;
pub mod supervisor;
pub mod writer;

pub use driver::{FuzzCtx, FuzzOutcome, StopReason};

/// The mutation strategy of a fuzzing session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzMode {
    GFuzz,
    GFuzzHb,
    GFuzzHbFlow,
    Flow,
    GoPie,
    GoCr,
    GoCrHb,
    Guided,
}

impl FuzzMode {
    /// whether the mode pays for HB annotation and bug prediction
    pub fn uses_hb(self) -> bool {
        matches!(
            self,
            Self::GFuzzHb | Self::GFuzzHbFlow | Self::GoCrHb | Self::Guided
        )
    }

    pub fn uses_selects(self) -> bool {
        matches!(self, Self::GFuzz | Self::GFuzzHb | Self::GFuzzHbFlow)
    }

    pub fn uses_flow(self) -> bool {
        matches!(self, Self::Flow | Self::GFuzzHbFlow)
    }

    pub fn uses_chains(self) -> bool {
        matches!(self, Self::GoPie | Self::GoCr | Self::GoCrHb | Self::Guided)
    }

    /// chain neighborhoods come from the HB index instead of the
    /// same primitive pools
    pub fn hb_guided_chains(self) -> bool {
        matches!(self, Self::GoCrHb | Self::Guided)
    }
}

impl fmt::Display for FuzzMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GFuzz => "GFuzz",
            Self::GFuzzHb => "GFuzzHB",
            Self::GFuzzHbFlow => "GFuzzHBFlow",
            Self::Flow => "Flow",
            Self::GoPie => "GoPie",
            Self::GoCr => "GoCR",
            Self::GoCrHb => "GoCRHB",
            Self::Guided => "Guided",
        };
        write!(f, "{s}")
    }
}

impl FromStr for FuzzMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "GFuzz" => Self::GFuzz,
            "GFuzzHB" => Self::GFuzzHb,
            "GFuzzHBFlow" => Self::GFuzzHbFlow,
            "Flow" => Self::Flow,
            "GoPie" => Self::GoPie,
            "GoCR" => Self::GoCr,
            "GoCRHB" => Self::GoCrHb,
            "Guided" => Self::Guided,
            s => bail!("unknown fuzz mode {s}"),
        })
    }
}

/// What the next run should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunInput {
    /// record a fresh execution
    Record,
    /// replay the trace folder written for a mutation or rewrite
    Trace { dir: PathBuf },
    /// record again, biased by a select and/or flow file
    Bias { select_file: Option<PathBuf>, flow_file: Option<PathBuf> },
}

/// What one run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// the recorded trace, in the on disk format
    pub trace: String,
    /// process exit code; replay runs report the reserved codes
    pub exit: i32,
    pub timed_out: bool,
}

/// The seam to the external record/replay runtime. The driver runs
/// strictly sequentially: one call at a time, awaited to completion.
pub trait Runner: Send {
    fn run(&mut self, input: RunInput) -> impl Future<Output = Result<RunOutcome>> + Send;
}

/// Configuration of a fuzzing session
#[derive(Debug, Builder)]
#[builder(pattern = "owned")]
pub struct FuzzConfig {
    /// mutation strategy
    pub mode: FuzzMode,
    /// directory the fuzz artifacts are written under
    pub out_dir: PathBuf,
    /// total run budget, the recording run included
    #[builder(default = "100")]
    pub max_runs: u64,
    /// wall clock budget, measured from the first run
    #[builder(setter(strip_option), default)]
    pub time_budget: Option<Duration>,
    /// stop at the first predicted or replay confirmed bug
    #[builder(default)]
    pub finish_on_bug: bool,
    /// descendants each chain rewriting rule may contribute
    #[builder(default = "8")]
    pub energy: usize,
    /// rng seed for reproducible sessions
    #[builder(setter(strip_option), default)]
    pub seed: Option<u64>,
    /// shared cancellation flag, usually owned by the supervisor
    #[builder(default)]
    pub cancel: CancelFlag,
}

impl FuzzConfig {
    pub fn builder(mode: FuzzMode, out_dir: PathBuf) -> FuzzConfigBuilder {
        FuzzConfigBuilder::default().mode(mode).out_dir(out_dir)
    }
}
