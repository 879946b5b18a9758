//! Happens before inference and predictive bug analysis over recorded
//! traces.
//!
//! The pipeline is: annotate a parsed trace with vector clocks
//! ([`hb`]), build a concurrency index ([`conc`]), run the bug
//! predictors ([`predict`]), and, per predicted bug, derive a
//! rewritten schedule expected to trigger it at replay ([`rewrite`]).
pub mod conc;
pub mod constraints;
pub mod hb;
pub mod predict;
pub mod rewrite;

use anyhow::Result;
use enumflags2::{bitflags, BitFlags};
use skein_trace::{trace::Trace, CancelFlag};

/// Selects which clock families and query structures an analysis
/// builds. Strong clocks are always computed.
#[derive(Debug, Clone, Copy)]
#[bitflags]
#[repr(u64)]
pub enum AnalyzerFlag {
    /// also compute clocks without critical section edges
    WeakClocks,
    /// build the partial order graph index
    PartialOrderGraph,
    /// build the per routine clock range index
    RangeIndex,
}

/// Annotate, index and run every predictor. The convenience entry
/// point the fuzz driver uses; the pieces are public for callers that
/// need only some of them.
pub fn analyze(
    trace: &mut Trace,
    flags: BitFlags<AnalyzerFlag>,
    cancel: &CancelFlag,
) -> Result<(conc::ConcIndex, predict::Report)> {
    let edges = hb::annotate(trace, flags, cancel)?;
    let index = conc::ConcIndex::build(trace, &edges, flags);
    let report = predict::run_all(trace, &index, cancel)?;
    Ok((index, report))
}
