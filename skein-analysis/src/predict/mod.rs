//! Bug predictors
//!
//! One detector per bug family. Detectors scan the annotated trace,
//! never mutate it, and append to a shared deduplicated report.
//! `group1` of each bug carries the causing events, `group2` the
//! events a rewrite needs to express the reschedule.
use crate::conc::ConcIndex;
use anyhow::Result;
use skein_trace::{trace::Trace, CancelFlag};

mod channel;
mod closed;
mod leak;
mod mutex;
mod report;
mod waitgroup;

pub use report::{Bug, BugKind, Report};

/// Run every predictor over an annotated trace
pub fn run_all(trace: &Trace, idx: &ConcIndex, cancel: &CancelFlag) -> Result<Report> {
    let mut report = Report::new();
    cancel.check()?;
    closed::detect(trace, &mut report);
    cancel.check()?;
    waitgroup::detect(trace, &mut report);
    cancel.check()?;
    mutex::detect(trace, &mut report);
    cancel.check()?;
    channel::detect(trace, &mut report);
    cancel.check()?;
    leak::detect(trace, idx, &mut report);
    Ok(report)
}
