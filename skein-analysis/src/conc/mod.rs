//! Concurrency queries: which events are HB incomparable with a
//! given event.
//!
//! Three interchangeable implementations: a direct clock scan, a
//! partial order graph over the immediate HB edges, and a per routine
//! clock range lookup. They must return identical sets; the property
//! tests pin that down. Counts are cached on the event, four slots
//! for {strong, weak} x {all, same primitive}.
use crate::{hb::HbEdge, AnalyzerFlag};
use enumflags2::BitFlags;
use skein_trace::{clock::ClockRel, trace::Trace, Eid};

mod graph;

pub use graph::PoGraph;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConcOpts {
    /// return every match instead of stopping at the first
    pub all: bool,
    /// restrict to events on the same primitive id and kind
    pub same_primitive: bool,
    /// compare by the weak clocks (requires them to be computed)
    pub weak: bool,
}

impl ConcOpts {
    pub fn all() -> Self {
        Self { all: true, same_primitive: false, weak: false }
    }

    pub fn same(mut self, same: bool) -> Self {
        self.same_primitive = same;
        self
    }

    pub fn weak(mut self, weak: bool) -> Self {
        self.weak = weak;
        self
    }
}

#[derive(Debug)]
pub struct ConcIndex {
    graph: Option<PoGraph>,
    ranges: bool,
}

impl ConcIndex {
    pub fn build(trace: &Trace, edges: &[HbEdge], flags: BitFlags<AnalyzerFlag>) -> Self {
        let graph = flags
            .contains(AnalyzerFlag::PartialOrderGraph)
            .then(|| PoGraph::build(trace, edges));
        Self { graph, ranges: flags.contains(AnalyzerFlag::RangeIndex) }
    }

    /// direct scan only, no precomputed structure
    pub fn scan_only() -> Self {
        Self { graph: None, ranges: false }
    }

    /// Every event concurrent with `e` under the selected clock
    /// family (just the first match when `opts.all` is false).
    /// Results are ascending by event handle.
    pub fn concurrent(&self, trace: &Trace, e: Eid, opts: ConcOpts) -> Vec<Eid> {
        let out = if let Some(g) = &self.graph {
            g.concurrent(trace, e, opts)
        } else if self.ranges {
            ranges_concurrent(trace, e, opts)
        } else {
            scan_concurrent(trace, e, opts)
        };
        if opts.all {
            trace.event(e).conc.set(opts.weak, opts.same_primitive, out.len());
        }
        out
    }

    pub fn count(&self, trace: &Trace, e: Eid, weak: bool, same_primitive: bool) -> usize {
        if let Some(n) = trace.event(e).conc.get(weak, same_primitive) {
            return n;
        }
        self.concurrent(trace, e, ConcOpts { all: true, same_primitive, weak }).len()
    }

    pub fn has_concurrent(&self, trace: &Trace, e: Eid, opts: ConcOpts) -> bool {
        !self.concurrent(trace, e, ConcOpts { all: false, ..opts }).is_empty()
    }
}

/// compare `e` against every other live event
pub fn scan_concurrent(trace: &Trace, e: Eid, opts: ConcOpts) -> Vec<Eid> {
    let ev = trace.event(e);
    let ec = ev.clock(opts.weak);
    let mut out = Vec::new();
    for f in trace.iter() {
        if f == e {
            continue;
        }
        let fv = trace.event(f);
        if opts.same_primitive && !fv.kind.same_primitive(&ev.kind) {
            continue;
        }
        if ec.compare(fv.clock(opts.weak)) == ClockRel::Concurrent {
            out.push(f);
            if !opts.all {
                return out;
            }
        }
    }
    out.sort();
    out
}

/// Along one routine's t-sorted sequence the own clock component is
/// strictly increasing and every foreign component is non decreasing,
/// so the events of routine s concurrent with e form one contiguous
/// index range, found with two partition points.
pub fn ranges_concurrent(trace: &Trace, e: Eid, opts: ConcOpts) -> Vec<Eid> {
    let ev = trace.event(e);
    let ec = ev.clock(opts.weak);
    let r = ev.routine;
    let mut out = Vec::new();
    for (s, seq) in trace.routines() {
        if s == r {
            continue;
        }
        // events of s that e does not know about yet
        let lo = seq
            .partition_point(|f| trace.event(*f).clock(opts.weak).get(s) <= ec.get(s));
        // events of s that do not know about e yet
        let hi = seq
            .partition_point(|f| trace.event(*f).clock(opts.weak).get(r) < ec.get(r));
        for f in &seq[lo..hi.max(lo)] {
            if opts.same_primitive && !trace.event(*f).kind.same_primitive(&ev.kind) {
                continue;
            }
            out.push(*f);
            if !opts.all {
                return out;
            }
        }
    }
    out.sort();
    out
}
