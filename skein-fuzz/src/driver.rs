//! The fuzzing driver loop
//!
//! Run once, parse, predict, mutate, enqueue, pop, materialize, run
//! again; stop when the queue drains, a budget runs out, the
//! supervisor cancels, or a bug surfaces with finish-on-bug set.
use crate::{
    chain::Chain,
    flow::{self, FlowCounts},
    gfuzz::{self, SelectHistory},
    gopie::{self, Pools},
    guided,
    mutation::{Mutation, MutationQueue},
    writer, FuzzConfig, RunInput, RunOutcome, Runner,
};
use anyhow::{Context, Result};
use fxhash::{FxHashMap, FxHashSet};
use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use skein_analysis::{
    analyze,
    conc::ConcIndex,
    hb,
    predict::Report,
    rewrite, AnalyzerFlag,
};
use skein_trace::{parser::parse_trace, trace::Trace, ExitCode};
use std::{fs, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    QueueEmpty,
    MaxRuns,
    TimeBudget,
    BugFound,
    Cancelled,
}

#[derive(Debug)]
pub struct FuzzOutcome {
    pub runs: u64,
    pub stop: StopReason,
    /// rendered bug report lines, across every analyzed run
    pub bugs: Vec<String>,
    /// trace folders written for predicted bug rewrites
    pub rewrites: Vec<std::path::PathBuf>,
}

pub struct FuzzCtx {
    cfg: FuzzConfig,
    queue: MutationQueue,
    runs: u64,
    started: Option<Instant>,
    chain_files: FxHashMap<u64, Chain>,
    next_file: u64,
    select_history: SelectHistory,
    flow_counts: FlowCounts,
    found: FxHashSet<String>,
    rng: StdRng,
}

impl FuzzCtx {
    pub fn new(cfg: FuzzConfig) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::rng().random()),
        };
        Self {
            cfg,
            queue: MutationQueue::new(),
            runs: 0,
            started: None,
            chain_files: FxHashMap::default(),
            next_file: 1,
            select_history: SelectHistory::default(),
            flow_counts: FlowCounts::default(),
            found: FxHashSet::default(),
            rng,
        }
    }

    /// the chain a given trace folder number was written from
    pub fn chain_file(&self, n: u64) -> Option<&Chain> {
        self.chain_files.get(&n)
    }

    fn out_of_time(&self) -> bool {
        match (self.cfg.time_budget, self.started) {
            (Some(budget), Some(started)) => started.elapsed() >= budget,
            _ => false,
        }
    }

    // enqueue while the queue still fits into the remaining run budget
    fn enqueue(&mut self, m: Mutation) -> bool {
        let remaining =
            self.cfg.max_runs.saturating_sub(self.runs) as usize;
        if self.queue.len() >= remaining {
            return false;
        }
        self.queue.push(m)
    }

    fn enqueue_chain(&mut self, chain: Chain) {
        let m = Mutation::Chain { chain, file_number: self.next_file };
        if self.enqueue(m) {
            self.next_file += 1;
        }
    }

    /// Drive the whole session. The recording run is fuzz run 0.
    pub async fn run<R: Runner>(&mut self, runner: &mut R) -> Result<FuzzOutcome> {
        fs::create_dir_all(&self.cfg.out_dir).with_context(|| {
            format!("creating fuzz directory {}", self.cfg.out_dir.display())
        })?;
        let mut bugs: Vec<String> = Vec::new();
        let mut rewrites = Vec::new();
        let mut input = RunInput::Record;
        info!("fuzzing in mode {} under {}", self.cfg.mode, self.cfg.out_dir.display());
        let stop = loop {
            if self.cfg.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if self.runs >= self.cfg.max_runs {
                break StopReason::MaxRuns;
            }
            if self.out_of_time() {
                break StopReason::TimeBudget;
            }
            let was_replay = matches!(input, RunInput::Trace { .. });
            let outcome = runner.run(input.clone()).await?;
            if self.started.is_none() {
                self.started = Some(Instant::now());
            }
            self.runs += 1;
            let hit = self.classify_replay(was_replay, &outcome, &mut bugs);
            if hit && self.cfg.finish_on_bug {
                break StopReason::BugFound;
            }
            let mut trace = parse_trace(&outcome.trace)
                .with_context(|| format!("parsing the trace of run {}", self.runs))?;
            let flags = AnalyzerFlag::WeakClocks | AnalyzerFlag::RangeIndex;
            let mut idx = None;
            let mut report = None;
            if self.cfg.mode.uses_hb() {
                let (i, r) = analyze(&mut trace, flags, &self.cfg.cancel)?;
                let fresh = self.record_bugs(&r, &mut bugs);
                if fresh {
                    writer::write_report(&self.cfg.out_dir, &bugs)?;
                }
                self.write_rewrites(&trace, &r, &mut rewrites)?;
                idx = Some(i);
                report = Some(r);
                if fresh && self.cfg.finish_on_bug {
                    break StopReason::BugFound;
                }
            } else if self.cfg.mode.uses_chains() {
                // chain validity needs clocks even when prediction is
                // skipped for speed
                let edges = hb::annotate(&mut trace, flags, &self.cfg.cancel)?;
                idx = Some(ConcIndex::build(&trace, &edges, flags));
            }
            self.generate(&trace, idx.as_ref(), report.as_ref());
            match self.queue.pop() {
                // the queue is kept within the run budget, so an empty
                // queue at the budget boundary means the budget ran out
                None if self.runs >= self.cfg.max_runs => break StopReason::MaxRuns,
                None => break StopReason::QueueEmpty,
                Some(m) => input = self.materialize(&trace, m)?,
            }
        };
        info!("fuzzing stopped after {} runs: {:?}", self.runs, stop);
        Ok(FuzzOutcome { runs: self.runs, stop, bugs, rewrites })
    }

    // a replay exiting with a reserved code confirms its bug; other
    // failures are recorded as panic or timeout
    fn classify_replay(
        &mut self,
        was_replay: bool,
        outcome: &RunOutcome,
        bugs: &mut Vec<String>,
    ) -> bool {
        if outcome.timed_out {
            if self.found.insert(format!("R02,{}", self.runs)) {
                bugs.push(format!("R02,{}", self.runs));
            }
            return false;
        }
        if outcome.exit == 0 {
            if was_replay {
                debug!("replay run {} completed without its bug", self.runs);
            }
            return false;
        }
        match ExitCode::from_code(outcome.exit) {
            Ok(code) => {
                let line = format!("confirmed,{}", code.code());
                if self.found.insert(line.clone()) {
                    info!("replay confirmed a bug with exit {code}");
                    bugs.push(line);
                }
                true
            }
            Err(_) => {
                let line = format!("R01,{}", outcome.exit);
                if self.found.insert(line.clone()) {
                    warn!("run {} crashed with exit {}", self.runs, outcome.exit);
                    bugs.push(line);
                }
                true
            }
        }
    }

    fn record_bugs(&mut self, report: &Report, bugs: &mut Vec<String>) -> bool {
        let mut fresh = false;
        for line in report.render().lines() {
            if self.found.insert(line.to_string()) {
                bugs.push(line.to_string());
                fresh = true;
            }
        }
        fresh
    }

    fn write_rewrites(
        &mut self,
        trace: &Trace,
        report: &Report,
        rewrites: &mut Vec<std::path::PathBuf>,
    ) -> Result<()> {
        for bug in report.bugs() {
            if bug.kind.exit_code().is_none() {
                continue;
            }
            match rewrite::rewrite(trace, bug) {
                Ok(rw) => {
                    let n = self.next_file;
                    self.next_file += 1;
                    rewrites.push(writer::write_rewrite(&self.cfg.out_dir, n, &rw)?);
                }
                Err(e) => debug!("{} not rewritable: {e:#}", bug.kind.code()),
            }
        }
        Ok(())
    }

    fn generate(
        &mut self,
        trace: &Trace,
        idx: Option<&ConcIndex>,
        report: Option<&Report>,
    ) {
        let mode = self.cfg.mode;
        if mode.uses_selects() {
            for m in gfuzz::mutations(trace, mode.uses_hb(), &mut self.select_history)
            {
                self.enqueue(m);
            }
        }
        if mode.uses_flow() {
            for m in flow::mutations(trace, &mut self.flow_counts) {
                self.enqueue(m);
            }
        }
        if mode.uses_chains() {
            let pools = Pools::build(trace, mode.hb_guided_chains(), idx);
            let mut seeds = pools.seeds(trace);
            if let Some(idx) = idx {
                // busiest chains first
                let mut scored: Vec<(f64, Chain)> = seeds
                    .into_iter()
                    .map(|c| (c.quality(trace, idx, &mut self.rng), c))
                    .collect();
                scored.sort_by(|a, b| b.0.total_cmp(&a.0));
                seeds = scored.into_iter().map(|(_, c)| c).collect();
            }
            let energy = self.cfg.energy;
            for seed in seeds.into_iter().take(energy.max(1)) {
                let descendants =
                    gopie::mutate(&seed, trace, &pools, energy, true, &mut self.rng);
                for chain in descendants {
                    self.enqueue_chain(chain);
                }
            }
            if mode == crate::FuzzMode::Guided {
                if let (Some(idx), Some(report)) = (idx, report) {
                    for chain in guided::chains(trace, idx, report) {
                        self.enqueue_chain(chain);
                    }
                }
            }
        }
    }

    fn materialize(&mut self, trace: &Trace, m: Mutation) -> Result<RunInput> {
        Ok(match m {
            Mutation::Chain { chain, file_number } => {
                let dir = writer::write_chain_mutation(
                    &self.cfg.out_dir,
                    file_number,
                    trace,
                    &chain,
                )?;
                self.chain_files.insert(file_number, chain);
                RunInput::Trace { dir }
            }
            Mutation::Select { choices } => {
                let path =
                    self.cfg.out_dir.join(format!("fuzzSelect_{}.log", self.runs));
                writer::write_select_file(&path, &choices)?;
                RunInput::Bias { select_file: Some(path), flow_file: None }
            }
            Mutation::Flow { ceilings } => {
                let path =
                    self.cfg.out_dir.join(format!("fuzzFlow_{}.log", self.runs));
                writer::write_flow_file(&path, &ceilings)?;
                RunInput::Bias { select_file: None, flow_file: Some(path) }
            }
        })
    }
}

#[cfg(test)]
mod test;
