use super::*;
use crate::{writer::TRACE_FILE, FuzzConfig, FuzzMode, RunInput, RunOutcome, Runner};
use skein_trace::CancelFlag;
use std::collections::VecDeque;

const MUTEX_TRACE: &str = "M,1,2,4,-,L,t,a.go:1\nM,3,4,4,-,L,t,b.go:1";
const SELECT_TRACE: &str = "S,2,4,8,7.R.f.1.0~9.S.f.2.0~d,0,a.go:1";
const BUGGY_TRACE: &str =
    "G,1,2,a.go:1,C,2,3,7,S,f,1,0,0,a.go:2,C,3,4,7,C,f,0,0,0,a.go:3\nC,2,0,7,S,f,0,0,0,a.go:5";

struct Scripted {
    trace: &'static str,
    exits: VecDeque<i32>,
    inputs: Vec<RunInput>,
}

impl Scripted {
    fn new(trace: &'static str, exits: &[i32]) -> Self {
        Self { trace, exits: exits.iter().copied().collect(), inputs: Vec::new() }
    }
}

impl Runner for Scripted {
    async fn run(&mut self, input: RunInput) -> anyhow::Result<RunOutcome> {
        self.inputs.push(input);
        let exit = self.exits.pop_front().unwrap_or(0);
        Ok(RunOutcome { trace: self.trace.to_string(), exit, timed_out: false })
    }
}

fn ctx(mode: FuzzMode, dir: &std::path::Path, max_runs: u64) -> FuzzCtx {
    let cfg = FuzzConfig::builder(mode, dir.to_path_buf())
        .max_runs(max_runs)
        .seed(42)
        .energy(4)
        .build()
        .expect("config");
    FuzzCtx::new(cfg)
}

#[tokio::test(flavor = "current_thread")]
async fn chain_session_runs_to_budget() {
    let _ = env_logger::try_init();
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = Scripted::new(MUTEX_TRACE, &[]);
    let mut ctx = ctx(FuzzMode::GoPie, tmp.path(), 3);
    let out = ctx.run(&mut runner).await.unwrap();
    assert_eq!(out.runs, 3);
    assert_eq!(out.stop, StopReason::MaxRuns);
    assert_eq!(runner.inputs[0], RunInput::Record);
    for input in &runner.inputs[1..] {
        match input {
            RunInput::Trace { dir } => {
                let text = std::fs::read_to_string(dir.join(TRACE_FILE)).unwrap();
                assert!(skein_trace::parser::parse_trace(&text).is_ok());
            }
            other => panic!("expected a trace replay, got {other:?}"),
        }
    }
}

#[tokio::test(flavor = "current_thread")]
async fn replay_exit_code_finishes_on_bug() {
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = Scripted::new(MUTEX_TRACE, &[0, 35]);
    let cfg = FuzzConfig::builder(FuzzMode::GoPie, tmp.path().to_path_buf())
        .max_runs(10)
        .seed(7)
        .finish_on_bug(true)
        .build()
        .unwrap();
    let mut ctx = FuzzCtx::new(cfg);
    let out = ctx.run(&mut runner).await.unwrap();
    assert_eq!(out.stop, StopReason::BugFound);
    assert_eq!(out.runs, 2);
    assert!(out.bugs.iter().any(|b| b == "confirmed,35"));
}

#[tokio::test(flavor = "current_thread")]
async fn select_session_drains_the_queue() {
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = Scripted::new(SELECT_TRACE, &[]);
    let mut ctx = ctx(FuzzMode::GFuzz, tmp.path(), 50);
    let out = ctx.run(&mut runner).await.unwrap();
    // two alternatives, each tried once, then nothing new
    assert_eq!(out.stop, StopReason::QueueEmpty);
    assert_eq!(out.runs, 3);
    let biased: Vec<_> = runner
        .inputs
        .iter()
        .filter(|i| matches!(i, RunInput::Bias { select_file: Some(_), .. }))
        .collect();
    assert_eq!(biased.len(), 2);
    assert!(tmp.path().join("fuzzSelect_1.log").exists());
    assert!(tmp.path().join("fuzzSelect_2.log").exists());
}

#[tokio::test(flavor = "current_thread")]
async fn guided_session_reports_and_rewrites() {
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = Scripted::new(BUGGY_TRACE, &[]);
    let cfg = FuzzConfig::builder(FuzzMode::Guided, tmp.path().to_path_buf())
        .max_runs(4)
        .seed(3)
        .finish_on_bug(true)
        .build()
        .unwrap();
    let mut ctx = FuzzCtx::new(cfg);
    let out = ctx.run(&mut runner).await.unwrap();
    assert_eq!(out.stop, StopReason::BugFound);
    assert!(out.bugs.iter().any(|b| b.starts_with("P01")));
    let report =
        std::fs::read_to_string(tmp.path().join(crate::writer::REPORT_FILE)).unwrap();
    assert!(report.lines().any(|l| l.starts_with("P01")));
    assert!(!out.rewrites.is_empty());
    for dir in &out.rewrites {
        let text = std::fs::read_to_string(dir.join(TRACE_FILE)).unwrap();
        assert!(skein_trace::parser::parse_trace(&text).is_ok());
        assert!(dir.join(crate::writer::ACTIVE_FILE).exists());
    }
}

#[tokio::test(flavor = "current_thread")]
async fn cancellation_stops_before_running() {
    let tmp = tempfile::tempdir().unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let cfg = FuzzConfig::builder(FuzzMode::GoPie, tmp.path().to_path_buf())
        .cancel(cancel)
        .build()
        .unwrap();
    let mut ctx = FuzzCtx::new(cfg);
    let mut runner = Scripted::new(MUTEX_TRACE, &[]);
    let out = ctx.run(&mut runner).await.unwrap();
    assert_eq!(out.runs, 0);
    assert_eq!(out.stop, StopReason::Cancelled);
    assert!(runner.inputs.is_empty());
}
