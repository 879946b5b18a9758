//! Fuzz artifact emission: rewritten trace folders with their replay
//! active files, select bias files and flow ceiling files.
use crate::chain::Chain;
use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use log::debug;
use skein_analysis::rewrite::Rewrite;
use skein_trace::{event::EventKind, trace::Trace, Eid, Pos};
use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

pub const TRACE_FILE: &str = "trace.log";
pub const ACTIVE_FILE: &str = "replay_active.log";
pub const REPORT_FILE: &str = "report.log";

/// write the cumulative bug report, one line per bug
pub fn write_report(out_dir: &Path, lines: &[String]) -> Result<()> {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    let path = out_dir.join(REPORT_FILE);
    fs::write(&path, out).with_context(|| format!("writing {}", path.display()))
}

pub fn chain_dir(out: &Path, n: u64) -> PathBuf {
    out.join(format!("fuzzingTrace_{n}"))
}

/// Materialize a chain mutation: copy the trace, truncate at the
/// first chain element's completion, and re-append the chain elements
/// in their forced order with t-sort spacing 2. Returns the new
/// trace, the handles of the enforced events, and the time guided
/// replay engages.
pub fn build_chain_trace(trace: &Trace, chain: &Chain) -> Result<(Trace, Vec<Eid>, u64)> {
    let first = chain.first().ok_or_else(|| anyhow!("empty chain"))?;
    let cut = trace.event(first).end_time();
    let mut t = trace.copy(true);
    t.shorten_to_time(cut);
    let mut time = cut;
    let mut enforced = Vec::with_capacity(chain.len());
    for e in chain.elems() {
        let ev = trace.event(*e);
        let (routine, pos, mut kind) = (ev.routine, ev.pos.clone(), ev.kind.clone());
        // partner handles belong to the source trace, the copy pairs
        // its own ends on insertion
        match &mut kind {
            EventKind::Channel(c) => c.partner = None,
            EventKind::Select(s) => {
                for case in s.cases.iter_mut() {
                    case.chan.partner = None;
                }
            }
            _ => (),
        }
        // drop the original placement if the truncation kept it
        if t.routine(routine).map(|s| s.contains(e)).unwrap_or(false) {
            t.remove(*e);
        }
        time += 2;
        let new = t.insert(routine, time, time + 1, pos, kind)?;
        if let Some(case) = chain.choice(*e) {
            let case = usize::try_from(case).ok();
            t.set_chosen_case(new, case)?;
        }
        enforced.push(new);
    }
    t.sort();
    Ok((t, enforced, cut))
}

fn active_file(trace: &Trace, enforced: &[Eid], start_time: u64) -> String {
    let mut out = format!("{start_time}\n");
    for eid in enforced {
        let ev = trace.event(*eid);
        let _ = writeln!(
            out,
            "{}:{},{},{}",
            ev.routine,
            ev.pos,
            ev.tsort(),
            trace.occurrence(*eid)
        );
    }
    out
}

/// write `fuzzingTrace_<n>/` for a chain mutation
pub fn write_chain_mutation(
    out_dir: &Path,
    n: u64,
    trace: &Trace,
    chain: &Chain,
) -> Result<PathBuf> {
    let (t, enforced, cut) = build_chain_trace(trace, chain)?;
    let dir = chain_dir(out_dir, n);
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating trace folder {}", dir.display()))?;
    fs::write(dir.join(TRACE_FILE), t.to_string())?;
    fs::write(dir.join(ACTIVE_FILE), active_file(&t, &enforced, cut))?;
    debug!("chain mutation {n} written to {}", dir.display());
    Ok(dir)
}

/// write `fuzzingTrace_<n>/` for a predicted bug rewrite
pub fn write_rewrite(out_dir: &Path, n: u64, rw: &Rewrite) -> Result<PathBuf> {
    let dir = chain_dir(out_dir, n);
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating trace folder {}", dir.display()))?;
    fs::write(dir.join(TRACE_FILE), rw.trace.to_string())?;
    let enforced: Vec<Eid> = rw.enforce.iter().map(|r| r.eid).collect();
    fs::write(
        dir.join(ACTIVE_FILE),
        active_file(&rw.trace, &enforced, rw.start_time),
    )?;
    Ok(dir)
}

pub fn write_select_file(path: &Path, choices: &IndexMap<Pos, Vec<i32>>) -> Result<()> {
    let mut out = String::new();
    for (pos, cases) in choices {
        let _ = write!(out, "{pos};");
        for (i, c) in cases.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{c}");
        }
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("writing {}", path.display()))
}

pub fn write_flow_file(path: &Path, ceilings: &IndexMap<Pos, u64>) -> Result<()> {
    let mut out = String::new();
    for (pos, n) in ceilings {
        let _ = writeln!(out, "{pos};{n}");
    }
    fs::write(path, out).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::Chain;
    use skein_trace::{parser::parse_trace, CancelFlag, RoutineId};

    fn analyzed(s: &str) -> Trace {
        let mut t = parse_trace(s).unwrap();
        skein_analysis::hb::annotate(
            &mut t,
            enumflags2::BitFlags::empty(),
            &CancelFlag::new(),
        )
        .unwrap();
        t
    }

    #[test]
    fn chain_trace_is_truncated_and_spaced() {
        let t = analyzed(
            "M,1,2,4,-,L,t,a.go:1,M,9,10,4,-,U,t,a.go:2\nM,3,4,4,-,L,t,b.go:1",
        );
        let a = t.routine(RoutineId(1)).unwrap()[0];
        let b = t.routine(RoutineId(2)).unwrap()[0];
        let chain = Chain::pair(&t, a, b).unwrap();
        let (out, enforced, cut) = build_chain_trace(&t, &chain).unwrap();
        assert_eq!(cut, 2);
        // the unlock at t=9 started after the cut and is gone
        assert_eq!(out.routine(RoutineId(1)).unwrap().len(), 1);
        assert_eq!(enforced.len(), 2);
        let t1 = out.event(enforced[0]).tpost;
        let t2 = out.event(enforced[1]).tpost;
        assert_eq!(t2 - t1, 2);
        assert_eq!(out.event(enforced[0]).tpre, cut + 2);
    }

    #[test]
    fn artifacts_land_in_the_trace_folder() {
        let t = analyzed("M,1,2,4,-,L,t,a.go:1\nM,3,4,4,-,L,t,b.go:1");
        let a = t.routine(RoutineId(1)).unwrap()[0];
        let b = t.routine(RoutineId(2)).unwrap()[0];
        let chain = Chain::pair(&t, a, b).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_chain_mutation(tmp.path(), 3, &t, &chain).unwrap();
        assert_eq!(dir, tmp.path().join("fuzzingTrace_3"));
        let trace_text = std::fs::read_to_string(dir.join(TRACE_FILE)).unwrap();
        assert!(parse_trace(&trace_text).is_ok());
        let active = std::fs::read_to_string(dir.join(ACTIVE_FILE)).unwrap();
        let mut lines = active.lines();
        // guided replay engages at the truncation time
        assert_eq!(lines.next(), Some("2"));
        let first = lines.next().unwrap();
        assert!(first.starts_with("1:a.go:1,"));
        assert!(first.ends_with(",1"));
    }

    #[test]
    fn select_and_flow_files_round_trip_by_eye() {
        let tmp = tempfile::tempdir().unwrap();
        let mut choices = IndexMap::new();
        choices.insert("a.go:3".parse::<Pos>().unwrap(), vec![1, -1]);
        let sp = tmp.path().join("select.log");
        write_select_file(&sp, &choices).unwrap();
        assert_eq!(std::fs::read_to_string(&sp).unwrap(), "a.go:3;1,-1\n");
        let mut ceilings = IndexMap::new();
        ceilings.insert("a.go:9".parse::<Pos>().unwrap(), 4u64);
        let fp = tmp.path().join("flow.log");
        write_flow_file(&fp, &ceilings).unwrap();
        assert_eq!(std::fs::read_to_string(&fp).unwrap(), "a.go:9;4\n");
    }
}
