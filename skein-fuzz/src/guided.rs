//! HB guided mutations: around every predicted bug site, enumerate
//! chains that flip one concurrent pair feeding the site.
use crate::chain::{eligible, Chain};
use skein_analysis::{
    conc::{ConcIndex, ConcOpts},
    predict::Report,
};
use skein_trace::{trace::Trace, Eid};

pub fn chains(trace: &Trace, idx: &ConcIndex, report: &Report) -> Vec<Chain> {
    let mut out = Vec::new();
    let mut sites: Vec<Eid> = Vec::new();
    for bug in report.bugs() {
        for r in bug.group1.iter().chain(bug.group2.iter()) {
            if !sites.contains(&r.eid) {
                sites.push(r.eid);
            }
        }
    }
    for site in sites {
        if !eligible(&trace.event(site).kind, true) {
            continue;
        }
        let peers = idx.concurrent(trace, site, ConcOpts::all());
        for p in peers {
            if !eligible(&trace.event(p).kind, true) {
                continue;
            }
            // only pairs the recording ran the other way around are
            // worth flipping
            if trace.event(p).tsort() >= trace.event(site).tsort() {
                continue;
            }
            if let Some(c) = Chain::pair(trace, site, p) {
                if c.is_valid(trace) {
                    out.push(c);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use enumflags2::BitFlags;
    use skein_analysis::{analyze, AnalyzerFlag};
    use skein_trace::{parser::parse_trace, CancelFlag};

    #[test]
    fn flips_a_pair_before_the_site() {
        let mut t = parse_trace(
            "G,1,2,a.go:1,C,2,3,7,S,f,1,0,0,a.go:2,C,3,4,7,C,f,0,0,0,a.go:3\nC,2,0,7,S,f,0,0,0,a.go:5",
        )
        .unwrap();
        let (idx, report) = analyze(
            &mut t,
            BitFlags::from(AnalyzerFlag::WeakClocks),
            &CancelFlag::new(),
        )
        .unwrap();
        let cs = chains(&t, &idx, &report);
        assert!(!cs.is_empty());
        for c in cs {
            assert_eq!(c.len(), 2);
            assert!(c.is_valid(&t));
        }
    }
}
