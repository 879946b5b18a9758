//! Parser for the recorded trace format
//!
//! One line per routine, events comma separated, each event tagged by
//! a one letter kind. Integers parse strictly; any malformed event
//! rejects the whole load with a positioned error.
use crate::{
    event::{
        AtomicOp, ChannelEv, ChannelOp, CondOp, EventKind, MutexOp, PrimitiveKind,
        SelectCase, SelectEv, WgOp,
    },
    trace::Trace,
    ExitCode, OpId, Pos, PrimitiveId, RoutineId,
};
use anyhow::{anyhow, Context, Result};
use combine::{
    choice, eof, none_of, optional,
    parser::{char::digit, char::letter, combinator::recognize},
    sep_by, sep_by1, skip_many1,
    stream::position,
    token, unexpected_any, value, EasyParser, ParseError, Parser, Stream,
};
use compact_str::{format_compact, CompactString};
use smallvec::SmallVec;

#[cfg(test)]
mod test;

#[derive(Debug, Clone)]
pub(crate) struct RawEvent {
    pub tpre: u64,
    pub tpost: u64,
    pub pos: Pos,
    pub kind: EventKind,
}

fn uint<I>() -> impl Parser<I, Output = u64>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    recognize(skip_many1(digit())).then(|s: CompactString| match s.parse::<u64>() {
        Ok(v) => value(v).left(),
        Err(_) => unexpected_any("malformed integer").right(),
    })
}

fn int<I>() -> impl Parser<I, Output = i64>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    recognize((optional(token('-')), skip_many1(digit()))).then(|s: CompactString| {
        match s.parse::<i64>() {
            Ok(v) => value(v).left(),
            Err(_) => unexpected_any("malformed integer").right(),
        }
    })
}

fn flag<I>() -> impl Parser<I, Output = bool>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    choice((token('t').map(|_| true), token('f').map(|_| false)))
}

fn pos<I>() -> impl Parser<I, Output = Pos>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    recognize(skip_many1(none_of([',', '~', '\n']))).then(|s: String| {
        match s.parse::<Pos>() {
            Ok(p) => value(p).left(),
            Err(_) => unexpected_any("malformed position, expected file:line").right(),
        }
    })
}

fn op_letter<I, T>(f: fn(char) -> Result<T>) -> impl Parser<I, Output = T>
where
    T: Clone + 'static,
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    letter().then(move |c| match f(c) {
        Ok(t) => value(t).left(),
        Err(_) => unexpected_any("unknown op letter").right(),
    })
}

// a comma separated field after the leading tag
fn field<I, P>(p: P) -> impl Parser<I, Output = P::Output>
where
    P: Parser<I>,
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    token(',').with(p)
}

fn atomic<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (
        token('A'),
        field(uint()),
        field(uint()),
        field(op_letter(AtomicOp::from_letter)),
        field(pos()),
    )
        .map(|(_, t, id, op, pos)| RawEvent {
            tpre: t,
            tpost: t,
            pos,
            kind: EventKind::Atomic { prim: PrimitiveId(id), op },
        })
}

fn chan_fields<I>() -> impl Parser<I, Output = ChannelEv>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (
        uint(),
        field(op_letter(ChannelOp::from_letter)),
        field(flag()),
        field(uint()),
        field(uint()),
        field(uint()),
    )
        .map(|(id, op, closed, oid, qsize, qcount)| ChannelEv {
            prim: PrimitiveId(id),
            op,
            closed,
            oid: OpId(oid),
            qsize: qsize as u32,
            qcount: qcount as u32,
            partner: None,
        })
}

fn channel<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (token('C'), field(uint()), field(uint()), field(chan_fields()), field(pos())).map(
        |(_, tpre, tpost, chan, pos)| RawEvent {
            tpre,
            tpost,
            pos,
            kind: EventKind::Channel(chan),
        },
    )
}

#[derive(Debug, Clone)]
enum RawCase {
    Default { chosen: bool },
    Chan(ChannelEv),
}

// a select case: a dot separated channel quintuple, or the default
// marker (d not chosen, D chosen)
fn case<I>() -> impl Parser<I, Output = RawCase>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    choice((
        token('d').map(|_| RawCase::Default { chosen: false }),
        token('D').map(|_| RawCase::Default { chosen: true }),
        (
            uint(),
            token('.').with(op_letter(ChannelOp::from_letter)),
            token('.').with(flag()),
            token('.').with(uint()),
            token('.').with(uint()),
        )
            .map(|(id, op, closed, oid, qsize)| {
                RawCase::Chan(ChannelEv {
                    prim: PrimitiveId(id),
                    op,
                    closed,
                    oid: OpId(oid),
                    qsize: qsize as u32,
                    qcount: 0,
                    partner: None,
                })
            }),
    ))
}

fn select<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (
        token('S'),
        field(uint()),
        field(uint()),
        field(uint()),
        field(sep_by1::<Vec<RawCase>, _, _, _>(case(), token('~'))),
        field(int()),
        field(pos()),
    )
        .then(|(_, tpre, tpost, id, cases, chosen_index, pos)| {
            let mut out: SmallVec<[SelectCase; 4]> = SmallVec::new();
            let mut has_default = false;
            let mut default_chosen = false;
            for c in cases {
                match c {
                    RawCase::Default { chosen } => {
                        has_default = true;
                        default_chosen |= chosen;
                    }
                    RawCase::Chan(chan) => {
                        out.push(SelectCase { chan, tpost: 0, chosen: false })
                    }
                }
            }
            let chosen_index = chosen_index as i32;
            if default_chosen && chosen_index >= 0 {
                return unexpected_any("default marked chosen alongside a case").right();
            }
            value(RawEvent {
                tpre,
                tpost,
                pos,
                kind: EventKind::Select(SelectEv {
                    prim: PrimitiveId(id),
                    cases: out,
                    has_default,
                    chosen_index,
                }),
            })
            .left()
        })
}

fn mutex<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (
        token('M'),
        field(uint()),
        field(uint()),
        field(uint()),
        field(choice((token('t').map(|_| true), token('-').map(|_| false)))),
        field(op_letter(MutexOp::from_letter)),
        field(flag()),
        field(pos()),
    )
        .map(|(_, tpre, tpost, id, rw, op, suc, pos)| RawEvent {
            tpre,
            tpost,
            pos,
            kind: EventKind::Mutex { prim: PrimitiveId(id), rw, op, suc },
        })
}

fn waitgroup<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (
        token('W'),
        field(uint()),
        field(uint()),
        field(uint()),
        field(op_letter(WgOp::from_letter)),
        field(int()),
        field(int()),
        field(pos()),
    )
        .map(|(_, tpre, tpost, id, op, delta, val, pos)| RawEvent {
            tpre,
            tpost,
            pos,
            kind: EventKind::WaitGroup { prim: PrimitiveId(id), op, delta, val },
        })
}

fn cond<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (
        token('D'),
        field(uint()),
        field(uint()),
        field(uint()),
        field(op_letter(CondOp::from_letter)),
        field(pos()),
    )
        .map(|(_, tpre, tpost, id, op, pos)| RawEvent {
            tpre,
            tpost,
            pos,
            kind: EventKind::Cond { prim: PrimitiveId(id), op },
        })
}

fn once<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (
        token('O'),
        field(uint()),
        field(uint()),
        field(uint()),
        field(flag()),
        field(pos()),
    )
        .map(|(_, tpre, tpost, id, suc, pos)| RawEvent {
            tpre,
            tpost,
            pos,
            kind: EventKind::Once { prim: PrimitiveId(id), suc },
        })
}

fn fork<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (token('G'), field(uint()), field(uint()), field(pos())).map(|(_, t, id, pos)| {
        RawEvent {
            tpre: t,
            tpost: t,
            pos,
            kind: EventKind::Fork { routine: RoutineId(id as u32) },
        }
    })
}

fn newprim<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (
        token('N'),
        field(uint()),
        field(uint()),
        field((letter(), letter()).then(|(a, b)| {
            match PrimitiveKind::from_code(&format_compact!("{a}{b}")) {
                Ok(k) => value(k).left(),
                Err(_) => unexpected_any("unknown primitive kind").right(),
            }
        })),
        field(uint()),
        field(pos()),
    )
        .map(|(_, t, id, of, num, pos)| RawEvent {
            tpre: t,
            tpost: t,
            pos,
            kind: EventKind::New { prim: PrimitiveId(id), of, num },
        })
}

fn endr<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (token('E'), field(uint())).map(|(_, t)| RawEvent {
        tpre: t,
        tpost: t,
        pos: Pos::none(),
        kind: EventKind::End,
    })
}

fn replay<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (token('X'), field(uint()), field(int())).then(|(_, t, code)| {
        match i32::try_from(code).ok().and_then(|c| ExitCode::from_code(c).ok()) {
            Some(exit) => value(RawEvent {
                tpre: t,
                tpost: t,
                pos: Pos::none(),
                kind: EventKind::Replay { exit },
            })
            .left(),
            None => unexpected_any("unknown replay exit code").right(),
        }
    })
}

fn event<I>() -> impl Parser<I, Output = RawEvent>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    // the leading kind letters are disjoint, no backtracking needed
    choice((
        choice((atomic(), channel(), select(), mutex(), waitgroup(), cond())),
        choice((once(), fork(), newprim(), endr(), replay())),
    ))
}

fn line<I>() -> impl Parser<I, Output = Vec<RawEvent>>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    sep_by(event(), token(',')).skip(eof())
}

pub(crate) fn parse_line(s: &str) -> Result<Vec<RawEvent>> {
    line()
        .easy_parse(position::Stream::new(s))
        .map(|(r, _)| r)
        .map_err(|e| anyhow!(format!("{e}")))
}

/// Parse a whole trace file: line n holds the events of routine n.
/// Partners are resolved as events are inserted; the result is sorted
/// and ready to iterate.
pub fn parse_trace(s: &str) -> Result<Trace> {
    let mut trace = Trace::new();
    for (i, text) in s.lines().enumerate() {
        let routine = RoutineId(i as u32 + 1);
        trace.add_routine(routine);
        if text.trim().is_empty() {
            continue;
        }
        for raw in
            parse_line(text).with_context(|| format!("in trace line {}", i + 1))?
        {
            trace
                .insert(routine, raw.tpre, raw.tpost, raw.pos, raw.kind)
                .with_context(|| format!("in trace line {}", i + 1))?;
        }
    }
    trace.sort();
    Ok(trace)
}
