//! Mutation descriptors and the FIFO queue
use crate::chain::Chain;
use fxhash::FxHashSet;
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use skein_trace::Pos;
use std::{collections::VecDeque, fmt};

/// One instruction for the next run to diverge from the recorded
/// schedule
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// replay a truncated trace with the chain's order enforced
    Chain { chain: Chain, file_number: u64 },
    /// bias selects at the given positions onto specific cases, -1
    /// meaning the default
    Select { choices: IndexMap<Pos, Vec<i32>> },
    /// raise the traversal ceiling of the given positions
    Flow { ceilings: IndexMap<Pos, u64> },
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chain { chain, .. } => write!(f, "chain:{chain}"),
            Self::Select { choices } => {
                write!(f, "select:")?;
                for (i, (pos, cases)) in choices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ";")?;
                    }
                    write!(f, "{pos}=")?;
                    for (j, c) in cases.iter().enumerate() {
                        if j > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, "{c}")?;
                    }
                }
                Ok(())
            }
            Self::Flow { ceilings } => {
                write!(f, "flow:")?;
                for (i, (pos, n)) in ceilings.iter().enumerate() {
                    if i > 0 {
                        write!(f, ";")?;
                    }
                    write!(f, "{pos}={n}")?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for Mutation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// FIFO of pending mutations, deduplicated over the whole fuzzing
/// session by the textual form
#[derive(Debug, Default)]
pub struct MutationQueue {
    queue: VecDeque<Mutation>,
    seen: FxHashSet<String>,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// enqueue unless an identical mutation was ever enqueued before
    pub fn push(&mut self, m: Mutation) -> bool {
        if !self.seen.insert(m.to_string()) {
            return false;
        }
        self.queue.push_back(m);
        true
    }

    pub fn pop(&mut self) -> Option<Mutation> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
