//! Chunk object names.
//!
//! A chunk is stored as `{run}_{sequence}`, where `run` is the run start time
//! formatted as `YYYY_MM_DD_HH_MM_SS` and `sequence` is the zero-based chunk
//! index, zero-padded to six digits. Within one run, names sort by sequence
//! under plain string comparison, which is all a restore needs to recover
//! the original order from an unordered listing.
//!
//! A 10 TiB backup split into 100 MiB objects is ~105k chunks, well inside
//! six digits. Past 999,999 the field simply grows; string order then breaks
//! but [`ChunkName`]'s `Ord` (numeric on the sequence) stays correct, and
//! restore always sorts with it. Runs that must stay readable by plain string
//! sorting cap themselves at [`FIXED_WIDTH_CHUNKS`] via
//! `BackupConfig::max_chunks`.

use core::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDateTime, SubsecRound};

const RUN_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";
const SEQUENCE_WIDTH: usize = 6;

/// Chunks a run can hold before sequence numbers outgrow six digits and
/// names stop sorting as plain strings.
pub const FIXED_WIDTH_CHUNKS: u64 = 1_000_000;
const MANIFEST_SUFFIX: &str = "manifest";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not a chunk object name")]
pub struct InvalidName(String);

/// Identifies one backup run by its start time, at second precision.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(NaiveDateTime);

impl RunId {
    pub fn new(started: NaiveDateTime) -> Self {
        Self(started.trunc_subsecs(0))
    }

    /// The current local wall-clock time.
    pub fn now() -> Self {
        Self::new(Local::now().naive_local())
    }

}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(RUN_FORMAT))
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunId({self})")
    }
}

impl FromStr for RunId {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let started =
            NaiveDateTime::parse_from_str(s, RUN_FORMAT).map_err(|_| InvalidName(s.into()))?;
        let run = Self(started);
        // only the fixed-width spelling sorts correctly
        if run.to_string() != s {
            return Err(InvalidName(s.into()));
        }
        Ok(run)
    }
}

/// The position of a chunk within the total order of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkName {
    pub run: RunId,
    pub sequence: u64,
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{:0width$}",
            self.run,
            self.sequence,
            width = SEQUENCE_WIDTH
        )
    }
}

fn parse_sequence(s: &str) -> Option<u64> {
    let canonical = s.len() == SEQUENCE_WIDTH || (s.len() > SEQUENCE_WIDTH && !s.starts_with('0'));
    if !canonical || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl FromStr for ChunkName {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<ObjectName>()? {
            ObjectName::Chunk(name) => Ok(name),
            ObjectName::Manifest(_) => Err(InvalidName(s.into())),
        }
    }
}

/// Anything the pipeline may find in a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectName {
    Chunk(ChunkName),
    /// The completion marker, written last by a successful backup.
    Manifest(RunId),
}

impl ObjectName {
    pub fn run(&self) -> RunId {
        match self {
            Self::Chunk(name) => name.run,
            Self::Manifest(run) => *run,
        }
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunk(name) => fmt::Display::fmt(name, f),
            Self::Manifest(run) => write!(f, "{run}_{MANIFEST_SUFFIX}"),
        }
    }
}

impl FromStr for ObjectName {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (run, suffix) = s.rsplit_once('_').ok_or_else(|| InvalidName(s.into()))?;
        let run: RunId = run.parse().map_err(|_| InvalidName(s.into()))?;

        if suffix == MANIFEST_SUFFIX {
            return Ok(Self::Manifest(run));
        }
        let sequence = parse_sequence(suffix).ok_or_else(|| InvalidName(s.into()))?;
        Ok(Self::Chunk(ChunkName { run, sequence }))
    }
}

/// Hands out chunk names for one run, in input order.
///
/// Owned by the reading loop, which is the only place sequence numbers are
/// allocated.
#[derive(Debug)]
pub struct ChunkNamer {
    run: RunId,
    next_sequence: u64,
}

impl ChunkNamer {
    pub fn new(run: RunId) -> Self {
        Self {
            run,
            next_sequence: 0,
        }
    }

    pub fn next_name(&mut self) -> ChunkName {
        let name = ChunkName {
            run: self.run,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        name
    }

    /// How many names have been handed out so far.
    pub fn issued(&self) -> u64 {
        self.next_sequence
    }

    pub fn manifest(&self) -> ObjectName {
        ObjectName::Manifest(self.run)
    }
}
