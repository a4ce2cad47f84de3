use std::fmt;
use thiserror::Error;

/// Pipeline phase, used to tag user-visible failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Phase {
    Parse,
    Index,
    Graph,
    Dominator,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Parse => "parse",
            Phase::Index => "index",
            Phase::Graph => "graph",
            Phase::Dominator => "dominator",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum HprofError {
    /// Structural violation in the dump. Fatal for the current operation;
    /// a partially built index is discarded by the caller.
    #[error("{phase}: corrupted dump at offset {offset}: {detail}")]
    DumpCorrupted {
        phase: Phase,
        offset: u64,
        detail: String,
    },

    /// The stream ended in the middle of a record.
    #[error("parse: truncated {kind} record at offset {offset}")]
    Truncated { kind: &'static str, offset: u64 },

    /// Top-level tag outside the known set. Recoverable: the record is
    /// skipped via its length prefix.
    #[error("parse: unknown record tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: u64 },

    /// A field / array element type byte outside the HPROF basic type set.
    #[error("parse: invalid value type {code:#04x} at offset {offset}")]
    InvalidValueType { code: u8, offset: u64 },

    /// A stored value does not decode to the shape its key promises.
    #[error("index: entry {key} does not match its expected shape")]
    IndexInconsistency { key: String },

    /// A reference target that resolves to nothing. Recoverable: the edge
    /// is dropped.
    #[error("graph: missing referent {id:#x}")]
    MissingReferent { id: u64 },

    #[error("wrong record kind at offset {offset}: expected {expected}, found tag {found:#04x}")]
    WrongRecordKind {
        offset: u64,
        expected: &'static str,
        found: u8,
    },

    #[error("i/o error")]
    Io(#[from] std::io::Error),

    #[error("index storage error")]
    Storage(#[from] sled::Error),
}

impl HprofError {
    /// Process exit code per the CLI contract: 1 parse, 2 i/o, 3 index.
    pub fn exit_code(&self) -> i32 {
        match self {
            HprofError::Io(_) => 2,
            HprofError::Storage(_) | HprofError::IndexInconsistency { .. } => 3,
            _ => 1,
        }
    }

    pub(crate) fn truncated(kind: &'static str, offset: u64) -> HprofError {
        HprofError::Truncated { kind, offset }
    }
}

pub type Result<T> = std::result::Result<T, HprofError>;
