//! Post-mortem analyzer for JVM heap snapshots in the HPROF binary format.
//!
//! The pipeline: [`reader::HeapDumpFile`] decodes the dump,
//! [`indexer::build_index`] writes a persistent [`index::Index`] and resolves
//! every object's outgoing references, [`graph::HeapGraph`] materializes the
//! reachability graph under a synthetic super-root, and
//! [`dominator::DominatorTree`] turns that into per-object retained sizes.
//! [`snapshot::Snapshot`] ties the pieces together behind the query surface.

use getset::CopyGetters;
use nom::number::complete as number;
use std::fmt;
use std::fmt::Formatter;

pub mod context;
pub mod dominator;
pub mod error;
pub mod graph;
pub mod heap_dump;
pub mod index;
pub mod indexer;
pub mod reader;
pub mod records;
pub mod resolve;
pub mod snapshot;
pub mod web;

mod counter;
mod parse;

pub use error::HprofError;
pub use parse::{Parser, StatelessParserWithId};

/// An object / class / name identifier from the dump.
///
/// 4-byte ids are inflated to 8 bytes on read so everything downstream is
/// width-agnostic. `0` is the null id.
#[derive(CopyGetters, Copy, Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Id {
    #[get_copy = "pub"]
    id: u64,
}

impl Id {
    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

impl From<u64> for Id {
    fn from(id: u64) -> Self {
        Id { id }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::UpperHex for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.id, f)
    }
}

impl StatelessParserWithId for Id {
    fn parse(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], Self> {
        let (input, id) = match id_size {
            IdSize::U32 => number::be_u32(input).map(|(i, id)| (i, id as u64))?,
            IdSize::U64 => number::be_u64(input)?,
        };

        Ok((input, Id { id }))
    }
}

/// Serial numbers (class serials, stack trace serials, thread serials).
pub type Serial = u32;

/// Identifier width declared in the dump header.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IdSize {
    U32,
    U64,
}

impl IdSize {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            IdSize::U32 => 4,
            IdSize::U64 => 8,
        }
    }

    pub fn from_header_num(num: u32) -> Option<IdSize> {
        match num {
            4 => Some(IdSize::U32),
            8 => Some(IdSize::U64),
            _ => None,
        }
    }
}

pub(crate) type ParseResult<'a, T> = Result<T, nom::Err<nom::error::Error<&'a [u8]>>>;
