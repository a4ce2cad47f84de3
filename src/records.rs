//! Top-level HPROF records: UTF-8 names, class loads, stack frames and
//! traces, thread starts, and the tag table for everything else.

use crate::heap_dump::GcRootKind;
use crate::parse::{IdSizeParserWrapper, ParsingIterator};
use crate::{Id, IdSize, ParseResult, Serial, StatelessParserWithId};
use getset::CopyGetters;
use nom::number::complete as number;
use std::cmp::Ordering;
use std::{cmp, fmt};

/// Tag byte of a top-level record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RecordTag {
    Utf8,
    LoadClass,
    UnloadClass,
    StackFrame,
    StackTrace,
    AllocSites,
    HeapSummary,
    StartThread,
    EndThread,
    HeapDump,
    CpuSamples,
    ControlSettings,
    HeapDumpSegment,
    HeapDumpEnd,
}

impl RecordTag {
    pub fn from_byte(tag: u8) -> Option<RecordTag> {
        match tag {
            0x01 => Some(RecordTag::Utf8),
            0x02 => Some(RecordTag::LoadClass),
            0x03 => Some(RecordTag::UnloadClass),
            0x04 => Some(RecordTag::StackFrame),
            0x05 => Some(RecordTag::StackTrace),
            0x06 => Some(RecordTag::AllocSites),
            0x07 => Some(RecordTag::HeapSummary),
            0x0A => Some(RecordTag::StartThread),
            0x0B => Some(RecordTag::EndThread),
            0x0C => Some(RecordTag::HeapDump),
            0x0D => Some(RecordTag::CpuSamples),
            0x0E => Some(RecordTag::ControlSettings),
            0x1C => Some(RecordTag::HeapDumpSegment),
            0x2C => Some(RecordTag::HeapDumpEnd),
            _ => None,
        }
    }

    pub fn tag_byte(&self) -> u8 {
        match self {
            RecordTag::Utf8 => 0x01,
            RecordTag::LoadClass => 0x02,
            RecordTag::UnloadClass => 0x03,
            RecordTag::StackFrame => 0x04,
            RecordTag::StackTrace => 0x05,
            RecordTag::AllocSites => 0x06,
            RecordTag::HeapSummary => 0x07,
            RecordTag::StartThread => 0x0A,
            RecordTag::EndThread => 0x0B,
            RecordTag::HeapDump => 0x0C,
            RecordTag::CpuSamples => 0x0D,
            RecordTag::ControlSettings => 0x0E,
            RecordTag::HeapDumpSegment => 0x1C,
            RecordTag::HeapDumpEnd => 0x2C,
        }
    }

    /// Tags that carry nothing the index wants; their payload is skipped
    /// via the length prefix.
    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            RecordTag::UnloadClass
                | RecordTag::AllocSites
                | RecordTag::HeapSummary
                | RecordTag::EndThread
                | RecordTag::CpuSamples
                | RecordTag::ControlSettings
        )
    }
}

impl cmp::Ord for RecordTag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tag_byte().cmp(&other.tag_byte())
    }
}

impl cmp::PartialOrd for RecordTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Kind selector for random access re-parses ([`crate::reader::HeapDumpFile::parse_at`]).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecordKind {
    Utf8,
    LoadClass,
    StackFrame,
    StackTrace,
    StartThread,
    Class,
    Instance,
    ObjectArray,
    PrimitiveArray,
    GcRoot(GcRootKind),
}

impl RecordKind {
    pub fn name(&self) -> &'static str {
        match self {
            RecordKind::Utf8 => "utf8",
            RecordKind::LoadClass => "load-class",
            RecordKind::StackFrame => "stack-frame",
            RecordKind::StackTrace => "stack-trace",
            RecordKind::StartThread => "start-thread",
            RecordKind::Class => "class-dump",
            RecordKind::Instance => "instance-dump",
            RecordKind::ObjectArray => "object-array-dump",
            RecordKind::PrimitiveArray => "primitive-array-dump",
            RecordKind::GcRoot(_) => "gc-root",
        }
    }
}

/// A UTF-8 name record. In practice the bytes are not always valid UTF-8.
#[derive(CopyGetters, Copy, Clone)]
pub struct Utf8<'a> {
    pub(crate) pos: u64,
    pub(crate) len: u32,
    #[get_copy = "pub"]
    name_id: Id,
    #[get_copy = "pub"]
    text: &'a [u8],
}

impl<'a> Utf8<'a> {
    pub(crate) fn parse(input: &'a [u8], id_size: IdSize) -> ParseResult<'a, Utf8<'a>> {
        let (input, name_id) = Id::parse(input, id_size)?;

        Ok(Utf8 {
            pos: 0,
            len: 0,
            name_id,
            text: input,
        })
    }

    pub fn text_as_str(&self) -> Result<&'a str, std::str::Utf8Error> {
        std::str::from_utf8(self.text)
    }

    pub fn pos_and_len(&self) -> (u64, u32) {
        (self.pos, self.len)
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct LoadClass {
    pub(crate) pos: u64,
    pub(crate) len: u32,
    #[get_copy = "pub"]
    class_serial: Serial,
    #[get_copy = "pub"]
    class_obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    class_name_id: Id,
}

impl LoadClass {
    pub(crate) fn parse(input: &[u8], id_size: IdSize) -> ParseResult<LoadClass> {
        let (input, class_serial) = number::be_u32(input)?;
        let (input, class_obj_id) = Id::parse(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (_input, class_name_id) = Id::parse(input, id_size)?;

        Ok(LoadClass {
            pos: 0,
            len: 0,
            class_serial,
            class_obj_id,
            stack_trace_serial,
            class_name_id,
        })
    }

    pub fn pos_and_len(&self) -> (u64, u32) {
        (self.pos, self.len)
    }
}

#[derive(CopyGetters, Clone)]
pub struct StackFrame {
    pub(crate) pos: u64,
    pub(crate) len: u32,
    #[get_copy = "pub"]
    id: Id,
    #[get_copy = "pub"]
    method_name_id: Id,
    #[get_copy = "pub"]
    method_signature_id: Id,
    #[get_copy = "pub"]
    source_file_name_id: Id,
    #[get_copy = "pub"]
    class_serial: Serial,
    #[get_copy = "pub"]
    line_num: LineNum,
}

impl StackFrame {
    pub(crate) fn parse(input: &[u8], id_size: IdSize) -> ParseResult<StackFrame> {
        let (input, id) = Id::parse(input, id_size)?;
        let (input, method_name_id) = Id::parse(input, id_size)?;
        let (input, method_signature_id) = Id::parse(input, id_size)?;
        let (input, source_file_name_id) = Id::parse(input, id_size)?;
        let (input, class_serial) = number::be_u32(input)?;
        let (_input, line_num) = LineNum::parse(input)?;

        Ok(StackFrame {
            pos: 0,
            len: 0,
            id,
            method_name_id,
            method_signature_id,
            source_file_name_id,
            class_serial,
            line_num,
        })
    }

    pub fn pos_and_len(&self) -> (u64, u32) {
        (self.pos, self.len)
    }
}

#[derive(CopyGetters, Clone)]
pub struct StackTrace<'a> {
    pub(crate) pos: u64,
    pub(crate) len: u32,
    id_size: IdSize,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    thread_serial: Serial,
    num_frame_ids: u32,
    frame_ids: &'a [u8],
}

impl<'a> StackTrace<'a> {
    pub(crate) fn parse(input: &'a [u8], id_size: IdSize) -> ParseResult<'a, StackTrace<'a>> {
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, thread_serial) = number::be_u32(input)?;
        let (input, num_frame_ids) = number::be_u32(input)?;

        Ok(StackTrace {
            pos: 0,
            len: 0,
            id_size,
            stack_trace_serial,
            thread_serial,
            num_frame_ids,
            frame_ids: input,
        })
    }

    pub fn frame_ids(&self) -> Ids<'a> {
        Ids {
            iter: ParsingIterator::new_stateless_id_size(
                self.id_size,
                self.frame_ids,
                self.num_frame_ids,
            ),
        }
    }

    pub fn pos_and_len(&self) -> (u64, u32) {
        (self.pos, self.len)
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct StartThread {
    pub(crate) pos: u64,
    pub(crate) len: u32,
    #[get_copy = "pub"]
    thread_serial: Serial,
    #[get_copy = "pub"]
    thread_obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    thread_name_id: Id,
    #[get_copy = "pub"]
    thread_group_name_id: Id,
    #[get_copy = "pub"]
    thread_group_parent_name_id: Id,
}

impl StartThread {
    pub(crate) fn parse(input: &[u8], id_size: IdSize) -> ParseResult<StartThread> {
        let (input, thread_serial) = number::be_u32(input)?;
        let (input, thread_obj_id) = Id::parse(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, thread_name_id) = Id::parse(input, id_size)?;
        let (input, thread_group_name_id) = Id::parse(input, id_size)?;
        let (_input, thread_group_parent_name_id) = Id::parse(input, id_size)?;

        Ok(StartThread {
            pos: 0,
            len: 0,
            thread_serial,
            thread_obj_id,
            stack_trace_serial,
            thread_name_id,
            thread_group_name_id,
            thread_group_parent_name_id,
        })
    }

    pub fn pos_and_len(&self) -> (u64, u32) {
        (self.pos, self.len)
    }
}

/// Marker yielded when a heap dump frame starts or ends; carries no payload
/// of its own but keeps record positions contiguous for the caller.
#[derive(Copy, Clone, Debug)]
pub struct HeapDumpBoundary {
    pub(crate) pos: u64,
    pub(crate) len: u32,
    /// True for `HeapDump` / `HeapDumpSegment`, false for `HeapDumpEnd`.
    pub starts_frame: bool,
    /// Declared frame length; 0 means truncated-segment sentinel.
    pub declared_len: u32,
}

impl HeapDumpBoundary {
    pub fn pos_and_len(&self) -> (u64, u32) {
        (self.pos, self.len)
    }
}

/// Line number of a stack frame, with the sentinel encodings.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LineNum {
    Normal(u32),
    Unknown,
    CompiledMethod,
    NativeMethod,
}

impl LineNum {
    fn parse(input: &[u8]) -> nom::IResult<&[u8], Self> {
        let (input, num) = number::be_i32(input)?;

        Ok((
            input,
            match num {
                num if num > 0 => LineNum::Normal(num as u32),
                -2 => LineNum::CompiledMethod,
                -3 => LineNum::NativeMethod,
                _ => LineNum::Unknown,
            },
        ))
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            LineNum::Normal(n) => *n as i32,
            LineNum::Unknown => -1,
            LineNum::CompiledMethod => -2,
            LineNum::NativeMethod => -3,
        }
    }
}

impl fmt::Display for LineNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineNum::Normal(n) => write!(f, "{}", n),
            LineNum::Unknown => write!(f, "unknown"),
            LineNum::CompiledMethod => write!(f, "compiled"),
            LineNum::NativeMethod => write!(f, "native"),
        }
    }
}

/// Iterator over a run of ids (frame ids, array elements).
pub struct Ids<'a> {
    pub(crate) iter: ParsingIterator<'a, Id, IdSizeParserWrapper<Id>>,
}

impl<'a> Iterator for Ids<'a> {
    type Item = ParseResult<'a, Id>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}
