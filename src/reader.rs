//! Byte-precise decoder for the HPROF stream.
//!
//! The dump file is memory-mapped; records parse lazily out of the mapping,
//! so a record is just a couple of ids plus a borrowed payload slice. Every
//! record knows its `(file offset, byte length)` and can be re-parsed at any
//! time through [`HeapDumpFile::parse_at`].

use crate::error::{HprofError, Phase, Result};
use crate::heap_dump::{GcRoot, GcRootKind, SubRecord};
use crate::records::{
    HeapDumpBoundary, LoadClass, RecordKind, RecordTag, StackFrame, StackTrace, StartThread, Utf8,
};
use crate::{heap_dump, records, IdSize};
use getset::CopyGetters;
use log::warn;
use nom::bytes::complete as bytes;
use nom::number::complete as number;
use std::collections::HashMap;
use std::path::Path;
use std::{fmt, fs};

/// Heap dump frame budget sentinel for a truncated trailing segment
/// (declared length 0): read until end of file.
const UNBOUNDED: u64 = u64::MAX;

/// Dump header: magic label, identifier width, capture timestamp.
#[derive(CopyGetters, Clone)]
pub struct Header {
    label: String,
    #[get_copy = "pub"]
    id_size: IdSize,
    /// Millis since epoch at capture time.
    #[get_copy = "pub"]
    timestamp_millis: u64,
    #[get_copy = "pub"]
    records_start: u64,
}

impl Header {
    pub fn label(&self) -> &str {
        &self.label
    }

    fn parse(input: &[u8]) -> Result<Header> {
        let full_len = input.len();

        let (input, label) = bytes::take_until::<_, _, nom::error::Error<&[u8]>>(&b"\0"[..])(input)
            .map_err(|_| HprofError::truncated("header", 0))?;
        let (input, _) = bytes::take::<_, _, nom::error::Error<&[u8]>>(1_usize)(input)
            .map_err(|_| HprofError::truncated("header", label.len() as u64))?;

        let (input, id_size_num) = number::be_u32::<_, nom::error::Error<&[u8]>>(input)
            .map_err(|_| HprofError::truncated("header", label.len() as u64 + 1))?;
        let (input, epoch_hi) = number::be_u32::<_, nom::error::Error<&[u8]>>(input)
            .map_err(|_| HprofError::truncated("header", label.len() as u64 + 5))?;
        let (input, epoch_lo) = number::be_u32::<_, nom::error::Error<&[u8]>>(input)
            .map_err(|_| HprofError::truncated("header", label.len() as u64 + 9))?;

        let id_size = IdSize::from_header_num(id_size_num).ok_or(HprofError::InvalidValueType {
            code: id_size_num as u8,
            offset: label.len() as u64 + 1,
        })?;

        Ok(Header {
            label: String::from_utf8_lossy(label).into_owned(),
            id_size,
            timestamp_millis: ((epoch_hi as u64) << 32) + epoch_lo as u64,
            records_start: (full_len - input.len()) as u64,
        })
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("label", &self.label)
            .field("id_size", &self.id_size)
            .field("timestamp_millis", &self.timestamp_millis)
            .finish()
    }
}

/// An open, memory-mapped heap dump.
pub struct HeapDumpFile {
    // the mapping borrows the file; keep both alive together
    _file: fs::File,
    map: memmap::Mmap,
    header: Header,
}

impl HeapDumpFile {
    pub fn open(path: &Path) -> Result<HeapDumpFile> {
        let file = fs::File::open(path)?;
        let map = unsafe { memmap::MmapOptions::new().map(&file) }?;
        let header = Header::parse(&map[..])?;

        Ok(HeapDumpFile {
            _file: file,
            map,
            header,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn id_size(&self) -> IdSize {
        self.header.id_size
    }

    /// The raw mapped bytes; `record_bytes` of a parsed record re-read from
    /// here are bit-identical to the original parse input.
    pub fn data(&self) -> &[u8] {
        &self.map[..]
    }

    pub fn record_bytes(&self, offset: u64, len: u32) -> Result<&[u8]> {
        let start = offset as usize;
        let end = start + len as usize;
        if end > self.map.len() {
            return Err(HprofError::truncated("record", offset));
        }
        Ok(&self.map[start..end])
    }

    /// Stream all records in file order.
    pub fn records(&self) -> Records<'_> {
        Records {
            data: &self.map[..],
            pos: self.header.records_start as usize,
            id_size: self.header.id_size,
            frame_remaining: None,
            done: false,
            unknown_tags: HashMap::new(),
        }
    }

    /// Re-parse a single record of a known kind at a stored offset.
    ///
    /// Top-level records are addressed at their tag byte, heap dump
    /// sub-records at their sub-tag byte.
    pub fn parse_at(&self, offset: u64, kind: RecordKind) -> Result<Record<'_>> {
        let data = &self.map[..];
        let start = offset as usize;
        if start >= data.len() {
            return Err(HprofError::truncated(kind.name(), offset));
        }
        let id_size = self.header.id_size;

        match kind {
            RecordKind::Utf8
            | RecordKind::LoadClass
            | RecordKind::StackFrame
            | RecordKind::StackTrace
            | RecordKind::StartThread => {
                let expected_tag = match kind {
                    RecordKind::Utf8 => RecordTag::Utf8,
                    RecordKind::LoadClass => RecordTag::LoadClass,
                    RecordKind::StackFrame => RecordTag::StackFrame,
                    RecordKind::StackTrace => RecordTag::StackTrace,
                    RecordKind::StartThread => RecordTag::StartThread,
                    _ => unreachable!(),
                };
                let found = data[start];
                if found != expected_tag.tag_byte() {
                    return Err(HprofError::WrongRecordKind {
                        offset,
                        expected: kind.name(),
                        found,
                    });
                }
                if start + 9 > data.len() {
                    return Err(HprofError::truncated(kind.name(), offset));
                }
                let len = u32::from_be_bytes([
                    data[start + 5],
                    data[start + 6],
                    data[start + 7],
                    data[start + 8],
                ]) as usize;
                let body_start = start + 9;
                if body_start + len > data.len() {
                    return Err(HprofError::truncated(kind.name(), offset));
                }
                let body = &data[body_start..body_start + len];
                let total = 9 + len as u32;

                let record = match kind {
                    RecordKind::Utf8 => {
                        let mut r = Utf8::parse(body, id_size)
                            .map_err(|_| HprofError::truncated(kind.name(), offset))?;
                        r.pos = offset;
                        r.len = total;
                        Record::Utf8(r)
                    }
                    RecordKind::LoadClass => {
                        let mut r = LoadClass::parse(body, id_size)
                            .map_err(|_| HprofError::truncated(kind.name(), offset))?;
                        r.pos = offset;
                        r.len = total;
                        Record::LoadClass(r)
                    }
                    RecordKind::StackFrame => {
                        let mut r = StackFrame::parse(body, id_size)
                            .map_err(|_| HprofError::truncated(kind.name(), offset))?;
                        r.pos = offset;
                        r.len = total;
                        Record::StackFrame(r)
                    }
                    RecordKind::StackTrace => {
                        let mut r = StackTrace::parse(body, id_size)
                            .map_err(|_| HprofError::truncated(kind.name(), offset))?;
                        r.pos = offset;
                        r.len = total;
                        Record::StackTrace(r)
                    }
                    RecordKind::StartThread => {
                        let mut r = StartThread::parse(body, id_size)
                            .map_err(|_| HprofError::truncated(kind.name(), offset))?;
                        r.pos = offset;
                        r.len = total;
                        Record::StartThread(r)
                    }
                    _ => unreachable!(),
                };
                Ok(record)
            }
            RecordKind::Class
            | RecordKind::Instance
            | RecordKind::ObjectArray
            | RecordKind::PrimitiveArray
            | RecordKind::GcRoot(_) => {
                let slice = &data[start..];
                let (rest, mut sub) = SubRecord::parse(slice, id_size)
                    .map_err(|e| sub_record_error(e, slice, offset))?;
                let consumed = (slice.len() - rest.len()) as u32;
                sub.set_pos_and_len(offset, consumed);

                let matches = match (&sub, kind) {
                    (SubRecord::Class(_), RecordKind::Class) => true,
                    (SubRecord::Instance(_), RecordKind::Instance) => true,
                    (SubRecord::ObjectArray(_), RecordKind::ObjectArray) => true,
                    (SubRecord::PrimitiveArray(_), RecordKind::PrimitiveArray) => true,
                    (SubRecord::GcRoot(root), RecordKind::GcRoot(k)) => root.kind() == k,
                    _ => false,
                };
                if !matches {
                    return Err(HprofError::WrongRecordKind {
                        offset,
                        expected: kind.name(),
                        found: data[start],
                    });
                }

                Ok(match sub {
                    SubRecord::Class(r) => Record::Class(r),
                    SubRecord::Instance(r) => Record::Instance(r),
                    SubRecord::ObjectArray(r) => Record::ObjectArray(r),
                    SubRecord::PrimitiveArray(r) => Record::PrimitiveArray(r),
                    SubRecord::GcRoot(r) => Record::GcRoot(r),
                })
            }
        }
    }
}

fn sub_record_error(
    e: nom::Err<nom::error::Error<&[u8]>>,
    slice: &[u8],
    base: u64,
) -> HprofError {
    match e {
        nom::Err::Failure(inner) => HprofError::DumpCorrupted {
            phase: Phase::Parse,
            offset: base + (slice.len() - inner.input.len()) as u64,
            detail: "unknown sub-tag or invalid value type".to_owned(),
        },
        nom::Err::Error(inner) => {
            HprofError::truncated("heap-dump-sub-record", base + (slice.len() - inner.input.len()) as u64)
        }
        nom::Err::Incomplete(_) => HprofError::truncated("heap-dump-sub-record", base),
    }
}

/// The closed record union of the stream. Every variant carries its
/// `(file offset, byte length)`.
pub enum Record<'a> {
    Utf8(records::Utf8<'a>),
    LoadClass(records::LoadClass),
    StackFrame(records::StackFrame),
    StackTrace(records::StackTrace<'a>),
    StartThread(records::StartThread),
    HeapDumpBoundary(HeapDumpBoundary),
    Class(heap_dump::Class),
    Instance(heap_dump::Instance<'a>),
    ObjectArray(heap_dump::ObjectArray<'a>),
    PrimitiveArray(heap_dump::PrimitiveArray<'a>),
    GcRoot(GcRoot),
}

impl<'a> Record<'a> {
    pub fn pos_and_len(&self) -> (u64, u32) {
        match self {
            Record::Utf8(r) => r.pos_and_len(),
            Record::LoadClass(r) => r.pos_and_len(),
            Record::StackFrame(r) => r.pos_and_len(),
            Record::StackTrace(r) => r.pos_and_len(),
            Record::StartThread(r) => r.pos_and_len(),
            Record::HeapDumpBoundary(r) => r.pos_and_len(),
            Record::Class(r) => r.pos_and_len(),
            Record::Instance(r) => r.pos_and_len(),
            Record::ObjectArray(r) => r.pos_and_len(),
            Record::PrimitiveArray(r) => r.pos_and_len(),
            Record::GcRoot(r) => r.pos_and_len(),
        }
    }

    pub fn tag_name(&self) -> &'static str {
        match self {
            Record::Utf8(_) => "utf8",
            Record::LoadClass(_) => "load-class",
            Record::StackFrame(_) => "stack-frame",
            Record::StackTrace(_) => "stack-trace",
            Record::StartThread(_) => "start-thread",
            Record::HeapDumpBoundary(_) => "heap-dump-boundary",
            Record::Class(_) => "class-dump",
            Record::Instance(_) => "instance-dump",
            Record::ObjectArray(_) => "object-array-dump",
            Record::PrimitiveArray(_) => "primitive-array-dump",
            Record::GcRoot(_) => "gc-root",
        }
    }
}

/// Streaming iterator over all records, heap dump frames unrolled inline.
///
/// Recoverable conditions (unknown top-level tags, tags with nothing to
/// index) are skipped internally; a yielded `Err` is fatal and ends the
/// stream.
pub struct Records<'a> {
    data: &'a [u8],
    pos: usize,
    id_size: IdSize,
    /// Budget of the enclosing heap dump frame; `UNBOUNDED` for a
    /// truncated trailing segment.
    frame_remaining: Option<u64>,
    done: bool,
    unknown_tags: HashMap<u8, u64>,
}

impl<'a> Records<'a> {
    /// Unknown top-level tags seen so far, with occurrence counts.
    pub fn unknown_tag_counts(&self) -> &HashMap<u8, u64> {
        &self.unknown_tags
    }

    fn next_sub_record(&mut self, remaining: u64) -> Option<Result<Record<'a>>> {
        let data = self.data;
        let start = self.pos;
        let limit = if remaining == UNBOUNDED {
            data.len()
        } else {
            std::cmp::min(data.len(), start + remaining as usize)
        };
        let slice = &data[start..limit];

        match SubRecord::parse(slice, self.id_size) {
            Ok((rest, mut sub)) => {
                let consumed = slice.len() - rest.len();
                sub.set_pos_and_len(start as u64, consumed as u32);
                self.pos += consumed;
                if remaining != UNBOUNDED {
                    self.frame_remaining = Some(remaining - consumed as u64);
                }
                Some(Ok(match sub {
                    SubRecord::Class(r) => Record::Class(r),
                    SubRecord::Instance(r) => Record::Instance(r),
                    SubRecord::ObjectArray(r) => Record::ObjectArray(r),
                    SubRecord::PrimitiveArray(r) => Record::PrimitiveArray(r),
                    SubRecord::GcRoot(r) => Record::GcRoot(r),
                }))
            }
            Err(e) => {
                self.done = true;
                // a short read against a bounded frame is an overflowing
                // sub-record, not a truncated file
                let err = match (&e, remaining != UNBOUNDED && limit < data.len()) {
                    (nom::Err::Error(_), true) => HprofError::DumpCorrupted {
                        phase: Phase::Parse,
                        offset: start as u64,
                        detail: "sub-record overruns its heap dump frame".to_owned(),
                    },
                    _ => sub_record_error(e, slice, start as u64),
                };
                Some(Err(err))
            }
        }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let data = self.data;
            if self.done {
                return None;
            }

            if let Some(remaining) = self.frame_remaining {
                if remaining == 0 {
                    self.frame_remaining = None;
                    continue;
                }
                if self.pos >= data.len() {
                    if remaining == UNBOUNDED {
                        // truncated trailing segment consumed to EOF
                        return None;
                    }
                    self.done = true;
                    return Some(Err(HprofError::truncated(
                        "heap-dump-frame",
                        self.pos as u64,
                    )));
                }
                return self.next_sub_record(remaining);
            }

            if self.pos >= data.len() {
                return None;
            }

            let start = self.pos;
            if start + 9 > data.len() {
                self.done = true;
                return Some(Err(HprofError::truncated("record-header", start as u64)));
            }

            let tag_byte = data[start];
            let len = u32::from_be_bytes([
                data[start + 5],
                data[start + 6],
                data[start + 7],
                data[start + 8],
            ]);
            self.pos = start + 9;

            let tag = match RecordTag::from_byte(tag_byte) {
                Some(tag) => tag,
                None => {
                    let count = self.unknown_tags.entry(tag_byte).or_insert(0);
                    *count += 1;
                    if *count == 1 {
                        warn!(
                            "unknown record tag {:#04x} at offset {}, skipping by length {}",
                            tag_byte, start, len
                        );
                    }
                    if self.pos + len as usize > data.len() {
                        self.done = true;
                        return Some(Err(HprofError::truncated("record-body", start as u64)));
                    }
                    self.pos += len as usize;
                    continue;
                }
            };

            match tag {
                RecordTag::HeapDump | RecordTag::HeapDumpSegment => {
                    self.frame_remaining = Some(if len == 0 { UNBOUNDED } else { len as u64 });
                    return Some(Ok(Record::HeapDumpBoundary(HeapDumpBoundary {
                        pos: start as u64,
                        len: 9,
                        starts_frame: true,
                        declared_len: len,
                    })));
                }
                RecordTag::HeapDumpEnd => {
                    self.pos += len as usize;
                    return Some(Ok(Record::HeapDumpBoundary(HeapDumpBoundary {
                        pos: start as u64,
                        len: 9 + len,
                        starts_frame: false,
                        declared_len: len,
                    })));
                }
                _ => {}
            }

            if self.pos + len as usize > data.len() {
                self.done = true;
                return Some(Err(HprofError::truncated("record-body", start as u64)));
            }
            let body = &data[self.pos..self.pos + len as usize];
            self.pos += len as usize;
            let total = 9 + len;

            if tag.is_skipped() {
                continue;
            }

            let parsed: Result<Record<'a>> = match tag {
                RecordTag::Utf8 => Utf8::parse(body, self.id_size)
                    .map(|mut r| {
                        r.pos = start as u64;
                        r.len = total;
                        Record::Utf8(r)
                    })
                    .map_err(|_| HprofError::truncated("utf8", start as u64)),
                RecordTag::LoadClass => LoadClass::parse(body, self.id_size)
                    .map(|mut r| {
                        r.pos = start as u64;
                        r.len = total;
                        Record::LoadClass(r)
                    })
                    .map_err(|_| HprofError::truncated("load-class", start as u64)),
                RecordTag::StackFrame => StackFrame::parse(body, self.id_size)
                    .map(|mut r| {
                        r.pos = start as u64;
                        r.len = total;
                        Record::StackFrame(r)
                    })
                    .map_err(|_| HprofError::truncated("stack-frame", start as u64)),
                RecordTag::StackTrace => StackTrace::parse(body, self.id_size)
                    .map(|mut r| {
                        r.pos = start as u64;
                        r.len = total;
                        Record::StackTrace(r)
                    })
                    .map_err(|_| HprofError::truncated("stack-trace", start as u64)),
                RecordTag::StartThread => StartThread::parse(body, self.id_size)
                    .map(|mut r| {
                        r.pos = start as u64;
                        r.len = total;
                        Record::StartThread(r)
                    })
                    .map_err(|_| HprofError::truncated("start-thread", start as u64)),
                _ => unreachable!("skipped and boundary tags handled above"),
            };

            if parsed.is_err() {
                self.done = true;
            }
            return Some(parsed);
        }
    }
}
