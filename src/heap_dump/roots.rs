use crate::{Id, IdSize, Serial, StatelessParserWithId};
use getset::CopyGetters;
use nom::number::complete as number;
use std::fmt;

/// Kind of a GC root, keyed by its heap dump sub-tag byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum GcRootKind {
    /// 0xff; emitted by some dumpers for roots of unknown provenance.
    Unknown,
    JniGlobal,
    JniLocal,
    JavaFrame,
    /// Tolerated but never indexed.
    NativeStack,
    StickyClass,
    /// Tolerated but never indexed.
    ThreadBlock,
    MonitorUsed,
    ThreadObj,
}

impl GcRootKind {
    pub fn from_sub_tag(tag: u8) -> Option<GcRootKind> {
        match tag {
            0xff => Some(GcRootKind::Unknown),
            0x01 => Some(GcRootKind::JniGlobal),
            0x02 => Some(GcRootKind::JniLocal),
            0x03 => Some(GcRootKind::JavaFrame),
            0x04 => Some(GcRootKind::NativeStack),
            0x05 => Some(GcRootKind::StickyClass),
            0x06 => Some(GcRootKind::ThreadBlock),
            0x07 => Some(GcRootKind::MonitorUsed),
            0x08 => Some(GcRootKind::ThreadObj),
            _ => None,
        }
    }

    pub fn sub_tag(&self) -> u8 {
        match self {
            GcRootKind::Unknown => 0xff,
            GcRootKind::JniGlobal => 0x01,
            GcRootKind::JniLocal => 0x02,
            GcRootKind::JavaFrame => 0x03,
            GcRootKind::NativeStack => 0x04,
            GcRootKind::StickyClass => 0x05,
            GcRootKind::ThreadBlock => 0x06,
            GcRootKind::MonitorUsed => 0x07,
            GcRootKind::ThreadObj => 0x08,
        }
    }

    /// Roots parsed for stream integrity but not recorded in the index.
    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            GcRootKind::Unknown | GcRootKind::NativeStack | GcRootKind::ThreadBlock
        )
    }
}

impl fmt::Display for GcRootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GcRootKind::Unknown => "unknown",
            GcRootKind::JniGlobal => "jni-global",
            GcRootKind::JniLocal => "jni-local",
            GcRootKind::JavaFrame => "java-frame",
            GcRootKind::NativeStack => "native-stack",
            GcRootKind::StickyClass => "sticky-class",
            GcRootKind::ThreadBlock => "thread-block",
            GcRootKind::MonitorUsed => "monitor-used",
            GcRootKind::ThreadObj => "thread-obj",
        };
        f.write_str(s)
    }
}

/// A GC root sub-record, unified across kinds. For `ThreadObj` roots the
/// object id is the thread object and `thread_serial` its sequence number.
#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct GcRoot {
    pub(crate) pos: u64,
    pub(crate) len: u32,
    #[get_copy = "pub"]
    kind: GcRootKind,
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    thread_serial: Option<Serial>,
    #[get_copy = "pub"]
    frame_number: Option<u32>,
    #[get_copy = "pub"]
    stack_trace_serial: Option<Serial>,
}

impl GcRoot {
    pub(crate) fn parse(
        input: &[u8],
        id_size: IdSize,
        kind: GcRootKind,
    ) -> nom::IResult<&[u8], GcRoot> {
        let mut root = GcRoot {
            pos: 0,
            len: 0,
            kind,
            obj_id: Id::from(0),
            thread_serial: None,
            frame_number: None,
            stack_trace_serial: None,
        };

        let input = match kind {
            GcRootKind::Unknown | GcRootKind::StickyClass | GcRootKind::MonitorUsed => {
                let (rest, obj_id) = Id::parse(input, id_size)?;
                root.obj_id = obj_id;
                rest
            }
            GcRootKind::JniGlobal => {
                let (rest, obj_id) = Id::parse(input, id_size)?;
                // the JNI global ref id is of no use downstream
                let (rest, _jni_ref) = Id::parse(rest, id_size)?;
                root.obj_id = obj_id;
                rest
            }
            GcRootKind::JniLocal | GcRootKind::JavaFrame => {
                let (rest, obj_id) = Id::parse(input, id_size)?;
                let (rest, thread_serial) = number::be_u32(rest)?;
                let (rest, frame_number) = number::be_u32(rest)?;
                root.obj_id = obj_id;
                root.thread_serial = Some(thread_serial);
                // -1 means "not in a frame"
                root.frame_number = if frame_number == u32::MAX {
                    None
                } else {
                    Some(frame_number)
                };
                rest
            }
            GcRootKind::NativeStack | GcRootKind::ThreadBlock => {
                let (rest, obj_id) = Id::parse(input, id_size)?;
                let (rest, thread_serial) = number::be_u32(rest)?;
                root.obj_id = obj_id;
                root.thread_serial = Some(thread_serial);
                rest
            }
            GcRootKind::ThreadObj => {
                let (rest, obj_id) = Id::parse(input, id_size)?;
                let (rest, thread_serial) = number::be_u32(rest)?;
                let (rest, stack_trace_serial) = number::be_u32(rest)?;
                root.obj_id = obj_id;
                root.thread_serial = Some(thread_serial);
                root.stack_trace_serial = Some(stack_trace_serial);
                rest
            }
        };

        Ok((input, root))
    }

    pub fn pos_and_len(&self) -> (u64, u32) {
        (self.pos, self.len)
    }
}
