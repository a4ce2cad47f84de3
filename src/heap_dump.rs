//! Heap dump sub-records: classes, instances, arrays, and GC roots, plus
//! the sub-tag dispatch that parses them out of a heap dump frame.

use crate::IdSize;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete as number;

mod arrays;
mod class;
mod instance;
mod roots;

pub use arrays::{ObjectArray, PrimitiveArray, PrimitiveArrayType};
pub use class::{Class, FakeClass, FakeField, FieldDescriptor, FieldType, FieldValue, StaticFieldEntry};
pub use instance::Instance;
pub use roots::{GcRoot, GcRootKind};

/// One sub-record out of a `HeapDump` / `HeapDumpSegment` frame.
pub enum SubRecord<'a> {
    Class(Class),
    Instance(Instance<'a>),
    ObjectArray(ObjectArray<'a>),
    PrimitiveArray(PrimitiveArray<'a>),
    GcRoot(GcRoot),
}

impl<'a> SubRecord<'a> {
    /// Parse one sub-record starting at its sub-tag byte. Unknown sub-tags
    /// are a failure: sub-records carry no length prefix to skip by.
    pub(crate) fn parse(input: &'a [u8], id_size: IdSize) -> nom::IResult<&'a [u8], SubRecord<'a>> {
        let (body, sub_tag) = number::be_u8(input)?;

        if let Some(kind) = GcRootKind::from_sub_tag(sub_tag) {
            let (rest, root) = GcRoot::parse(body, id_size, kind)?;
            return Ok((rest, SubRecord::GcRoot(root)));
        }

        match sub_tag {
            0x20 => {
                let (rest, class) = Class::parse(body, id_size)?;
                Ok((rest, SubRecord::Class(class)))
            }
            0x21 => {
                let (rest, instance) = Instance::parse(body, id_size)?;
                Ok((rest, SubRecord::Instance(instance)))
            }
            0x22 => {
                let (rest, array) = ObjectArray::parse(body, id_size)?;
                Ok((rest, SubRecord::ObjectArray(array)))
            }
            0x23 => {
                let (rest, array) = PrimitiveArray::parse(body, id_size)?;
                Ok((rest, SubRecord::PrimitiveArray(array)))
            }
            _ => Err(nom::Err::Failure(NomError::new(input, ErrorKind::Tag))),
        }
    }

    pub(crate) fn set_pos_and_len(&mut self, pos: u64, len: u32) {
        match self {
            SubRecord::Class(r) => {
                r.pos = pos;
                r.len = len;
            }
            SubRecord::Instance(r) => {
                r.pos = pos;
                r.len = len;
            }
            SubRecord::ObjectArray(r) => {
                r.pos = pos;
                r.len = len;
            }
            SubRecord::PrimitiveArray(r) => {
                r.pos = pos;
                r.len = len;
            }
            SubRecord::GcRoot(r) => {
                r.pos = pos;
                r.len = len;
            }
        }
    }

    pub fn pos_and_len(&self) -> (u64, u32) {
        match self {
            SubRecord::Class(r) => r.pos_and_len(),
            SubRecord::Instance(r) => r.pos_and_len(),
            SubRecord::ObjectArray(r) => r.pos_and_len(),
            SubRecord::PrimitiveArray(r) => r.pos_and_len(),
            SubRecord::GcRoot(r) => r.pos_and_len(),
        }
    }
}
