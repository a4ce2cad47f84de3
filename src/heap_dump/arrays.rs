use crate::parse::ParsingIterator;
use crate::records::Ids;
use crate::{Id, IdSize, Serial, StatelessParserWithId};
use getset::CopyGetters;
use nom::bytes::complete as bytes;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete as number;

/// An object array dump sub-record. Elements stay raw until iterated so the
/// streaming pass can skip over huge arrays cheaply.
#[derive(CopyGetters, Copy, Clone)]
pub struct ObjectArray<'a> {
    pub(crate) pos: u64,
    pub(crate) len: u32,
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    array_class_obj_id: Id,
    #[get_copy = "pub"]
    num_elements: u32,
    elements_raw: &'a [u8],
}

impl<'a> ObjectArray<'a> {
    pub(crate) fn parse(
        input: &'a [u8],
        id_size: IdSize,
    ) -> nom::IResult<&'a [u8], ObjectArray<'a>> {
        let (input, obj_id) = Id::parse(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, num_elements) = number::be_u32(input)?;
        let (input, array_class_obj_id) = Id::parse(input, id_size)?;
        let (input, elements_raw) =
            bytes::take(num_elements as usize * id_size.size_in_bytes())(input)?;

        Ok((
            input,
            ObjectArray {
                pos: 0,
                len: 0,
                obj_id,
                stack_trace_serial,
                array_class_obj_id,
                num_elements,
                elements_raw,
            },
        ))
    }

    pub fn elements(&self, id_size: IdSize) -> Ids<'a> {
        Ids {
            iter: ParsingIterator::new_stateless_id_size(
                id_size,
                self.elements_raw,
                self.num_elements,
            ),
        }
    }

    /// Header + length word + element ids.
    pub fn shallow_size(&self, id_size: IdSize) -> u64 {
        16 + 8 + self.num_elements as u64 * id_size.size_in_bytes() as u64
    }

    pub fn pos_and_len(&self) -> (u64, u32) {
        (self.pos, self.len)
    }
}

/// Element type of a primitive array.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum PrimitiveArrayType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl PrimitiveArrayType {
    pub fn from_type_code(code: u8) -> Option<(PrimitiveArrayType, usize)> {
        match code {
            0x04 => Some((PrimitiveArrayType::Boolean, 1)),
            0x05 => Some((PrimitiveArrayType::Char, 2)),
            0x06 => Some((PrimitiveArrayType::Float, 4)),
            0x07 => Some((PrimitiveArrayType::Double, 8)),
            0x08 => Some((PrimitiveArrayType::Byte, 1)),
            0x09 => Some((PrimitiveArrayType::Short, 2)),
            0x0A => Some((PrimitiveArrayType::Int, 4)),
            0x0B => Some((PrimitiveArrayType::Long, 8)),
            _ => None,
        }
    }

    pub fn type_code(&self) -> u8 {
        match self {
            PrimitiveArrayType::Boolean => 0x04,
            PrimitiveArrayType::Char => 0x05,
            PrimitiveArrayType::Float => 0x06,
            PrimitiveArrayType::Double => 0x07,
            PrimitiveArrayType::Byte => 0x08,
            PrimitiveArrayType::Short => 0x09,
            PrimitiveArrayType::Int => 0x0A,
            PrimitiveArrayType::Long => 0x0B,
        }
    }

    pub fn java_type_name(&self) -> &'static str {
        match self {
            PrimitiveArrayType::Boolean => "boolean",
            PrimitiveArrayType::Char => "char",
            PrimitiveArrayType::Float => "float",
            PrimitiveArrayType::Double => "double",
            PrimitiveArrayType::Byte => "byte",
            PrimitiveArrayType::Short => "short",
            PrimitiveArrayType::Int => "int",
            PrimitiveArrayType::Long => "long",
        }
    }

    /// The synthesised class name for arrays of this element type.
    pub fn array_class_name(&self) -> String {
        format!("{}[]", self.java_type_name())
    }

    pub fn iter() -> impl Iterator<Item = PrimitiveArrayType> {
        [
            PrimitiveArrayType::Boolean,
            PrimitiveArrayType::Char,
            PrimitiveArrayType::Float,
            PrimitiveArrayType::Double,
            PrimitiveArrayType::Byte,
            PrimitiveArrayType::Short,
            PrimitiveArrayType::Int,
            PrimitiveArrayType::Long,
        ]
        .iter()
        .copied()
    }
}

/// A primitive array dump sub-record; contents stay raw bytes.
#[derive(CopyGetters, Copy, Clone)]
pub struct PrimitiveArray<'a> {
    pub(crate) pos: u64,
    pub(crate) len: u32,
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    element_type: PrimitiveArrayType,
    #[get_copy = "pub"]
    num_elements: u32,
    #[get_copy = "pub"]
    contents: &'a [u8],
}

impl<'a> PrimitiveArray<'a> {
    pub(crate) fn parse(
        input: &'a [u8],
        id_size: IdSize,
    ) -> nom::IResult<&'a [u8], PrimitiveArray<'a>> {
        let (input, obj_id) = Id::parse(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, num_elements) = number::be_u32(input)?;
        let (type_input, type_code) = number::be_u8(input)?;

        let (element_type, element_size) = match PrimitiveArrayType::from_type_code(type_code) {
            Some(pair) => pair,
            None => return Err(nom::Err::Failure(NomError::new(input, ErrorKind::Tag))),
        };

        let (input, contents) =
            bytes::take(num_elements as usize * element_size)(type_input)?;

        Ok((
            input,
            PrimitiveArray {
                pos: 0,
                len: 0,
                obj_id,
                stack_trace_serial,
                element_type,
                num_elements,
                contents,
            },
        ))
    }

    /// Header + length word + element bytes.
    pub fn shallow_size(&self) -> u64 {
        16 + 8 + self.contents.len() as u64
    }

    pub fn pos_and_len(&self) -> (u64, u32) {
        (self.pos, self.len)
    }
}
