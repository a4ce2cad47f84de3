use crate::{Id, IdSize, Serial};
use getset::CopyGetters;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete as number;
use serde::{Deserialize, Serialize};

/// HPROF basic type tags, as used by field descriptors, static field values
/// and primitive array elements.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FieldType {
    Object,
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl FieldType {
    pub fn from_type_code(code: u8) -> Option<FieldType> {
        match code {
            0x02 => Some(FieldType::Object),
            0x04 => Some(FieldType::Boolean),
            0x05 => Some(FieldType::Char),
            0x06 => Some(FieldType::Float),
            0x07 => Some(FieldType::Double),
            0x08 => Some(FieldType::Byte),
            0x09 => Some(FieldType::Short),
            0x0A => Some(FieldType::Int),
            0x0B => Some(FieldType::Long),
            _ => None,
        }
    }

    pub fn type_code(&self) -> u8 {
        match self {
            FieldType::Object => 0x02,
            FieldType::Boolean => 0x04,
            FieldType::Char => 0x05,
            FieldType::Float => 0x06,
            FieldType::Double => 0x07,
            FieldType::Byte => 0x08,
            FieldType::Short => 0x09,
            FieldType::Int => 0x0A,
            FieldType::Long => 0x0B,
        }
    }

    /// On-disk size; OBJECT values take the id width.
    pub fn size_in_bytes(&self, id_size: IdSize) -> usize {
        match self {
            FieldType::Object => id_size.size_in_bytes(),
            FieldType::Boolean | FieldType::Byte => 1,
            FieldType::Char | FieldType::Short => 2,
            FieldType::Float | FieldType::Int => 4,
            FieldType::Double | FieldType::Long => 8,
        }
    }

    pub fn java_type_name(&self) -> &'static str {
        match self {
            FieldType::Object => "object",
            FieldType::Boolean => "boolean",
            FieldType::Char => "char",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Byte => "byte",
            FieldType::Short => "short",
            FieldType::Int => "int",
            FieldType::Long => "long",
        }
    }

    fn parse(input: &[u8]) -> nom::IResult<&[u8], FieldType> {
        let (rest, code) = number::be_u8(input)?;
        match FieldType::from_type_code(code) {
            Some(t) => Ok((rest, t)),
            // Failure (not Error): an out-of-range type byte is corruption,
            // not a short read
            None => Err(nom::Err::Failure(NomError::new(input, ErrorKind::Tag))),
        }
    }

    /// Decode one value of this type.
    pub fn parse_value<'a>(
        &self,
        input: &'a [u8],
        id_size: IdSize,
    ) -> nom::IResult<&'a [u8], FieldValue> {
        use crate::StatelessParserWithId;
        match self {
            FieldType::Object => {
                let (rest, id) = Id::parse(input, id_size)?;
                Ok((rest, FieldValue::ObjectId(id)))
            }
            FieldType::Boolean => {
                let (rest, b) = number::be_u8(input)?;
                Ok((rest, FieldValue::Boolean(b != 0)))
            }
            FieldType::Char => {
                let (rest, c) = number::be_u16(input)?;
                Ok((rest, FieldValue::Char(c)))
            }
            FieldType::Float => {
                let (rest, f) = number::be_f32(input)?;
                Ok((rest, FieldValue::Float(f)))
            }
            FieldType::Double => {
                let (rest, d) = number::be_f64(input)?;
                Ok((rest, FieldValue::Double(d)))
            }
            FieldType::Byte => {
                let (rest, b) = number::be_i8(input)?;
                Ok((rest, FieldValue::Byte(b)))
            }
            FieldType::Short => {
                let (rest, s) = number::be_i16(input)?;
                Ok((rest, FieldValue::Short(s)))
            }
            FieldType::Int => {
                let (rest, i) = number::be_i32(input)?;
                Ok((rest, FieldValue::Int(i)))
            }
            FieldType::Long => {
                let (rest, l) = number::be_i64(input)?;
                Ok((rest, FieldValue::Long(l)))
            }
        }
    }
}

/// A decoded field or static value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FieldValue {
    ObjectId(Id),
    Boolean(bool),
    Char(u16),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::ObjectId(_) => FieldType::Object,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::Char(_) => FieldType::Char,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Byte(_) => FieldType::Byte,
            FieldValue::Short(_) => FieldType::Short,
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Long(_) => FieldType::Long,
        }
    }

    /// Human rendering: `null` / hex for objects, `%c` for chars.
    pub fn render(&self) -> String {
        match self {
            FieldValue::ObjectId(id) if id.is_null() => "null".to_owned(),
            FieldValue::ObjectId(id) => format!("{:#X}", id),
            FieldValue::Boolean(b) => b.to_string(),
            FieldValue::Char(c) => std::char::from_u32(*c as u32)
                .map(|c| c.to_string())
                .unwrap_or_else(|| format!("\\u{:04x}", c)),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Double(d) => d.to_string(),
            FieldValue::Byte(b) => b.to_string(),
            FieldValue::Short(s) => s.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Long(l) => l.to_string(),
        }
    }
}

/// A static field with its inline value.
#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct StaticFieldEntry {
    #[get_copy = "pub"]
    name_id: Id,
    #[get_copy = "pub"]
    value: FieldValue,
}

/// An instance field declaration: name + type, no value (values live in the
/// instance records).
#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct FieldDescriptor {
    #[get_copy = "pub"]
    name_id: Id,
    #[get_copy = "pub"]
    field_type: FieldType,
}

impl FieldDescriptor {
    pub fn new(name_id: Id, field_type: FieldType) -> FieldDescriptor {
        FieldDescriptor {
            name_id,
            field_type,
        }
    }
}

/// A class dump sub-record. Constant pool entries are parsed for their size
/// and discarded; modern JVMs emit none.
#[derive(CopyGetters, Clone)]
pub struct Class {
    pub(crate) pos: u64,
    pub(crate) len: u32,
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    super_class_obj_id: Option<Id>,
    #[get_copy = "pub"]
    class_loader_obj_id: Option<Id>,
    #[get_copy = "pub"]
    signers_obj_id: Option<Id>,
    #[get_copy = "pub"]
    protection_domain_obj_id: Option<Id>,
    #[get_copy = "pub"]
    instance_size_bytes: u32,
    static_fields: Vec<StaticFieldEntry>,
    instance_fields: Vec<FieldDescriptor>,
}

fn non_null(id: Id) -> Option<Id> {
    if id.is_null() {
        None
    } else {
        Some(id)
    }
}

impl Class {
    pub fn static_fields(&self) -> &[StaticFieldEntry] {
        &self.static_fields
    }

    /// Just this class's own declared fields, not the superclass chain.
    pub fn instance_fields(&self) -> &[FieldDescriptor] {
        &self.instance_fields
    }

    pub fn pos_and_len(&self) -> (u64, u32) {
        (self.pos, self.len)
    }

    pub(crate) fn parse(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], Class> {
        use crate::StatelessParserWithId;

        let (input, obj_id) = Id::parse(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, super_class_obj_id) = Id::parse(input, id_size)?;
        let (input, class_loader_obj_id) = Id::parse(input, id_size)?;
        let (input, signers_obj_id) = Id::parse(input, id_size)?;
        let (input, protection_domain_obj_id) = Id::parse(input, id_size)?;
        // two reserved ids
        let (input, _) = Id::parse(input, id_size)?;
        let (input, _) = Id::parse(input, id_size)?;
        let (input, instance_size_bytes) = number::be_u32(input)?;

        let (mut input, constant_pool_count) = number::be_u16(input)?;
        for _ in 0..constant_pool_count {
            let (rest, _idx) = number::be_u16(input)?;
            let (rest, ty) = FieldType::parse(rest)?;
            let (rest, _value) = ty.parse_value(rest, id_size)?;
            input = rest;
        }

        let (mut input, static_count) = number::be_u16(input)?;
        let mut static_fields = Vec::with_capacity(static_count as usize);
        for _ in 0..static_count {
            let (rest, name_id) = Id::parse(input, id_size)?;
            let (rest, ty) = FieldType::parse(rest)?;
            let (rest, value) = ty.parse_value(rest, id_size)?;
            static_fields.push(StaticFieldEntry { name_id, value });
            input = rest;
        }

        let (mut input, field_count) = number::be_u16(input)?;
        let mut instance_fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let (rest, name_id) = Id::parse(input, id_size)?;
            let (rest, field_type) = FieldType::parse(rest)?;
            instance_fields.push(FieldDescriptor {
                name_id,
                field_type,
            });
            input = rest;
        }

        Ok((
            input,
            Class {
                pos: 0,
                len: 0,
                obj_id,
                stack_trace_serial,
                super_class_obj_id: non_null(super_class_obj_id),
                class_loader_obj_id: non_null(class_loader_obj_id),
                signers_obj_id: non_null(signers_obj_id),
                protection_domain_obj_id: non_null(protection_domain_obj_id),
                instance_size_bytes,
                static_fields,
                instance_fields,
            },
        ))
    }
}

/// A class fabricated by the analyzer for a class id the dump references but
/// never declares. Stored inline in the index, not in the dump.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FakeClass {
    pub class_obj_id: u64,
    pub super_class_obj_id: u64,
    pub instance_fields: Vec<FakeField>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FakeField {
    pub name_id: u64,
    pub type_code: u8,
}

impl FakeClass {
    pub fn field_descriptors(&self) -> Vec<FieldDescriptor> {
        self.instance_fields
            .iter()
            .filter_map(|f| {
                FieldType::from_type_code(f.type_code)
                    .map(|ty| FieldDescriptor::new(Id::from(f.name_id), ty))
            })
            .collect()
    }
}
