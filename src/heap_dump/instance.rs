use crate::{Id, IdSize, Serial, StatelessParserWithId};
use getset::CopyGetters;
use nom::bytes::complete as bytes;
use nom::number::complete as number;

/// An instance dump sub-record. `values` is the opaque field payload; its
/// layout is the concatenation of the instance field lists along the
/// superclass chain (this class first, `java/lang/Object` last).
#[derive(CopyGetters, Copy, Clone)]
pub struct Instance<'a> {
    pub(crate) pos: u64,
    pub(crate) len: u32,
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    class_obj_id: Id,
    #[get_copy = "pub"]
    values: &'a [u8],
}

impl<'a> Instance<'a> {
    pub(crate) fn parse(input: &'a [u8], id_size: IdSize) -> nom::IResult<&'a [u8], Instance<'a>> {
        let (input, obj_id) = Id::parse(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, class_obj_id) = Id::parse(input, id_size)?;
        let (input, values_len) = number::be_u32(input)?;
        let (input, values) = bytes::take(values_len)(input)?;

        Ok((
            input,
            Instance {
                pos: 0,
                len: 0,
                obj_id,
                stack_trace_serial,
                class_obj_id,
                values,
            },
        ))
    }

    /// Header-inclusive shallow size the runtime charges for this object.
    pub fn shallow_size(&self, header_size: u64) -> u64 {
        self.values.len() as u64 + header_size
    }

    pub fn pos_and_len(&self) -> (u64, u32) {
        (self.pos, self.len)
    }
}
