/// Pluggable key/value codecs.
///
/// A tree may carry a custom `Serializer` for its keys and another for its
/// values; when none is set the self-describing `DefaultSerializer` is used.
use crate::error::{KuraError, Result};
use crate::types::Datum;
use crate::varint::{encode_varint, Reader};

/// Serialize a single `Datum` to/from bytes.
///
/// Implementations must be deterministic: the page codec compares and
/// prefix-shares the produced bytes across neighbouring slots.
pub trait Serializer {
    fn serialize(&self, out: &mut Vec<u8>, value: &Datum) -> Result<()>;
    fn deserialize(&self, input: &mut Reader<'_>) -> Result<Datum>;
}

const TAG_NONE: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_STR: u8 = 3;
const TAG_BYTES: u8 = 4;

fn zigzag_encode(val: i64) -> u64 {
    ((val << 1) ^ (val >> 63)) as u64
}

fn zigzag_decode(val: u64) -> i64 {
    ((val >> 1) as i64) ^ -((val & 1) as i64)
}

/// Fallback codec for trees without a custom serializer: one tag byte, then
/// a zigzag varint (numbers) or a varint length plus raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSerializer;

impl DefaultSerializer {
    /// Nullable form used by the key block, where a slot may be absent.
    pub fn serialize_opt(&self, out: &mut Vec<u8>, value: Option<&Datum>) -> Result<()> {
        match value {
            None => {
                out.push(TAG_NONE);
                Ok(())
            }
            Some(v) => self.serialize(out, v),
        }
    }

    pub fn deserialize_opt(&self, input: &mut Reader<'_>) -> Result<Option<Datum>> {
        match input.read_u8()? {
            TAG_NONE => Ok(None),
            tag => self.deserialize_tagged(tag, input).map(Some),
        }
    }

    fn deserialize_tagged(&self, tag: u8, input: &mut Reader<'_>) -> Result<Datum> {
        match tag {
            TAG_INT => Ok(Datum::Int(zigzag_decode(input.read_varint()?) as i32)),
            TAG_LONG => Ok(Datum::Long(zigzag_decode(input.read_varint()?))),
            TAG_STR => {
                let len = input.read_varint()? as usize;
                let bytes = input.read_bytes(len)?;
                let s = String::from_utf8(bytes.to_vec())
                    .map_err(|_| KuraError::InvalidFormat("non-UTF-8 string datum".into()))?;
                Ok(Datum::Str(s))
            }
            TAG_BYTES => {
                let len = input.read_varint()? as usize;
                Ok(Datum::Bytes(input.read_bytes(len)?.to_vec()))
            }
            other => Err(KuraError::InvalidFormat(format!(
                "unknown datum tag: {}",
                other
            ))),
        }
    }
}

impl Serializer for DefaultSerializer {
    fn serialize(&self, out: &mut Vec<u8>, value: &Datum) -> Result<()> {
        match value {
            Datum::Int(v) => {
                out.push(TAG_INT);
                encode_varint(out, zigzag_encode(*v as i64));
            }
            Datum::Long(v) => {
                out.push(TAG_LONG);
                encode_varint(out, zigzag_encode(*v));
            }
            Datum::Str(v) => {
                out.push(TAG_STR);
                encode_varint(out, v.len() as u64);
                out.extend_from_slice(v.as_bytes());
            }
            Datum::Bytes(v) => {
                out.push(TAG_BYTES);
                encode_varint(out, v.len() as u64);
                out.extend_from_slice(v);
            }
        }
        Ok(())
    }

    fn deserialize(&self, input: &mut Reader<'_>) -> Result<Datum> {
        let tag = input.read_u8()?;
        self.deserialize_tagged(tag, input)
    }
}
