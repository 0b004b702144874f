//! Built-in serializers.
//!
//! [`PostcardSerializer`] is the default: postcard's encoding is
//! self-delimiting, so consecutive values concatenate without extra
//! framing. [`JsonSerializer`] length-delimits each value instead, which
//! keeps payloads human-readable at the cost of four bytes per value.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::marshal::{Input, Serializer};

/// Compact binary serializer backed by postcard.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardSerializer;

impl Serializer for PostcardSerializer {
    fn write_value<T: Serialize + ?Sized>(&self, out: &mut BytesMut, value: &T) -> Result<()> {
        let encoded = postcard::to_allocvec(value)?;
        out.extend_from_slice(&encoded);
        Ok(())
    }

    fn read_value<T: DeserializeOwned>(&self, input: &mut Input<'_>) -> Result<T> {
        let (value, rest) = postcard::take_from_bytes::<T>(input.as_slice())?;
        let used = input.remaining() - rest.len();
        input.consume(used)?;
        Ok(value)
    }
}

/// JSON serializer with a 4-byte little-endian length prefix per value.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn write_value<T: Serialize + ?Sized>(&self, out: &mut BytesMut, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        out.put_u32_le(encoded.len() as u32);
        out.extend_from_slice(&encoded);
        Ok(())
    }

    fn read_value<T: DeserializeOwned>(&self, input: &mut Input<'_>) -> Result<T> {
        let len_bytes = input.consume(4)?;
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        let body = input.consume(len)?;
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{marshal_args, unmarshal_args};

    #[test]
    fn test_postcard_values_concatenate() {
        let ser = PostcardSerializer;
        let buf = marshal_args(&ser, 0, &(300u32, "abc".to_string(), true)).unwrap();
        let decoded: (u32, String, bool) = unmarshal_args(&ser, &buf).unwrap();
        assert_eq!(decoded, (300, "abc".to_string(), true));
    }

    #[test]
    fn test_json_values_concatenate() {
        let ser = JsonSerializer;
        let buf = marshal_args(&ser, 0, &(-5i64, vec![1u8, 2])).unwrap();
        let decoded: (i64, Vec<u8>) = unmarshal_args(&ser, &buf).unwrap();
        assert_eq!(decoded, (-5, vec![1, 2]));
    }

    #[test]
    fn test_json_truncated_prefix_is_an_error() {
        let ser = JsonSerializer;
        let mut input = Input::new(&[1, 0]);
        let res: Result<i32> = ser.read_value(&mut input);
        assert!(res.is_err());
    }
}
