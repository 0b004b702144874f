//! Typed argument marshalling.
//!
//! A call's arguments form an ordered tuple. Marshalling concatenates the
//! values through a user-supplied [`Serializer`]; unmarshalling reads them
//! back in the same order. Two conventions make the format evolvable:
//!
//! - **Optional trailing arguments.** An `Option<T>` parameter decodes `T`
//!   only if input bytes remain; an exhausted input decodes to `None`, and
//!   `None` encodes as nothing. Appending `Option` parameters on both ends
//!   therefore stays wire-compatible with peers that do not send them.
//!   Optional parameters must come last; an `Option` followed by further
//!   arguments would consume their bytes.
//! - **Owning-wrapper unwrap.** `Box<T>` and `Arc<T>` marshal as their
//!   target, so a handler may return `Box<T>` while the caller declares
//!   plain `T`.
//!
//! Buffers are marshalled with a caller-specified header prefix reserved up
//! front, so the framing layer fills headers in place without copying.

use std::sync::Arc;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, RpcError};

/// A cursor over the undecoded remainder of a payload.
pub struct Input<'a> {
    data: &'a [u8],
}

impl<'a> Input<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    /// Takes the next `n` bytes off the front.
    pub fn consume(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.data.len() {
            return Err(RpcError::Protocol("truncated value in payload".into()));
        }
        let (taken, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(taken)
    }
}

/// A value encoding supplied by the application.
///
/// `read_value` must consume exactly the bytes of one value and leave the
/// rest for the following arguments. [`PostcardSerializer`] is the default;
/// [`JsonSerializer`] shows a length-delimited alternative.
///
/// [`PostcardSerializer`]: crate::codec::PostcardSerializer
/// [`JsonSerializer`]: crate::codec::JsonSerializer
pub trait Serializer: Send + Sync + 'static {
    fn write_value<T: Serialize + ?Sized>(&self, out: &mut BytesMut, value: &T) -> Result<()>;
    fn read_value<T: DeserializeOwned>(&self, input: &mut Input<'_>) -> Result<T>;
}

/// One marshallable value. Implemented for the primitive types, for
/// `Option`/`Box`/`Arc` with the conventions above, and for application
/// types through [`marshal_via_serde!`](crate::marshal_via_serde).
pub trait Marshal<S: Serializer>: Send + Sized + 'static {
    fn marshal(&self, ser: &S, out: &mut BytesMut) -> Result<()>;
    fn unmarshal(ser: &S, input: &mut Input<'_>) -> Result<Self>;
}

/// Implements [`Marshal`] for types by delegating to the serializer's serde
/// support.
#[macro_export]
macro_rules! marshal_via_serde {
    ($($t:ty),+ $(,)?) => { $(
        impl<S: $crate::marshal::Serializer> $crate::marshal::Marshal<S> for $t {
            fn marshal(
                &self,
                ser: &S,
                out: &mut $crate::bytes::BytesMut,
            ) -> $crate::error::Result<()> {
                ser.write_value(out, self)
            }

            fn unmarshal(
                ser: &S,
                input: &mut $crate::marshal::Input<'_>,
            ) -> $crate::error::Result<Self> {
                ser.read_value(input)
            }
        }
    )+ };
}

marshal_via_serde! {
    bool, char,
    i8, i16, i32, i64,
    u8, u16, u32, u64,
    f32, f64,
    String,
}

impl<S: Serializer, T> Marshal<S> for Vec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn marshal(&self, ser: &S, out: &mut BytesMut) -> Result<()> {
        ser.write_value(out, self)
    }

    fn unmarshal(ser: &S, input: &mut Input<'_>) -> Result<Self> {
        ser.read_value(input)
    }
}

// Optional trailing argument: absent bytes decode to the empty optional.
impl<S: Serializer, T: Marshal<S>> Marshal<S> for Option<T> {
    fn marshal(&self, ser: &S, out: &mut BytesMut) -> Result<()> {
        match self {
            Some(value) => value.marshal(ser, out),
            None => Ok(()),
        }
    }

    fn unmarshal(ser: &S, input: &mut Input<'_>) -> Result<Self> {
        if input.is_empty() {
            Ok(None)
        } else {
            T::unmarshal(ser, input).map(Some)
        }
    }
}

// Owning wrappers marshal as their target.
impl<S: Serializer, T: Marshal<S>> Marshal<S> for Box<T> {
    fn marshal(&self, ser: &S, out: &mut BytesMut) -> Result<()> {
        (**self).marshal(ser, out)
    }

    fn unmarshal(ser: &S, input: &mut Input<'_>) -> Result<Self> {
        T::unmarshal(ser, input).map(Box::new)
    }
}

impl<S: Serializer, T: Marshal<S> + Sync> Marshal<S> for Arc<T> {
    fn marshal(&self, ser: &S, out: &mut BytesMut) -> Result<()> {
        (**self).marshal(ser, out)
    }

    fn unmarshal(ser: &S, input: &mut Input<'_>) -> Result<Self> {
        T::unmarshal(ser, input).map(Arc::new)
    }
}

// A reply can carry no value at all.
impl<S: Serializer> Marshal<S> for () {
    fn marshal(&self, _ser: &S, _out: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn unmarshal(_ser: &S, _input: &mut Input<'_>) -> Result<Self> {
        Ok(())
    }
}

// Multi-value replies: a handler may return a small tuple, decoded
// value-by-value in order on the caller's side.
impl<S: Serializer, A: Marshal<S>, B: Marshal<S>> Marshal<S> for (A, B) {
    fn marshal(&self, ser: &S, out: &mut BytesMut) -> Result<()> {
        self.0.marshal(ser, out)?;
        self.1.marshal(ser, out)
    }

    fn unmarshal(ser: &S, input: &mut Input<'_>) -> Result<Self> {
        Ok((A::unmarshal(ser, input)?, B::unmarshal(ser, input)?))
    }
}

impl<S: Serializer, A: Marshal<S>, B: Marshal<S>, C: Marshal<S>> Marshal<S> for (A, B, C) {
    fn marshal(&self, ser: &S, out: &mut BytesMut) -> Result<()> {
        self.0.marshal(ser, out)?;
        self.1.marshal(ser, out)?;
        self.2.marshal(ser, out)
    }

    fn unmarshal(ser: &S, input: &mut Input<'_>) -> Result<Self> {
        Ok((
            A::unmarshal(ser, input)?,
            B::unmarshal(ser, input)?,
            C::unmarshal(ser, input)?,
        ))
    }
}

/// An ordered argument tuple.
pub trait MarshalArgs<S: Serializer>: Send + Sized + 'static {
    fn marshal(&self, ser: &S, out: &mut BytesMut) -> Result<()>;
    fn unmarshal(ser: &S, input: &mut Input<'_>) -> Result<Self>;
}

macro_rules! impl_marshal_args {
    ($($name:ident : $idx:tt),*) => {
        impl<S: Serializer $(, $name: Marshal<S>)*> MarshalArgs<S> for ($($name,)*) {
            #[allow(unused_variables)]
            fn marshal(&self, ser: &S, out: &mut BytesMut) -> Result<()> {
                $( self.$idx.marshal(ser, out)?; )*
                Ok(())
            }

            #[allow(unused_variables)]
            fn unmarshal(ser: &S, input: &mut Input<'_>) -> Result<Self> {
                Ok(( $( $name::unmarshal(ser, input)?, )* ))
            }
        }
    };
}

impl_marshal_args!();
impl_marshal_args!(A: 0);
impl_marshal_args!(A: 0, B: 1);
impl_marshal_args!(A: 0, B: 1, C: 2);
impl_marshal_args!(A: 0, B: 1, C: 2, D: 3);
impl_marshal_args!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_marshal_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// Marshals an argument tuple into a buffer with `head_space` zero bytes
/// reserved for the frame header.
pub fn marshal_args<S: Serializer, A: MarshalArgs<S>>(
    ser: &S,
    head_space: usize,
    args: &A,
) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(head_space + 64);
    buf.resize(head_space, 0);
    args.marshal(ser, &mut buf)?;
    Ok(buf)
}

/// Unmarshals an argument tuple from a request payload.
///
/// Bytes left over after the declared arguments are a protocol error; a
/// peer sending more than the handler declares cannot be resynchronized.
pub fn unmarshal_args<S: Serializer, A: MarshalArgs<S>>(ser: &S, payload: &[u8]) -> Result<A> {
    let mut input = Input::new(payload);
    let args = A::unmarshal(ser, &mut input)?;
    if !input.is_empty() {
        return Err(RpcError::Protocol(format!(
            "{} trailing bytes after arguments",
            input.remaining()
        )));
    }
    Ok(args)
}

/// Marshals a single reply value with `head_space` reserved header bytes.
pub fn marshal_value<S: Serializer, T: Marshal<S>>(
    ser: &S,
    head_space: usize,
    value: &T,
) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(head_space + 64);
    buf.resize(head_space, 0);
    value.marshal(ser, &mut buf)?;
    Ok(buf)
}

/// Unmarshals a single reply value from a response payload.
pub fn unmarshal_value<S: Serializer, T: Marshal<S>>(ser: &S, payload: &[u8]) -> Result<T> {
    let mut input = Input::new(payload);
    let value = T::unmarshal(ser, &mut input)?;
    if !input.is_empty() {
        return Err(RpcError::Protocol(format!(
            "{} trailing bytes after reply value",
            input.remaining()
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PostcardSerializer;

    fn roundtrip<A: MarshalArgs<PostcardSerializer> + PartialEq + std::fmt::Debug>(args: A) {
        let ser = PostcardSerializer;
        let buf = marshal_args(&ser, 0, &args).unwrap();
        let decoded: A = unmarshal_args(&ser, &buf).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_tuple_roundtrips() {
        roundtrip(());
        roundtrip((41i32,));
        roundtrip((1u64, "hi".to_string()));
        roundtrip((true, 3.5f64, vec![1u8, 2, 3]));
    }

    #[test]
    fn test_head_space_is_reserved() {
        let ser = PostcardSerializer;
        let buf = marshal_args(&ser, 28, &(7i32,)).unwrap();
        assert!(buf.len() > 28);
        assert!(buf[..28].iter().all(|b| *b == 0));

        let decoded: (i32,) = unmarshal_args(&ser, &buf[28..]).unwrap();
        assert_eq!(decoded.0, 7);
    }

    #[test]
    fn test_absent_trailing_optional_decodes_to_none() {
        let ser = PostcardSerializer;
        // Encoded by a peer that only knows about two arguments.
        let buf = marshal_args(&ser, 0, &(1i32, 2i32)).unwrap();
        let decoded: (i32, i32, Option<String>) = unmarshal_args(&ser, &buf).unwrap();
        assert_eq!(decoded, (1, 2, None));
    }

    #[test]
    fn test_present_trailing_optional_roundtrips() {
        roundtrip((1i32, Some("extra".to_string())));
    }

    #[test]
    fn test_extra_argument_for_older_peer_is_protocol_error() {
        let ser = PostcardSerializer;
        let buf = marshal_args(&ser, 0, &(1i32, 2i32, Some(3i32))).unwrap();
        let res: Result<(i32, i32)> = unmarshal_args(&ser, &buf);
        assert!(matches!(res, Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_owning_wrappers_unwrap_on_the_wire() {
        let ser = PostcardSerializer;
        let buf = marshal_value(&ser, 0, &Box::new(42i64)).unwrap();
        let plain: i64 = unmarshal_value(&ser, &buf).unwrap();
        assert_eq!(plain, 42);

        let buf = marshal_value(&ser, 0, &Arc::new("shared".to_string())).unwrap();
        let plain: String = unmarshal_value(&ser, &buf).unwrap();
        assert_eq!(plain, "shared");
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let ser = PostcardSerializer;
        let buf = marshal_args(&ser, 0, &("truncate me".to_string(),)).unwrap();
        let res: Result<(String,)> = unmarshal_args(&ser, &buf[..buf.len() - 3]);
        assert!(res.is_err());
    }
}
