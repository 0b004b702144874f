//! driftrpc wire format, marshalling and shared configuration.
//!
//! This crate holds everything both endpoints of a connection agree on:
//!
//! - [`frame`] - the binary wire format: negotiation, request and response
//!   frames, exception records, the compressed envelope, and the frame
//!   reader/writer used by the connection loops.
//! - [`marshal`] - typed argument marshalling over a pluggable
//!   [`Serializer`], including the optional-trailing-argument and
//!   owning-wrapper conventions.
//! - [`codec`] - the built-in postcard and JSON serializers.
//! - [`compress`] - the compressor interface and the identity compressor.
//! - [`limits`] - the per-connection memory budget.
//! - [`error`] - the error taxonomy shared by client and server.
//!
//! # Example
//!
//! ```
//! use driftrpc_common::codec::PostcardSerializer;
//! use driftrpc_common::marshal::{marshal_args, unmarshal_args};
//!
//! let ser = PostcardSerializer;
//! let buf = marshal_args(&ser, 0, &(41i32, "hi".to_string())).unwrap();
//! let (n, s): (i32, String) = unmarshal_args(&ser, &buf).unwrap();
//! assert_eq!((n, s.as_str()), (41, "hi"));
//! ```

pub mod codec;
pub mod compress;
pub mod error;
pub mod frame;
pub mod limits;
pub mod marshal;

// Re-exported for the marshal_via_serde! macro expansion.
pub use bytes;

pub use codec::{JsonSerializer, PostcardSerializer};
pub use compress::{Compressor, CompressorFactory, NoopCompressor, NoopCompressorFactory};
pub use error::{Result, RpcError};
pub use limits::ResourceLimits;
pub use marshal::{Marshal, MarshalArgs, Serializer};
