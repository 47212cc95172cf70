//! # Shared wire layer
//!
//! Everything the server processes and the protocol client agree on:
//!
//! - [`datagram`]: little-endian datagram buffer, read cursor and the server
//!   routing header.
//! - [`framing`]: `[u16 length][payload]` stream framing.
//! - [`msgtypes`] and [`channels`]: message numbers, reserved channels and the
//!   channel packing formulas.
//! - [`allocator`]: channel id allocation with delayed reuse.
//! - [`schema`]: the distributed class registry, field (un)packing and
//!   keyword flags.

pub mod allocator;
pub mod channels;
pub mod datagram;
pub mod framing;
pub mod msgtypes;
pub mod schema;

pub use allocator::{AllocatorError, ChannelAllocator};
pub use datagram::{Datagram, DatagramError, DatagramIterator, ServerHeader};
pub use framing::{encode_frame, FrameDecoder, FrameError};
pub use schema::{DClass, Field, Keywords, ParamType, Schema, SchemaError, Value};
