//! Length-prefixed buffer encode/decode primitives shared by the offline
//! wire frames in `nc-core`.
//!
//! This mirrors the cursor-based `Encoder`/`Decoder` split used by the
//! codec crate this workspace is built on top of, trimmed to the fixed-width
//! integer and length-delimited byte values the offline frame wire format
//! actually needs (no QUIC-style variable-length integers).

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

pub mod decoder;
pub mod encoder;

pub use decoder::{DecoderBuffer, DecoderError, DecoderValue};
pub use encoder::{Encoder, EncoderBuffer, EncoderValue};
