//! UKEY2 key agreement and D2D signcryption (spec.md §4.4).
//!
//! Grounded on `s2n-quic-crypto`'s split between a handshake-negotiation
//! module (`cipher_suite::negotiated`) and a payload-protection module
//! (`aead`/`aesgcm`), and on the original implementation's
//! `securegcm::D2DCryptoOps` (`examples/original_source/third_party/ukey2`).

pub mod d2d;
pub mod rng;
pub mod ukey2;

pub use nc_core::error::HandshakeFailure as HandshakeError;

pub use d2d::D2dContext;
pub use ukey2::{ClientFinished, ClientInit, HandshakeRole, Initiator, Responder, ServerInit};
