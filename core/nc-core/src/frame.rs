//! The V1 offline frame wire format (spec.md §6.2).
//!
//! Grounded on `s2n-quic-core::frame::mod`'s "one enum variant per wire
//! message, dispatch by tag" shape, simplified to a flat match since this
//! protocol has seven frame kinds rather than QUIC's thirty-odd. The real
//! system encodes these as protobuf; the protobuf message definitions
//! themselves are out of scope (spec.md §1), so this module defines the
//! equivalent Rust structs and a length-prefixed binary encoding that
//! preserves the same fields and the same "trailing unknown bytes survive a
//! decode/re-encode round trip" forward-compatibility property.

use crate::endpoint::EndpointId;
use crate::medium::Medium;
use alloc::vec::Vec;
use nc_codec::{DecoderBuffer, DecoderError, Encoder, EncoderBuffer};

/// The only wire version this core speaks. A frame whose version byte
/// doesn't match this is an `InvalidWireFormat` (spec.md §4.1).
pub const WIRE_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame ended before a required field could be read")]
    Truncated,
    #[error("frame version {0} is not supported")]
    UnsupportedVersion(u8),
    #[error("frame kind tag {0} is not recognized")]
    UnknownKind(u8),
    #[error("a required sub-message was missing")]
    MissingSubMessage,
}

impl From<DecoderError> for WireError {
    fn from(_: DecoderError) -> Self {
        WireError::Truncated
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    ConnectionRequest = 1,
    ConnectionResponse = 2,
    PayloadTransfer = 3,
    BandwidthUpgradeNegotiation = 4,
    KeepAlive = 5,
    Disconnection = 6,
    PairedKeyEncryption = 7,
}

impl Tag {
    fn from_u8(tag: u8) -> Result<Self, WireError> {
        Ok(match tag {
            1 => Tag::ConnectionRequest,
            2 => Tag::ConnectionResponse,
            3 => Tag::PayloadTransfer,
            4 => Tag::BandwidthUpgradeNegotiation,
            5 => Tag::KeepAlive,
            6 => Tag::Disconnection,
            7 => Tag::PairedKeyEncryption,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequestFrame {
    pub endpoint_id: EndpointId,
    pub endpoint_info: Vec<u8>,
    pub nonce: i32,
    pub supported_mediums: Vec<Medium>,
    pub keep_alive_interval_ms: u32,
    pub keep_alive_timeout_ms: u32,
    /// Unrecognized trailing bytes from a newer wire revision, preserved
    /// verbatim across decode/re-encode.
    pub extra: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionResponseFrame {
    pub status: i32,
    pub ostensible_endpoint_info: Option<Vec<u8>>,
    pub extra: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlEvent {
    Canceled,
    ReceivedAck,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadTransferBody {
    Data {
        offset: i64,
        last: bool,
        body: Vec<u8>,
    },
    Control {
        offset: i64,
        event: ControlEvent,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WirePayloadKind {
    Bytes,
    Stream,
    File,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadTransferFrame {
    pub payload_id: i64,
    pub payload_kind: WirePayloadKind,
    pub total_size: i64,
    pub body: PayloadTransferBody,
    pub extra: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandwidthUpgradeEventType {
    UpgradePathAvailable,
    LastWriteToPriorChannel,
    SafeToClosePriorChannel,
    ClientIntroduction,
    ClientIntroductionAck,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BandwidthUpgradeNegotiationFrame {
    pub event_type: BandwidthUpgradeEventType,
    pub medium_specific_payload: Vec<u8>,
    pub extra: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct KeepAliveFrame {
    pub extra: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DisconnectionFrame {
    pub extra: Vec<u8>,
}

/// Out of scope for this core: the core only routes these, it never
/// interprets the contents (spec.md §1, §6.2).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PairedKeyEncryptionFrame {
    pub opaque_bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OfflineFrame {
    ConnectionRequest(ConnectionRequestFrame),
    ConnectionResponse(ConnectionResponseFrame),
    PayloadTransfer(PayloadTransferFrame),
    BandwidthUpgradeNegotiation(BandwidthUpgradeNegotiationFrame),
    KeepAlive(KeepAliveFrame),
    Disconnection(DisconnectionFrame),
    PairedKeyEncryption(PairedKeyEncryptionFrame),
}

impl OfflineFrame {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OfflineFrame::ConnectionRequest(_) => "connection-request",
            OfflineFrame::ConnectionResponse(_) => "connection-response",
            OfflineFrame::PayloadTransfer(_) => "payload-transfer",
            OfflineFrame::BandwidthUpgradeNegotiation(_) => "bandwidth-upgrade",
            OfflineFrame::KeepAlive(_) => "keep-alive",
            OfflineFrame::Disconnection(_) => "disconnection",
            OfflineFrame::PairedKeyEncryption(_) => "paired-keyexchange",
        }
    }
}

fn medium_tag(medium: Medium) -> u8 {
    match medium {
        Medium::BluetoothClassic => 0,
        Medium::Ble => 1,
        Medium::WifiLan => 2,
        Medium::WifiDirect => 3,
        Medium::WifiHotspot => 4,
        Medium::WebRtc => 5,
    }
}

fn medium_from_tag(tag: u8) -> Option<Medium> {
    Some(match tag {
        0 => Medium::BluetoothClassic,
        1 => Medium::Ble,
        2 => Medium::WifiLan,
        3 => Medium::WifiDirect,
        4 => Medium::WifiHotspot,
        5 => Medium::WebRtc,
        _ => return None,
    })
}

/// Encodes `frame` into its wire body (version byte + kind tag + fields).
/// The caller (the endpoint channel) is responsible for the 4-byte
/// length prefix around this.
pub fn encode(frame: &OfflineFrame) -> Vec<u8> {
    let mut buf = EncoderBuffer::new();
    buf.write_u8(WIRE_VERSION);
    match frame {
        OfflineFrame::ConnectionRequest(f) => {
            buf.write_u8(Tag::ConnectionRequest as u8);
            buf.write_slice(f.endpoint_id.as_bytes());
            buf.write_len_prefixed(&f.endpoint_info);
            buf.write_u32(f.nonce as u32);
            buf.write_u8(f.supported_mediums.len() as u8);
            for m in &f.supported_mediums {
                buf.write_u8(medium_tag(*m));
            }
            buf.write_u32(f.keep_alive_interval_ms);
            buf.write_u32(f.keep_alive_timeout_ms);
            buf.write_slice(&f.extra);
        }
        OfflineFrame::ConnectionResponse(f) => {
            buf.write_u8(Tag::ConnectionResponse as u8);
            buf.write_u32(f.status as u32);
            match &f.ostensible_endpoint_info {
                Some(info) => {
                    buf.write_u8(1);
                    buf.write_len_prefixed(info);
                }
                None => buf.write_u8(0),
            }
            buf.write_slice(&f.extra);
        }
        OfflineFrame::PayloadTransfer(f) => {
            buf.write_u8(Tag::PayloadTransfer as u8);
            buf.write_i64(f.payload_id);
            buf.write_u8(match f.payload_kind {
                WirePayloadKind::Bytes => 0,
                WirePayloadKind::Stream => 1,
                WirePayloadKind::File => 2,
            });
            buf.write_i64(f.total_size);
            match &f.body {
                PayloadTransferBody::Data { offset, last, body } => {
                    buf.write_u8(0);
                    buf.write_i64(*offset);
                    buf.write_u8(u8::from(*last));
                    buf.write_len_prefixed(body);
                }
                PayloadTransferBody::Control { offset, event } => {
                    buf.write_u8(1);
                    buf.write_i64(*offset);
                    buf.write_u8(match event {
                        ControlEvent::Canceled => 0,
                        ControlEvent::ReceivedAck => 1,
                    });
                }
            }
            buf.write_slice(&f.extra);
        }
        OfflineFrame::BandwidthUpgradeNegotiation(f) => {
            buf.write_u8(Tag::BandwidthUpgradeNegotiation as u8);
            buf.write_u8(match f.event_type {
                BandwidthUpgradeEventType::UpgradePathAvailable => 0,
                BandwidthUpgradeEventType::LastWriteToPriorChannel => 1,
                BandwidthUpgradeEventType::SafeToClosePriorChannel => 2,
                BandwidthUpgradeEventType::ClientIntroduction => 3,
                BandwidthUpgradeEventType::ClientIntroductionAck => 4,
            });
            buf.write_len_prefixed(&f.medium_specific_payload);
            buf.write_slice(&f.extra);
        }
        OfflineFrame::KeepAlive(f) => {
            buf.write_u8(Tag::KeepAlive as u8);
            buf.write_slice(&f.extra);
        }
        OfflineFrame::Disconnection(f) => {
            buf.write_u8(Tag::Disconnection as u8);
            buf.write_slice(&f.extra);
        }
        OfflineFrame::PairedKeyEncryption(f) => {
            buf.write_u8(Tag::PairedKeyEncryption as u8);
            buf.write_slice(&f.opaque_bytes);
        }
    }
    buf.into_bytes()
}

/// Decodes a frame body (without the 4-byte length prefix). Fails with
/// `WireError` on an unsupported version, unknown kind tag, or a missing
/// required field — all of which map to `InvalidWireFormat` one level up.
pub fn decode(bytes: &[u8]) -> Result<OfflineFrame, WireError> {
    let buffer = DecoderBuffer::new(bytes);
    let (version, buffer) = buffer.decode_u8()?;
    if version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let (tag, buffer) = buffer.decode_u8()?;
    let tag = Tag::from_u8(tag)?;
    match tag {
        Tag::ConnectionRequest => {
            let (id_bytes, buffer) = buffer.decode_slice(4)?;
            let endpoint_id = EndpointId::new(id_bytes.try_into().unwrap())
                .ok_or(WireError::MissingSubMessage)?;
            let (endpoint_info, buffer) = buffer.decode_len_prefixed()?;
            let (nonce, buffer) = buffer.decode_u32()?;
            let (count, mut buffer) = buffer.decode_u8()?;
            let mut supported_mediums = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (tag, rest) = buffer.decode_u8()?;
                supported_mediums.push(medium_from_tag(tag).ok_or(WireError::MissingSubMessage)?);
                buffer = rest;
            }
            let (keep_alive_interval_ms, buffer) = buffer.decode_u32()?;
            let (keep_alive_timeout_ms, buffer) = buffer.decode_u32()?;
            let extra = buffer.into_less_safe_slice().to_vec();
            Ok(OfflineFrame::ConnectionRequest(ConnectionRequestFrame {
                endpoint_id,
                endpoint_info: endpoint_info.to_vec(),
                nonce: nonce as i32,
                supported_mediums,
                keep_alive_interval_ms,
                keep_alive_timeout_ms,
                extra,
            }))
        }
        Tag::ConnectionResponse => {
            let (status, buffer) = buffer.decode_u32()?;
            let (has_info, buffer) = buffer.decode_u8()?;
            let (ostensible_endpoint_info, buffer) = if has_info != 0 {
                let (info, buffer) = buffer.decode_len_prefixed()?;
                (Some(info.to_vec()), buffer)
            } else {
                (None, buffer)
            };
            let extra = buffer.into_less_safe_slice().to_vec();
            Ok(OfflineFrame::ConnectionResponse(ConnectionResponseFrame {
                status: status as i32,
                ostensible_endpoint_info,
                extra,
            }))
        }
        Tag::PayloadTransfer => {
            let (payload_id, buffer) = buffer.decode_i64()?;
            let (kind_tag, buffer) = buffer.decode_u8()?;
            let payload_kind = match kind_tag {
                0 => WirePayloadKind::Bytes,
                1 => WirePayloadKind::Stream,
                2 => WirePayloadKind::File,
                _ => return Err(WireError::MissingSubMessage),
            };
            let (total_size, buffer) = buffer.decode_i64()?;
            let (body_tag, buffer) = buffer.decode_u8()?;
            let (body, buffer) = match body_tag {
                0 => {
                    let (offset, buffer) = buffer.decode_i64()?;
                    let (last, buffer) = buffer.decode_u8()?;
                    let (body_bytes, buffer) = buffer.decode_len_prefixed()?;
                    (
                        PayloadTransferBody::Data {
                            offset,
                            last: last != 0,
                            body: body_bytes.to_vec(),
                        },
                        buffer,
                    )
                }
                1 => {
                    let (offset, buffer) = buffer.decode_i64()?;
                    let (event_tag, buffer) = buffer.decode_u8()?;
                    let event = match event_tag {
                        0 => ControlEvent::Canceled,
                        1 => ControlEvent::ReceivedAck,
                        _ => return Err(WireError::MissingSubMessage),
                    };
                    (PayloadTransferBody::Control { offset, event }, buffer)
                }
                _ => return Err(WireError::MissingSubMessage),
            };
            let extra = buffer.into_less_safe_slice().to_vec();
            Ok(OfflineFrame::PayloadTransfer(PayloadTransferFrame {
                payload_id,
                payload_kind,
                total_size,
                body,
                extra,
            }))
        }
        Tag::BandwidthUpgradeNegotiation => {
            let (event_tag, buffer) = buffer.decode_u8()?;
            let event_type = match event_tag {
                0 => BandwidthUpgradeEventType::UpgradePathAvailable,
                1 => BandwidthUpgradeEventType::LastWriteToPriorChannel,
                2 => BandwidthUpgradeEventType::SafeToClosePriorChannel,
                3 => BandwidthUpgradeEventType::ClientIntroduction,
                4 => BandwidthUpgradeEventType::ClientIntroductionAck,
                _ => return Err(WireError::MissingSubMessage),
            };
            let (medium_specific_payload, buffer) = buffer.decode_len_prefixed()?;
            let extra = buffer.into_less_safe_slice().to_vec();
            Ok(OfflineFrame::BandwidthUpgradeNegotiation(
                BandwidthUpgradeNegotiationFrame {
                    event_type,
                    medium_specific_payload: medium_specific_payload.to_vec(),
                    extra,
                },
            ))
        }
        Tag::KeepAlive => Ok(OfflineFrame::KeepAlive(KeepAliveFrame {
            extra: buffer.into_less_safe_slice().to_vec(),
        })),
        Tag::Disconnection => Ok(OfflineFrame::Disconnection(DisconnectionFrame {
            extra: buffer.into_less_safe_slice().to_vec(),
        })),
        Tag::PairedKeyEncryption => Ok(OfflineFrame::PairedKeyEncryption(
            PairedKeyEncryptionFrame {
                opaque_bytes: buffer.into_less_safe_slice().to_vec(),
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(s: &[u8; 4]) -> EndpointId {
        EndpointId::new(*s).unwrap()
    }

    #[test]
    fn connection_request_round_trips() {
        let frame = OfflineFrame::ConnectionRequest(ConnectionRequestFrame {
            endpoint_id: eid(b"ABCD"),
            endpoint_info: b"device-name".to_vec(),
            nonce: 42,
            supported_mediums: alloc::vec![Medium::WifiLan, Medium::Ble],
            keep_alive_interval_ms: 5_000,
            keep_alive_timeout_ms: 30_000,
            extra: Vec::new(),
        });
        let bytes = encode(&frame);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn keep_alive_round_trips() {
        let frame = OfflineFrame::KeepAlive(KeepAliveFrame::default());
        let bytes = encode(&frame);
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = encode(&OfflineFrame::KeepAlive(KeepAliveFrame::default()));
        bytes[0] = 7;
        assert!(matches!(decode(&bytes), Err(WireError::UnsupportedVersion(7))));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = encode(&OfflineFrame::KeepAlive(KeepAliveFrame::default()));
        bytes[1] = 99;
        assert!(matches!(decode(&bytes), Err(WireError::UnknownKind(99))));
    }

    #[test]
    fn trailing_unknown_bytes_survive_a_round_trip() {
        let frame = OfflineFrame::KeepAlive(KeepAliveFrame {
            extra: alloc::vec![1, 2, 3],
        });
        let bytes = encode(&frame);
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn payload_data_frame_round_trips() {
        let frame = OfflineFrame::PayloadTransfer(PayloadTransferFrame {
            payload_id: -99,
            payload_kind: WirePayloadKind::Stream,
            total_size: -1,
            body: PayloadTransferBody::Data {
                offset: 65536,
                last: true,
                body: alloc::vec![0xDE, 0xAD, 0xBE, 0xEF],
            },
            extra: Vec::new(),
        });
        let bytes = encode(&frame);
        assert_eq!(decode(&bytes).unwrap(), frame);
    }
}
