//! Payload data model (spec.md §3, §4.6).

use alloc::vec::Vec;

/// Sender-chosen payload identifier, unique per direction within a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadId(pub i64);

/// The three payload shapes the engine knows how to chunk/reassemble.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    Bytes,
    Stream,
    File,
}

/// The header carried on every `PayloadTransferFrame`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadHeader {
    pub id: PayloadId,
    pub kind: PayloadKind,
    /// Total size in bytes, or `-1` if unknown (streams without a declared
    /// length).
    pub total_size: i64,
}

impl PayloadHeader {
    pub fn unknown_size(id: PayloadId, kind: PayloadKind) -> Self {
        Self {
            id,
            kind,
            total_size: -1,
        }
    }

    pub fn is_size_known(&self) -> bool {
        self.total_size >= 0
    }
}

/// A payload the caller wants to send, or one being assembled on receipt.
pub struct Payload {
    pub header: PayloadHeader,
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn from_bytes(id: PayloadId, bytes: Vec<u8>) -> Self {
        let header = PayloadHeader {
            id,
            kind: PayloadKind::Bytes,
            total_size: bytes.len() as i64,
        };
        Self { header, bytes }
    }
}

/// Terminal/intermediate transfer status (spec.md §6.1 `PayloadListener`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadStatus {
    InProgress,
    Success,
    Failed,
    Canceled,
}

impl PayloadStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PayloadStatus::InProgress)
    }
}

/// Progress event raised to `PayloadListener::payload_progress`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadProgressInfo {
    pub payload_id: PayloadId,
    pub status: PayloadStatus,
    pub bytes_transferred: i64,
    pub total_bytes: i64,
}
