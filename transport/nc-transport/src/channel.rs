//! The endpoint channel (spec.md §4.2): a framed, ordered, optionally
//! encrypted byte pipe over one medium, plus the registry that owns
//! channels exclusively so other components can only hold an endpoint id
//! and re-look-up (spec.md §9 "shared pointer graphs over channels").
//!
//! Grounded on `s2n-quic-transport`'s `connection::id::Map`-style "registry
//! keyed by id, accessed through a lock" shape, and on the original
//! `core/internal/endpoint_channel.h`'s read/write/pause/resume/close
//! contract.

use nc_core::frame::{self, OfflineFrame, WireError};
use nc_core::medium::Medium;
use nc_crypto::d2d::D2dContext;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify, RwLock};

use nc_core::endpoint::EndpointId;

/// Any byte stream a medium driver can hand back. `tokio::io::DuplexStream`
/// (used by the test harness) and a real socket both satisfy this.
pub trait RawTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawTransport for T {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("I/O error on the endpoint channel")]
    Io,
    #[error("the channel reached end-of-stream")]
    Eof,
    #[error("a frame failed to decode: {0}")]
    Wire(WireError),
    #[error("the read was canceled")]
    Canceled,
    #[error("the channel is closed")]
    Closed,
}

impl From<WireError> for ChannelError {
    fn from(value: WireError) -> Self {
        ChannelError::Wire(value)
    }
}

const LENGTH_PREFIX_LEN: usize = 4;

/// A framed, pausable, optionally-encrypted transport for one endpoint over
/// one medium. Exclusively owned by a `ChannelRegistry` once registered
/// (spec.md §3 "Ownership rules").
pub struct EndpointChannel {
    medium: Medium,
    transport: Mutex<Box<dyn RawTransport>>,
    paused: AtomicBool,
    resume: Notify,
    closed: AtomicBool,
    last_read_timestamp_ms: AtomicI64,
    encryption: Mutex<Option<ChannelEncryption>>,
}

struct ChannelEncryption {
    d2d: D2dContext,
}

impl EndpointChannel {
    pub fn new(medium: Medium, transport: Box<dyn RawTransport>) -> Self {
        Self {
            medium,
            transport: Mutex::new(transport),
            paused: AtomicBool::new(false),
            resume: Notify::new(),
            closed: AtomicBool::new(false),
            last_read_timestamp_ms: AtomicI64::new(-1),
            encryption: Mutex::new(None),
        }
    }

    pub fn medium(&self) -> Medium {
        self.medium
    }

    pub fn last_read_timestamp_ms(&self) -> i64 {
        self.last_read_timestamp_ms.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Installs the signcryption context derived from a completed UKEY2
    /// handshake (spec.md §4.4). `D2dContext` already distinguishes its two
    /// derived key pairs internally, one per direction.
    pub async fn enable_encryption(&self, d2d: D2dContext) {
        *self.encryption.lock().await = Some(ChannelEncryption { d2d });
    }

    /// Blocks until a complete frame is available. While paused, blocks
    /// until `resume()` is called without dropping any data already
    /// buffered by the underlying transport (spec.md §4.2).
    pub async fn read(&self, now_ms: i64) -> Result<OfflineFrame, ChannelError> {
        while self.paused.load(Ordering::Acquire) {
            self.resume.notified().await;
        }
        let body = self.read_raw(now_ms).await?;

        let plaintext = {
            let mut encryption = self.encryption.lock().await;
            if let Some(enc) = encryption.as_mut() {
                let sealed = nc_crypto::d2d::SealedMessage(body);
                enc.d2d.verify_decrypt(&sealed).map_err(|_| ChannelError::Io)?
            } else {
                body
            }
        };

        Ok(frame::decode(&plaintext)?)
    }

    /// Writes one frame atomically: a write of the length prefix followed
    /// by the body never interleaves with another writer because the
    /// transport is held under one lock for the duration (spec.md §4.2
    /// "atomic from the reader's perspective").
    pub async fn write(&self, frame: &OfflineFrame, iv: [u8; 16]) -> Result<(), ChannelError> {
        let plaintext = frame::encode(frame);

        let body = {
            let mut encryption = self.encryption.lock().await;
            if let Some(enc) = encryption.as_mut() {
                enc.d2d.signcrypt(iv, &plaintext).0
            } else {
                plaintext
            }
        };

        self.write_raw(&body).await
    }

    /// Reads one length-prefixed message with no frame decoding or
    /// decryption applied — used by the secure handshake (spec.md §4.4),
    /// which runs before any `OfflineFrame` traffic and before encryption is
    /// installed.
    pub async fn read_raw(&self, now_ms: i64) -> Result<Vec<u8>, ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        let mut transport = self.transport.lock().await;
        let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
        match transport.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ChannelError::Eof)
            }
            Err(_) => return Err(ChannelError::Io),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        let mut body = vec![0u8; len];
        transport.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ChannelError::Eof
            } else {
                ChannelError::Io
            }
        })?;
        drop(transport);

        self.last_read_timestamp_ms.store(now_ms, Ordering::Release);
        Ok(body)
    }

    /// Writes one length-prefixed message with no frame encoding or
    /// encryption applied. See `read_raw`.
    pub async fn write_raw(&self, body: &[u8]) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let mut transport = self.transport.lock().await;
        transport
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .map_err(|_| ChannelError::Io)?;
        transport.write_all(body).await.map_err(|_| ChannelError::Io)?;
        transport.flush().await.map_err(|_| ChannelError::Io)?;
        Ok(())
    }

    /// Blocks further reads until `resume()`. Used during bandwidth upgrade
    /// while the sender drains in-flight frames on the new channel.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resume.notify_waiters();
    }

    /// Idempotent; subsequent reads observe `ChannelError::Closed`.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut transport = self.transport.lock().await;
            let _ = transport.shutdown().await;
            self.resume.notify_waiters();
        }
    }
}

/// Owns every registered `EndpointChannel` exclusively. Every other
/// component (endpoint manager, bandwidth-upgrade manager) holds only an
/// `EndpointId` and re-fetches through this registry, so a channel swap
/// during an upgrade is invisible to anyone not actively re-reading
/// (spec.md §9 "channels owned by registry exclusively, others re-lookup").
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<EndpointId, Arc<EndpointChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, endpoint_id: EndpointId, channel: Arc<EndpointChannel>) {
        self.channels.write().await.insert(endpoint_id, channel);
    }

    /// Replaces the channel for `endpoint_id`, returning the previous one if
    /// present (used by the bandwidth-upgrade manager's atomic swap).
    pub async fn swap(
        &self,
        endpoint_id: EndpointId,
        channel: Arc<EndpointChannel>,
    ) -> Option<Arc<EndpointChannel>> {
        self.channels.write().await.insert(endpoint_id, channel)
    }

    pub async fn get(&self, endpoint_id: EndpointId) -> Option<Arc<EndpointChannel>> {
        self.channels.read().await.get(&endpoint_id).cloned()
    }

    /// Returns the removed channel, if any, without closing it — the caller
    /// decides whether to close (unregistering during an upgrade swap must
    /// not close the channel it just replaced-away).
    pub async fn unregister(&self, endpoint_id: EndpointId) -> Option<Arc<EndpointChannel>> {
        self.channels.write().await.remove(&endpoint_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_core::frame::KeepAliveFrame;

    #[tokio::test]
    async fn writes_and_reads_a_frame_unencrypted() {
        let (a, b) = tokio::io::duplex(4096);
        let chan_a = EndpointChannel::new(Medium::WifiLan, Box::new(a));
        let chan_b = EndpointChannel::new(Medium::WifiLan, Box::new(b));

        chan_a
            .write(
                &OfflineFrame::KeepAlive(KeepAliveFrame::default()),
                [0u8; 16],
            )
            .await
            .unwrap();
        let frame = chan_b.read(0).await.unwrap();
        assert_eq!(frame, OfflineFrame::KeepAlive(KeepAliveFrame::default()));
        assert!(chan_b.last_read_timestamp_ms() >= 0);
    }

    #[tokio::test]
    async fn pause_blocks_reads_until_resume() {
        let (a, b) = tokio::io::duplex(4096);
        let chan_a = Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(a)));
        let chan_b = Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(b)));
        chan_b.pause();

        let reader = {
            let chan_b = chan_b.clone();
            tokio::spawn(async move { chan_b.read(0).await })
        };
        chan_a
            .write(
                &OfflineFrame::KeepAlive(KeepAliveFrame::default()),
                [0u8; 16],
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!reader.is_finished());
        chan_b.resume();
        let frame = reader.await.unwrap().unwrap();
        assert_eq!(frame, OfflineFrame::KeepAlive(KeepAliveFrame::default()));
    }

    #[tokio::test]
    async fn registry_swap_returns_the_previous_channel() {
        let registry = ChannelRegistry::new();
        let id = EndpointId::new(*b"ABCD").unwrap();
        let (a1, _b1) = tokio::io::duplex(64);
        let (a2, _b2) = tokio::io::duplex(64);
        let first = Arc::new(EndpointChannel::new(Medium::Ble, Box::new(a1)));
        let second = Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(a2)));

        registry.register(id, first.clone()).await;
        let previous = registry.swap(id, second.clone()).await.unwrap();
        assert_eq!(previous.medium(), Medium::Ble);
        assert_eq!(registry.get(id).await.unwrap().medium(), Medium::WifiLan);
    }
}
