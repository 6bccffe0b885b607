//! Per-endpoint multiplexing: a reader loop and a keep-alive loop per
//! registered endpoint, plus the frame-kind → processor routing table
//! (spec.md §4.3).
//!
//! Grounded on `cpp/core/internal/endpoint_manager.cc`: one
//! `IncomingOfflineFrameProcessor` per frame kind (a map, not a
//! multi-subscriber list — registering a second processor for a kind that
//! already has one replaces it, matching
//! `registerIncomingOfflineFrameProcessor`'s `map[frame_type] = processor`),
//! a three-way exception discrimination on read (`INVALID_PROTOCOL_BUFFER`
//! continues, `IO` re-fetches and discards on repeated failure,
//! cancellation stops outright), and the keep-alive loop's
//! write-interval/read-timeout pair.

use crate::channel::{ChannelError, ChannelRegistry, EndpointChannel};
use crate::clock::Clock;
use nc_core::config::Config;
use nc_core::endpoint::EndpointId;
use nc_core::frame::OfflineFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Per-endpoint keep-alive timing, overriding `Config`'s session-wide default
/// once the two peers have negotiated their own interval/timeout over a
/// `ConnectionRequestFrame` (spec.md §4.1).
#[derive(Clone, Copy, Debug)]
pub struct KeepAliveParams {
    pub write_interval_ms: u64,
    pub read_timeout_ms: u64,
}

/// Routes one frame kind's traffic to whoever registered for it. Also
/// notified when its endpoint disconnects, mirroring the original's
/// `IncomingOfflineFrameProcessor::processEndpointDisconnection`.
pub trait IncomingFrameProcessor: Send + Sync {
    fn process(&self, endpoint_id: EndpointId, frame: OfflineFrame);

    fn on_endpoint_disconnected(&self, endpoint_id: EndpointId) {
        let _ = endpoint_id;
    }
}

struct Registration {
    channel: Arc<EndpointChannel>,
    cancel: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    keep_alive: JoinHandle<()>,
    keep_alive_params: Arc<RwLock<KeepAliveParams>>,
}

/// Owns the reader/keep-alive task pair for every registered endpoint and
/// the frame-kind routing table. Processor-registry mutations are funneled
/// through `&self` methods backed by an `RwLock`, playing the role the
/// original's single serial executor thread plays (spec.md §5) without
/// requiring an actual dedicated thread.
pub struct EndpointManager {
    config: Config,
    registry: Arc<ChannelRegistry>,
    clock: Arc<dyn Clock>,
    endpoints: RwLock<HashMap<EndpointId, Registration>>,
    processors: RwLock<HashMap<&'static str, Arc<dyn IncomingFrameProcessor>>>,
}

impl EndpointManager {
    pub fn new(config: Config, registry: Arc<ChannelRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            registry,
            clock,
            endpoints: RwLock::new(HashMap::new()),
            processors: RwLock::new(HashMap::new()),
        }
    }

    fn default_keep_alive(&self) -> KeepAliveParams {
        KeepAliveParams {
            write_interval_ms: self.config.keep_alive_write_interval_ms,
            read_timeout_ms: self.config.keep_alive_read_timeout_ms,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Only exact-instance removal is honored (`Arc::ptr_eq`), matching the
    /// original's identity-based processor unregistration.
    pub async fn register_processor(&self, kind: &'static str, processor: Arc<dyn IncomingFrameProcessor>) {
        self.processors.write().await.insert(kind, processor);
    }

    pub async fn unregister_processor(&self, kind: &'static str, processor: &Arc<dyn IncomingFrameProcessor>) {
        let mut processors = self.processors.write().await;
        if let Some(existing) = processors.get(kind) {
            if Arc::ptr_eq(existing, processor) {
                processors.remove(kind);
            }
        }
    }

    /// Registers `channel` for `endpoint_id` and starts its reader and
    /// keep-alive loops. Returns only after both tasks have been spawned,
    /// matching the original's `Register` blocking on a latch until state
    /// is live. `keep_alive` overrides `Config`'s session-wide default when
    /// the negotiated values are already known (e.g. the requester side,
    /// which sent them in its own `ConnectionRequestFrame`); pass `None`
    /// when they won't be known until a frame arrives and call
    /// `set_keep_alive` once it does.
    pub async fn register(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        channel: Arc<EndpointChannel>,
        keep_alive: Option<KeepAliveParams>,
    ) {
        self.registry.register(endpoint_id, channel.clone()).await;

        let cancel = Arc::new(AtomicBool::new(false));
        let keep_alive_params = Arc::new(RwLock::new(keep_alive.unwrap_or_else(|| self.default_keep_alive())));
        let reader = tokio::spawn(Self::reader_loop(self.clone(), endpoint_id, cancel.clone()));
        let keep_alive_task = tokio::spawn(Self::keep_alive_loop(
            self.clone(),
            endpoint_id,
            cancel.clone(),
            keep_alive_params.clone(),
        ));

        self.endpoints.write().await.insert(
            endpoint_id,
            Registration {
                channel,
                cancel,
                reader,
                keep_alive: keep_alive_task,
                keep_alive_params,
            },
        );
    }

    /// Applies negotiated keep-alive timing to an already-registered
    /// endpoint. A no-op if the endpoint isn't registered (e.g. it
    /// disconnected between the frame being parsed and this call running).
    pub async fn set_keep_alive(&self, endpoint_id: EndpointId, params: KeepAliveParams) {
        if let Some(registration) = self.endpoints.read().await.get(&endpoint_id) {
            *registration.keep_alive_params.write().await = params;
        }
    }

    /// Cooperatively stops the endpoint's two loops and notifies every
    /// registered processor of the disconnection, bounded by
    /// `process_disconnection_timeout_ms`.
    pub async fn unregister(&self, endpoint_id: EndpointId) {
        let registration = self.endpoints.write().await.remove(&endpoint_id);
        let Some(registration) = registration else {
            return;
        };
        registration.cancel.store(true, Ordering::Release);
        registration.channel.close().await;

        let deadline = tokio::time::Duration::from_millis(self.config.process_disconnection_timeout_ms);
        let _ = tokio::time::timeout(deadline, async {
            let _ = registration.reader.await;
            let _ = registration.keep_alive.await;
        })
        .await;

        self.registry.unregister(endpoint_id).await;

        // The same processor may be registered under more than one frame
        // kind (e.g. both connection-request and connection-response); it
        // should still only hear about a disconnection once.
        let mut notified: Vec<*const ()> = Vec::new();
        for processor in self.processors.read().await.values() {
            let ptr = Arc::as_ptr(processor) as *const ();
            if notified.contains(&ptr) {
                continue;
            }
            notified.push(ptr);
            processor.on_endpoint_disconnected(endpoint_id);
        }
    }

    /// Best-effort broadcast; returns the ids whose write failed
    /// (spec.md §4.3/§4.6 `failed_ids`). Fans out serially, so one slow
    /// peer never blocks delivery to the others from completing.
    pub async fn send_payload_chunk(
        &self,
        frame: &OfflineFrame,
        endpoint_ids: &[EndpointId],
    ) -> Vec<EndpointId> {
        let mut failed = Vec::new();
        for &endpoint_id in endpoint_ids {
            let channel = self.registry.get(endpoint_id).await;
            let ok = match channel {
                Some(channel) => channel.write(frame, next_iv()).await.is_ok(),
                None => false,
            };
            if !ok {
                failed.push(endpoint_id);
            }
        }
        failed
    }

    async fn reader_loop(manager: Arc<Self>, endpoint_id: EndpointId, cancel: Arc<AtomicBool>) {
        let mut last_failed_medium = None;
        loop {
            if cancel.load(Ordering::Acquire) {
                return;
            }
            let Some(channel) = manager.registry.get(endpoint_id).await else {
                return;
            };

            match channel.read(manager.clock.now_ms()).await {
                Ok(frame) => {
                    last_failed_medium = None;
                    let kind = frame.kind_name();
                    let processor = manager.processors.read().await.get(kind).cloned();
                    match processor {
                        Some(processor) => processor.process(endpoint_id, frame),
                        None => tracing::warn!(endpoint_id = %endpoint_id, kind, "no processor registered for frame kind"),
                    }
                }
                Err(ChannelError::Wire(error)) => {
                    tracing::warn!(endpoint_id = %endpoint_id, %error, "discarding malformed frame");
                }
                Err(ChannelError::Canceled) => return,
                Err(_) => {
                    // IO/Eof/Closed: re-fetch. If the channel is unchanged
                    // (same medium as our last failure), it hasn't been
                    // swapped out from under us, so it's genuinely dead.
                    if last_failed_medium == Some(channel.medium()) {
                        manager.unregister(endpoint_id).await;
                        return;
                    }
                    last_failed_medium = Some(channel.medium());
                }
            }
        }
    }

    async fn keep_alive_loop(
        manager: Arc<Self>,
        endpoint_id: EndpointId,
        cancel: Arc<AtomicBool>,
        keep_alive_params: Arc<RwLock<KeepAliveParams>>,
    ) {
        loop {
            let params = *keep_alive_params.read().await;
            tokio::time::sleep(tokio::time::Duration::from_millis(params.write_interval_ms)).await;
            if cancel.load(Ordering::Acquire) {
                return;
            }
            let Some(channel) = manager.registry.get(endpoint_id).await else {
                return;
            };

            let now = manager.clock.now_ms();
            let last_read = channel.last_read_timestamp_ms();
            let read_timeout_ms = keep_alive_params.read().await.read_timeout_ms as i64;
            if last_read >= 0 && now - last_read > read_timeout_ms {
                manager.unregister(endpoint_id).await;
                return;
            }

            if channel
                .write(
                    &OfflineFrame::KeepAlive(nc_core::frame::KeepAliveFrame::default()),
                    next_iv(),
                )
                .await
                .is_err()
            {
                manager.unregister(endpoint_id).await;
                return;
            }
        }
    }
}

fn next_iv() -> [u8; 16] {
    use std::sync::atomic::AtomicU64;
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let value = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&value.to_be_bytes());
    iv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::FakeClock;
    use crate::clock::SystemClock;
    use nc_core::medium::Medium;
    use std::sync::Mutex as StdMutex;

    struct RecordingProcessor {
        seen: StdMutex<Vec<EndpointId>>,
        disconnected: StdMutex<Vec<EndpointId>>,
    }

    impl IncomingFrameProcessor for RecordingProcessor {
        fn process(&self, endpoint_id: EndpointId, _frame: OfflineFrame) {
            self.seen.lock().unwrap().push(endpoint_id);
        }

        fn on_endpoint_disconnected(&self, endpoint_id: EndpointId) {
            self.disconnected.lock().unwrap().push(endpoint_id);
        }
    }

    #[tokio::test]
    async fn routes_a_frame_to_its_registered_processor_and_discards_unknown_kinds() {
        let registry = Arc::new(ChannelRegistry::new());
        let manager = Arc::new(EndpointManager::new(
            Config::default(),
            registry,
            Arc::new(SystemClock::new()),
        ));
        let processor = Arc::new(RecordingProcessor {
            seen: StdMutex::new(Vec::new()),
            disconnected: StdMutex::new(Vec::new()),
        });
        manager
            .register_processor("keep-alive", processor.clone() as Arc<dyn IncomingFrameProcessor>)
            .await;

        let (a, b) = tokio::io::duplex(4096);
        let id = EndpointId::new(*b"EEEE").unwrap();
        let chan_a = Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(a)));
        manager
            .register(id, Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(b))), None)
            .await;

        chan_a
            .write(
                &OfflineFrame::KeepAlive(nc_core::frame::KeepAliveFrame::default()),
                [0u8; 16],
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(processor.seen.lock().unwrap().as_slice(), &[id]);

        manager.unregister(id).await;
        assert_eq!(processor.disconnected.lock().unwrap().as_slice(), &[id]);
    }

    #[tokio::test]
    async fn send_payload_chunk_reports_endpoints_with_no_live_channel_as_failed() {
        let registry = Arc::new(ChannelRegistry::new());
        let manager = Arc::new(EndpointManager::new(
            Config::default(),
            registry,
            Arc::new(SystemClock::new()),
        ));
        let unknown = EndpointId::new(*b"ZZZZ").unwrap();

        let failed = manager
            .send_payload_chunk(
                &OfflineFrame::KeepAlive(nc_core::frame::KeepAliveFrame::default()),
                &[unknown],
            )
            .await;
        assert_eq!(failed, vec![unknown]);
    }

    #[tokio::test]
    async fn keep_alive_loop_disconnects_once_the_fake_clock_passes_the_read_timeout() {
        let registry = Arc::new(ChannelRegistry::new());
        let clock = Arc::new(FakeClock::new(0));
        let mut config = Config::default();
        config.keep_alive_write_interval_ms = 5;
        config.keep_alive_read_timeout_ms = 20;
        let manager = Arc::new(EndpointManager::new(config, registry, clock.clone()));

        let (a, b) = tokio::io::duplex(4096);
        let chan_a = Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(a)));
        let id = EndpointId::new(*b"KKKK").unwrap();
        manager
            .register(id, Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(b))), None)
            .await;

        // One frame lands so `last_read_timestamp_ms` is set; the loop must
        // not trip the timeout on its first tick right after.
        chan_a
            .write(
                &OfflineFrame::KeepAlive(nc_core::frame::KeepAliveFrame::default()),
                [0u8; 16],
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(manager.registry.get(id).await.is_some());

        clock.advance(100);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(manager.registry.get(id).await.is_none());
    }
}
