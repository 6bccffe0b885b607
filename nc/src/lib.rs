//! The public, client-facing facade (spec.md §6.1): wires the endpoint
//! manager, Pcp handler, payload engine, and bandwidth-upgrade manager
//! behind one `NearbyConnections` handle, the way `s2n-quic`'s facade crate
//! wraps `s2n-quic-transport` behind `Client`/`Server`.

pub mod listener;
pub mod rng;

use listener::{ConnectionListener, DiscoveryListener, FacadeSubscriber, ListenerRegistry, PayloadListener};
use nc_core::config::Config;
use nc_core::endpoint::{EndpointId, ServiceId};
use nc_core::options::{ConnectionOptions, OutOfBandMetadata};
use nc_core::payload::{PayloadHeader, PayloadId};
use nc_core::random::Generator;
use nc_core::status::Status;
use nc_transport::{
    BandwidthUpgradeManager, BandwidthUpgradeProcessor, ChannelRegistry, EndpointChannel, EndpointManager,
    IncomingFrameProcessor, MediumDriver, PayloadEngine, PayloadEngineProcessor, PayloadSource, PcpHandler,
    PcpHandlerProcessor, SessionContext,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

pub use listener::{ConnectionListener as _, DiscoveryListener as _, PayloadListener as _};
pub use nc_core::endpoint::DiscoveredEndpoint;
pub use nc_core::medium::Medium;
pub use nc_core::options::ConnectionOptions as Options;
pub use nc_core::payload::{Payload, PayloadKind, PayloadProgressInfo, PayloadStatus};
pub use nc_core::status::Status as CoreStatus;

/// One running client session. Owns its own local endpoint id, Pcp handler,
/// payload engine, bandwidth-upgrade manager, and listener registry; every
/// public method here is the Rust shape of one spec.md §6.1 API call.
pub struct NearbyConnections {
    session: Arc<SessionContext>,
    pcp: Arc<PcpHandler>,
    payloads: Arc<PayloadEngine>,
    upgrades: Arc<BandwidthUpgradeManager>,
    listeners: Arc<ListenerRegistry>,
    local_endpoint_id: EndpointId,
    rng: Arc<AsyncMutex<Box<dyn Generator>>>,
    next_payload_id: AtomicI64,
}

impl NearbyConnections {
    /// Builds a session around `local_endpoint_id` and `mediums`, and
    /// registers the Pcp handler, payload engine, and bandwidth-upgrade
    /// manager onto the endpoint manager's frame-routing table (spec.md
    /// §4.3) before returning, so every call on the returned handle sees a
    /// fully wired session.
    pub async fn new(
        config: Config,
        local_endpoint_id: EndpointId,
        mediums: Vec<Arc<dyn MediumDriver>>,
        rng: Box<dyn Generator>,
    ) -> Arc<Self> {
        let registry = Arc::new(ChannelRegistry::new());
        let manager = Arc::new(EndpointManager::new(config.clone(), registry, Arc::new(nc_transport::SystemClock::new())));
        let listeners = Arc::new(ListenerRegistry::default());
        let session = Arc::new(SessionContext::new(
            config,
            manager,
            mediums,
            Box::new(FacadeSubscriber(listeners.clone())),
        ));

        let pcp = Arc::new(PcpHandler::new(session.clone(), local_endpoint_id));
        let payloads = Arc::new(PayloadEngine::new(session.clone()));
        let upgrades = Arc::new(BandwidthUpgradeManager::new(session.clone()));
        let rng = Arc::new(AsyncMutex::new(rng));

        let this = Arc::new(Self {
            session,
            pcp,
            payloads,
            upgrades,
            listeners,
            local_endpoint_id,
            rng: rng.clone(),
            next_payload_id: AtomicI64::new(1),
        });
        this.register_processors(rng).await;
        this
    }

    async fn register_processors(self: &Arc<Self>, rng: Arc<AsyncMutex<Box<dyn Generator>>>) {
        let connection_processor: Arc<dyn IncomingFrameProcessor> = Arc::new(PcpHandlerProcessor(self.pcp.clone()));
        let payload_processor: Arc<dyn IncomingFrameProcessor> = Arc::new(PayloadEngineProcessor(self.payloads.clone()));
        let upgrade_processor: Arc<dyn IncomingFrameProcessor> = Arc::new(BandwidthUpgradeProcessor {
            manager: self.upgrades.clone(),
            local_endpoint_id: self.local_endpoint_id,
            rng,
        });

        let manager = &self.session.endpoint_manager;
        manager
            .register_processor("connection-request", connection_processor.clone())
            .await;
        manager.register_processor("connection-response", connection_processor).await;
        manager.register_processor("payload-transfer", payload_processor).await;
        manager.register_processor("bandwidth-upgrade", upgrade_processor).await;
    }

    pub fn local_endpoint_id(&self) -> EndpointId {
        self.local_endpoint_id
    }

    pub async fn start_advertising(&self, service_id: ServiceId, listener: Box<dyn ConnectionListener>) -> Status {
        self.listeners.set_connection_listener(listener);
        self.pcp.start_advertising(service_id).await
    }

    pub fn stop_advertising(&self) {
        self.pcp.stop_advertising();
    }

    pub async fn start_discovery(&self, service_id: ServiceId, listener: Box<dyn DiscoveryListener>) -> Status {
        self.listeners.set_discovery_listener(listener, service_id.clone());
        self.pcp.start_discovery(service_id).await
    }

    pub fn stop_discovery(&self) {
        self.pcp.stop_discovery();
        self.listeners.clear_discovery_listener();
    }

    pub async fn inject_endpoint(&self, service_id: ServiceId, oob_metadata: OutOfBandMetadata, endpoint_id: EndpointId) -> Status {
        self.pcp.inject_endpoint(service_id, oob_metadata, endpoint_id).await
    }

    /// Records a sighting of `endpoint_id` on `medium` — the seam a concrete
    /// radio's scan callback calls into while discovery is active, since
    /// `MediumDriver` has no `scan` method of its own (spec.md §1).
    pub async fn on_endpoint_found(&self, endpoint_id: EndpointId, endpoint_info: Vec<u8>, service_id: ServiceId, medium: Medium) {
        self.pcp.on_endpoint_found(endpoint_id, endpoint_info, service_id, medium).await;
    }

    /// Removes one medium's sighting of `endpoint_id`, the counterpart scan
    /// callback for a radio that has lost sight of a previously found peer.
    pub async fn on_endpoint_lost(&self, endpoint_id: EndpointId, medium: Medium) {
        self.pcp.on_endpoint_lost(endpoint_id, medium).await;
    }

    pub async fn request_connection(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        endpoint_info: Vec<u8>,
        options: ConnectionOptions,
    ) -> Status {
        if options.validate().is_err() {
            return Status::Error;
        }
        let mut rng = self.rng.lock().await;
        self.pcp.request_connection(endpoint_id, endpoint_info, options, &mut **rng).await
    }

    /// Feeds in an inbound channel a medium driver has already connected —
    /// the seam a concrete radio's accept loop calls into, since
    /// `MediumDriver` only exposes `connect`, never `listen` (spec.md §1:
    /// radio drivers are an external collaborator, not specified here).
    pub async fn accept_inbound_channel(self: &Arc<Self>, endpoint_id: EndpointId, channel: Arc<EndpointChannel>) -> Status {
        let mut rng = self.rng.lock().await;
        self.pcp.accept_inbound_channel(endpoint_id, channel, &mut **rng).await
    }

    pub async fn accept_connection(&self, endpoint_id: EndpointId, payload_listener: Box<dyn PayloadListener>) -> Status {
        self.listeners.set_payload_listener(endpoint_id, payload_listener);
        let status = self.pcp.accept_connection(endpoint_id).await;
        if status != Status::Success {
            self.listeners.remove_payload_listener(endpoint_id);
        }
        status
    }

    pub async fn reject_connection(&self, endpoint_id: EndpointId) -> Status {
        self.pcp.reject_connection(endpoint_id).await
    }

    /// Sends `source` to every id in `endpoint_ids` under a freshly
    /// generated payload id, returning that id so the caller can later
    /// `cancel_payload` it. Ids with no live channel are dropped before the
    /// send starts; `NotConnectedToEndpoint` if none are live.
    pub async fn send_payload(
        self: &Arc<Self>,
        endpoint_ids: Vec<EndpointId>,
        kind: PayloadKind,
        total_size: i64,
        source: PayloadSource,
    ) -> (PayloadId, Status) {
        let mut live = Vec::with_capacity(endpoint_ids.len());
        for endpoint_id in endpoint_ids {
            if self.session.endpoint_manager.registry().get(endpoint_id).await.is_some() {
                live.push(endpoint_id);
            }
        }
        if live.is_empty() {
            return (PayloadId(0), Status::NotConnectedToEndpoint);
        }

        let id = PayloadId(self.next_payload_id.fetch_add(1, Ordering::Relaxed));
        let header = PayloadHeader { id, kind, total_size };
        self.payloads.send(live, header, source).await;
        (id, Status::Success)
    }

    pub async fn cancel_payload(&self, payload_id: PayloadId) -> Status {
        if self.payloads.cancel(payload_id).await {
            Status::Success
        } else {
            Status::PayloadUnknown
        }
    }

    pub async fn disconnect_from_endpoint(&self, endpoint_id: EndpointId) {
        self.listeners.remove_payload_listener(endpoint_id);
        self.pcp.disconnect_from_endpoint(endpoint_id).await;
    }

    /// Initiates a bandwidth upgrade to `target_medium` for an already
    /// connected endpoint (spec.md §4.7); `false` if one is already in
    /// flight for that endpoint.
    pub async fn upgrade_bandwidth(&self, endpoint_id: EndpointId, target_medium: Medium) -> bool {
        self.upgrades.trigger_upgrade(endpoint_id, target_medium).await
    }

    /// Stops advertising and discovery and clears listener registrations
    /// (spec.md §6.1 `Stop`). In-flight connections are left for the caller
    /// to tear down individually via `disconnect_from_endpoint`, matching
    /// `PcpHandler`'s own scope (it has no bulk-disconnect operation).
    pub fn stop(&self) {
        self.pcp.stop_advertising();
        self.pcp.stop_discovery();
        self.listeners.clear_discovery_listener();
    }
}
