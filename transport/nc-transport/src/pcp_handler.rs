//! The P2P control point: advertise/discover/request/accept/reject state
//! machine (spec.md §4.5), grounded on
//! `cpp/core_v2/internal/base_pcp_handler_test.cc`'s exercised transitions
//! (mutual accept, mutual reject, simultaneous request tie-break).

use crate::channel::EndpointChannel;
use crate::endpoint_manager::{IncomingFrameProcessor, KeepAliveParams};
use crate::handshake;
use crate::medium::MediumDriver;
use crate::session::SessionContext;
use nc_core::endpoint::{DiscoveredEndpoint, EndpointId, ServiceId};
use nc_core::error::ErrorKind;
use nc_core::event::ConnectionInitiated;
use nc_core::frame::{ConnectionRequestFrame, ConnectionResponseFrame, OfflineFrame};
use nc_core::medium::Medium;
use nc_core::options::{ConnectionOptions, OutOfBandMetadata};
use nc_core::random::Generator;
use nc_core::status::Status;
use nc_crypto::ukey2::verification_string;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

const RESPONSE_SUCCESS: i32 = 0;
const RESPONSE_REJECTED: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingPhase {
    Initiated,
    Connected,
    Rejected,
}

struct PendingConnection {
    is_outgoing: bool,
    local_accept: Option<bool>,
    remote_accept: Option<bool>,
    phase: PendingPhase,
    cancel: Arc<AtomicBool>,
    /// The remote's advertised info: the discovered endpoint's on the
    /// outgoing side, the arriving `ConnectionRequestFrame`'s on the
    /// incoming side, optionally corroborated later by a
    /// `ConnectionResponseFrame`'s `ostensible_endpoint_info`.
    remote_info: Vec<u8>,
    /// `nc_crypto::ukey2::verification_string` of this connection's
    /// `MasterSecret`, surfaced to both sides via `ConnectionInitiated` so
    /// their users can compare it out of band before accepting.
    raw_auth_token: Vec<u8>,
}

/// Per-client-session state machine. One instance corresponds to one
/// `nearby_connections` facade handle.
pub struct PcpHandler {
    session: Arc<SessionContext>,
    local_endpoint_id: EndpointId,
    service_id: Mutex<Option<ServiceId>>,
    advertising: AtomicBool,
    discovering: AtomicBool,
    discovered: Mutex<HashMap<EndpointId, DiscoveredEndpoint>>,
    pending: Mutex<HashMap<EndpointId, PendingConnection>>,
    /// Auth tokens for inbound channels whose handshake finished before the
    /// `ConnectionRequestFrame` that creates their `PendingConnection`
    /// arrives; drained by `on_connection_request`.
    handshaken_auth_tokens: Mutex<HashMap<EndpointId, Vec<u8>>>,
    next_nonce: AtomicI32,
}

impl PcpHandler {
    pub fn new(session: Arc<SessionContext>, local_endpoint_id: EndpointId) -> Self {
        Self {
            session,
            local_endpoint_id,
            service_id: Mutex::new(None),
            advertising: AtomicBool::new(false),
            discovering: AtomicBool::new(false),
            discovered: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            handshaken_auth_tokens: Mutex::new(HashMap::new()),
            next_nonce: AtomicI32::new(1),
        }
    }

    pub async fn start_advertising(&self, service_id: ServiceId) -> Status {
        if self.advertising.swap(true, Ordering::AcqRel) {
            return Status::AlreadyAdvertising;
        }
        *self.service_id.lock().await = Some(service_id);
        Status::Success
    }

    pub fn stop_advertising(&self) {
        self.advertising.store(false, Ordering::Release);
    }

    pub async fn start_discovery(&self, service_id: ServiceId) -> Status {
        if self.discovering.swap(true, Ordering::AcqRel) {
            return Status::AlreadyDiscovering;
        }
        *self.service_id.lock().await = Some(service_id);
        Status::Success
    }

    pub fn stop_discovery(&self) {
        self.discovering.store(false, Ordering::Release);
    }

    /// Records a sighting of `endpoint_id` via `medium`, raising
    /// `endpoint_found` only on the first medium to see it (spec.md §4.5:
    /// "losing one medium does not emit `EndpointLost`").
    pub async fn on_endpoint_found(
        &self,
        endpoint_id: EndpointId,
        endpoint_info: Vec<u8>,
        service_id: ServiceId,
        medium: Medium,
    ) {
        let mut discovered = self.discovered.lock().await;
        let is_new = match discovered.get_mut(&endpoint_id) {
            Some(existing) => existing.record_sighting(medium),
            None => {
                discovered.insert(
                    endpoint_id,
                    DiscoveredEndpoint::new(endpoint_id, endpoint_info.clone(), service_id, medium),
                );
                true
            }
        };
        drop(discovered);
        if is_new {
            let mut subscriber = self.session.subscriber.lock().await;
            subscriber.on_endpoint_found(&nc_core::event::EndpointFound {
                endpoint_id,
                endpoint_info: &endpoint_info,
            });
        }
    }

    /// Removes one medium's sighting of `endpoint_id`; raises
    /// `endpoint_lost` only when that was the last medium tracking it.
    pub async fn on_endpoint_lost(&self, endpoint_id: EndpointId, medium: Medium) {
        let mut discovered = self.discovered.lock().await;
        let lost_entirely = match discovered.get_mut(&endpoint_id) {
            Some(existing) => existing.remove_sighting(medium),
            None => false,
        };
        if lost_entirely {
            discovered.remove(&endpoint_id);
        }
        drop(discovered);
        if lost_entirely {
            self.session.subscriber.lock().await.on_endpoint_lost(endpoint_id);
        }
    }

    /// Bypasses discovery: installs a synthetic `DiscoveredEndpoint` backed
    /// by out-of-band metadata, and fires `endpoint_found` synchronously
    /// (spec.md §4.5, E6).
    pub async fn inject_endpoint(&self, service_id: ServiceId, oob: OutOfBandMetadata, endpoint_id: EndpointId) -> Status {
        let mut discovered = self.discovered.lock().await;
        let entry = discovered
            .entry(endpoint_id)
            .or_insert_with(|| DiscoveredEndpoint::new(endpoint_id, Vec::new(), service_id, oob.medium));
        for sighting in entry.mediums.iter_mut() {
            if sighting.medium == oob.medium {
                sighting.oob_metadata = Some(oob.remote_address.clone());
            }
        }
        drop(discovered);
        self.session.subscriber.lock().await.on_endpoint_found(&nc_core::event::EndpointFound {
            endpoint_id,
            endpoint_info: &[],
        });
        Status::Success
    }

    /// Drives a connection attempt to `endpoint_id`: dials the highest
    /// priority medium that succeeds, runs the secure handshake, exchanges
    /// `ConnectionRequest`/waits for the remote's response (spec.md §4.5
    /// steps 1-6).
    pub async fn request_connection(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        endpoint_info: Vec<u8>,
        options: ConnectionOptions,
        rng: &mut dyn Generator,
    ) -> Status {
        if self.pending.lock().await.contains_key(&endpoint_id) {
            return Status::OutOfOrderApiCall;
        }

        let discovered = self.discovered.lock().await.get(&endpoint_id).cloned();
        let Some(discovered) = discovered else {
            return Status::EndpointUnknown;
        };

        let channel = match self.connect_over_priority(&discovered, &options).await {
            Some(channel) => channel,
            None => return Status::Error,
        };

        let cancel = Arc::new(AtomicBool::new(false));
        self.pending.lock().await.insert(
            endpoint_id,
            PendingConnection {
                is_outgoing: true,
                local_accept: None,
                remote_accept: None,
                phase: PendingPhase::Initiated,
                cancel,
                remote_info: discovered.endpoint_info.clone(),
                raw_auth_token: Vec::new(),
            },
        );

        match self.run_handshake_and_request(endpoint_id, endpoint_info, &options, channel, rng).await {
            Ok(()) => Status::Success,
            Err(status) => {
                self.pending.lock().await.remove(&endpoint_id);
                status
            }
        }
    }

    async fn connect_over_priority(
        &self,
        discovered: &DiscoveredEndpoint,
        options: &ConnectionOptions,
    ) -> Option<Arc<EndpointChannel>> {
        let priority: Vec<_> = Medium::default_discovery_priority()
            .iter()
            .copied()
            .filter(|m| options.allowed_mediums.contains(m))
            .collect();

        // `primary_medium` picks the single best candidate this endpoint was
        // actually sighted over; the rest of the tracked, allowed mediums
        // follow in discovery order as fallbacks if it fails to connect.
        let mut order = Vec::new();
        if let Some(primary) = discovered.primary_medium(&priority) {
            order.push(primary);
        }
        for sighting in &discovered.mediums {
            if options.allowed_mediums.contains(&sighting.medium) && !order.contains(&sighting.medium) {
                order.push(sighting.medium);
            }
        }

        for medium in order {
            let Some(driver) = self.session.mediums.get(&medium) else {
                continue;
            };
            let oob = discovered
                .mediums
                .iter()
                .find(|m| m.medium == medium)
                .and_then(|m| m.oob_metadata.as_deref());
            if let Ok(transport) = driver.connect(discovered.endpoint_id, oob).await {
                return Some(Arc::new(EndpointChannel::new(medium, transport)));
            }
        }
        None
    }

    async fn run_handshake_and_request(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        endpoint_info: Vec<u8>,
        options: &ConnectionOptions,
        channel: Arc<EndpointChannel>,
        rng: &mut dyn Generator,
    ) -> Result<(), Status> {
        let role = handshake::resolve_role(self.local_endpoint_id, endpoint_id);
        let (d2d, master) = handshake::run(&channel, role, rng)
            .await
            .map_err(|e| ErrorKind::from(e).to_status())?;
        channel.enable_encryption(d2d).await;

        let keep_alive = KeepAliveParams {
            write_interval_ms: options.keep_alive_interval_ms as u64,
            read_timeout_ms: options.keep_alive_timeout_ms as u64,
        };
        self.session
            .endpoint_manager
            .register(endpoint_id, channel.clone(), Some(keep_alive))
            .await;

        let auth_token = verification_string(&master);
        let remote_info = {
            let mut pending = self.pending.lock().await;
            let Some(connection) = pending.get_mut(&endpoint_id) else {
                return Err(Status::OutOfOrderApiCall);
            };
            connection.raw_auth_token = auth_token.clone();
            connection.remote_info.clone()
        };

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let request = OfflineFrame::ConnectionRequest(ConnectionRequestFrame {
            endpoint_id: self.local_endpoint_id,
            endpoint_info,
            nonce,
            supported_mediums: options.allowed_mediums.clone(),
            keep_alive_interval_ms: options.keep_alive_interval_ms,
            keep_alive_timeout_ms: options.keep_alive_timeout_ms,
            extra: Vec::new(),
        });
        channel
            .write(&request, iv_for_nonce(nonce))
            .await
            .map_err(|_| ErrorKind::Io.to_status())?;

        self.session.subscriber.lock().await.on_connection_initiated(&ConnectionInitiated {
            endpoint_id,
            is_outgoing: true,
            endpoint_info: &remote_info,
            authentication_digest: &auth_token,
        });
        Ok(())
    }

    /// Called when an inbound channel (one this session did not actively
    /// dial) has finished its medium-level connect; runs the handshake as
    /// the tie-broken role and starts routing its frames to this handler.
    pub async fn accept_inbound_channel(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        channel: Arc<EndpointChannel>,
        rng: &mut dyn Generator,
    ) -> Status {
        let role = handshake::resolve_role(self.local_endpoint_id, endpoint_id);
        let (d2d, master) = match handshake::run(&channel, role, rng).await {
            Ok(result) => result,
            Err(e) => return ErrorKind::from(e).to_status(),
        };
        channel.enable_encryption(d2d).await;
        // Negotiated keep-alive values aren't known until the
        // `ConnectionRequestFrame` arrives; `on_connection_request` applies
        // them via `set_keep_alive` once it does.
        self.session.endpoint_manager.register(endpoint_id, channel, None).await;

        self.handshaken_auth_tokens
            .lock()
            .await
            .insert(endpoint_id, verification_string(&master));
        Status::Success
    }

    pub async fn accept_connection(&self, endpoint_id: EndpointId) -> Status {
        self.resolve_local_decision(endpoint_id, true).await
    }

    pub async fn reject_connection(&self, endpoint_id: EndpointId) -> Status {
        self.resolve_local_decision(endpoint_id, false).await
    }

    async fn resolve_local_decision(&self, endpoint_id: EndpointId, accept: bool) -> Status {
        let mut pending = self.pending.lock().await;
        let Some(connection) = pending.get_mut(&endpoint_id) else {
            return Status::EndpointUnknown;
        };
        if connection.phase != PendingPhase::Initiated {
            return Status::OutOfOrderApiCall;
        }
        connection.local_accept = Some(accept);
        let remote_accept = connection.remote_accept;
        drop(pending);

        let response = OfflineFrame::ConnectionResponse(ConnectionResponseFrame {
            status: if accept { RESPONSE_SUCCESS } else { RESPONSE_REJECTED },
            ostensible_endpoint_info: None,
            extra: Vec::new(),
        });
        if let Some(channel) = self.session.endpoint_manager.registry().get(endpoint_id).await {
            let _ = channel.write(&response, [0u8; 16]).await;
        }

        self.settle(endpoint_id, Some(accept), remote_accept).await;
        Status::Success
    }

    async fn on_connection_response(&self, endpoint_id: EndpointId, frame: ConnectionResponseFrame) {
        let accepted = frame.status == RESPONSE_SUCCESS;
        let mut pending = self.pending.lock().await;
        let Some(connection) = pending.get_mut(&endpoint_id) else {
            return;
        };
        connection.remote_accept = Some(accepted);
        if let Some(ostensible) = frame.ostensible_endpoint_info {
            connection.remote_info = ostensible;
        }
        let local_accept = connection.local_accept;
        drop(pending);
        self.settle(endpoint_id, local_accept, Some(accepted)).await;
    }

    async fn on_connection_request(&self, endpoint_id: EndpointId, frame: ConnectionRequestFrame) {
        let auth_token = self.handshaken_auth_tokens.lock().await.remove(&endpoint_id).unwrap_or_default();
        let is_new = {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&endpoint_id) {
                false
            } else {
                pending.insert(
                    endpoint_id,
                    PendingConnection {
                        is_outgoing: false,
                        local_accept: None,
                        remote_accept: None,
                        phase: PendingPhase::Initiated,
                        cancel: Arc::new(AtomicBool::new(false)),
                        remote_info: frame.endpoint_info.clone(),
                        raw_auth_token: auth_token.clone(),
                    },
                );
                true
            }
        };

        self.session
            .endpoint_manager
            .set_keep_alive(
                endpoint_id,
                KeepAliveParams {
                    write_interval_ms: frame.keep_alive_interval_ms as u64,
                    read_timeout_ms: frame.keep_alive_timeout_ms as u64,
                },
            )
            .await;

        if is_new {
            self.session.subscriber.lock().await.on_connection_initiated(&ConnectionInitiated {
                endpoint_id,
                is_outgoing: false,
                endpoint_info: &frame.endpoint_info,
                authentication_digest: &auth_token,
            });
        }
    }

    /// Transitions to `Connected`/`Rejected` once both sides' decisions are
    /// known, notifying the subscriber exactly once per terminal outcome.
    async fn settle(&self, endpoint_id: EndpointId, local: Option<bool>, remote: Option<bool>) {
        let (local, remote) = match (local, remote) {
            (Some(l), Some(r)) => (l, r),
            _ => return,
        };

        let mut pending = self.pending.lock().await;
        let Some(connection) = pending.get_mut(&endpoint_id) else {
            return;
        };
        if connection.phase != PendingPhase::Initiated {
            return;
        }

        if local && remote {
            connection.phase = PendingPhase::Connected;
            drop(pending);
            self.session.subscriber.lock().await.on_connection_accepted(endpoint_id);
        } else {
            connection.phase = PendingPhase::Rejected;
            drop(pending);
            self.session
                .subscriber
                .lock()
                .await
                .on_connection_rejected(endpoint_id, Status::ConnectionRejected);
        }
    }

    pub async fn disconnect_from_endpoint(&self, endpoint_id: EndpointId) {
        if let Some(connection) = self.pending.lock().await.remove(&endpoint_id) {
            connection.cancel.store(true, Ordering::Release);
        }
        self.session.endpoint_manager.unregister(endpoint_id).await;
        self.session.subscriber.lock().await.on_disconnected(endpoint_id);
    }
}

fn iv_for_nonce(nonce: i32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&nonce.to_be_bytes());
    iv
}

/// Adapts `Arc<PcpHandler>` to the endpoint manager's synchronous
/// `IncomingFrameProcessor`, dispatching the two connection-lifecycle frame
/// kinds onto short-lived tasks (spec.md §5 "handshake and payload-send run
/// on short-lived tasks spawned on a general-purpose pool").
pub struct PcpHandlerProcessor(pub Arc<PcpHandler>);

impl IncomingFrameProcessor for PcpHandlerProcessor {
    fn process(&self, endpoint_id: EndpointId, frame: OfflineFrame) {
        let handler = self.0.clone();
        match frame {
            OfflineFrame::ConnectionRequest(request) => {
                tokio::spawn(async move { handler.on_connection_request(endpoint_id, request).await });
            }
            OfflineFrame::ConnectionResponse(response) => {
                tokio::spawn(async move { handler.on_connection_response(endpoint_id, response).await });
            }
            _ => {}
        }
    }

    fn on_endpoint_disconnected(&self, endpoint_id: EndpointId) {
        let handler = self.0.clone();
        tokio::spawn(async move {
            handler.pending.lock().await.remove(&endpoint_id);
            handler.session.subscriber.lock().await.on_disconnected(endpoint_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRegistry;
    use crate::clock::SystemClock;
    use crate::endpoint_manager::EndpointManager;
    use crate::medium::LoopbackDriver;
    use nc_core::config::Config;
    use nc_core::event::NoopSubscriber;
    use nc_core::options::Strategy;
    use nc_core::random::testing::Deterministic;

    fn build_session(local_id: EndpointId) -> (Arc<SessionContext>, Arc<PcpHandler>, Arc<LoopbackDriver>) {
        let registry = Arc::new(ChannelRegistry::new());
        let manager = Arc::new(EndpointManager::new(Config::default(), registry, Arc::new(SystemClock::new())));
        let driver = Arc::new(LoopbackDriver::new(Medium::WifiLan));
        let session = Arc::new(SessionContext::new(
            Config::default(),
            manager,
            vec![driver.clone() as Arc<dyn MediumDriver>],
            Box::new(NoopSubscriber),
        ));
        let pcp = Arc::new(PcpHandler::new(session.clone(), local_id));
        (session, pcp, driver)
    }

    #[tokio::test]
    async fn starting_advertising_twice_without_stopping_is_rejected() {
        let (_session, pcp, _driver) = build_session(EndpointId::new(*b"AAAA").unwrap());
        assert_eq!(pcp.start_advertising(ServiceId::new("svc")).await, Status::Success);
        assert_eq!(
            pcp.start_advertising(ServiceId::new("svc")).await,
            Status::AlreadyAdvertising
        );
        pcp.stop_advertising();
        assert_eq!(pcp.start_advertising(ServiceId::new("svc")).await, Status::Success);
    }

    #[tokio::test]
    async fn endpoint_found_fires_once_across_two_mediums_and_lost_fires_on_the_last() {
        let (_session, pcp, _driver) = build_session(EndpointId::new(*b"AAAA").unwrap());
        let remote = EndpointId::new(*b"BBBB").unwrap();
        let service_id = ServiceId::new("svc");

        pcp.on_endpoint_found(remote, b"info".to_vec(), service_id.clone(), Medium::WifiLan)
            .await;
        pcp.on_endpoint_found(remote, b"info".to_vec(), service_id.clone(), Medium::Ble)
            .await;
        assert_eq!(pcp.discovered.lock().await.get(&remote).unwrap().mediums.len(), 2);

        pcp.on_endpoint_lost(remote, Medium::WifiLan).await;
        assert!(pcp.discovered.lock().await.contains_key(&remote));
        pcp.on_endpoint_lost(remote, Medium::Ble).await;
        assert!(!pcp.discovered.lock().await.contains_key(&remote));
    }

    #[tokio::test]
    async fn inject_endpoint_records_the_out_of_band_address() {
        let (_session, pcp, _driver) = build_session(EndpointId::new(*b"AAAA").unwrap());
        let remote = EndpointId::new(*b"BBBB").unwrap();
        let oob = OutOfBandMetadata {
            medium: Medium::BluetoothClassic,
            remote_address: b"mac".to_vec(),
        };
        assert_eq!(
            pcp.inject_endpoint(ServiceId::new("svc"), oob, remote).await,
            Status::Success
        );
        let discovered = pcp.discovered.lock().await;
        let entry = discovered.get(&remote).unwrap();
        assert_eq!(entry.mediums[0].oob_metadata.as_deref(), Some(b"mac".as_slice()));
    }

    /// End-to-end: A dials B over a loopback pipe, both run the handshake,
    /// and mutual `accept_connection` calls bring both sides' pending state
    /// to `Connected` (spec.md §8 property: "a connection only reaches
    /// `Connected` once both peers have accepted").
    #[tokio::test]
    async fn mutual_accept_drives_both_sides_to_the_connected_phase() {
        let a_id = EndpointId::new(*b"AAAA").unwrap();
        let b_id = EndpointId::new(*b"BBBB").unwrap();
        let service_id = ServiceId::new("svc");

        let (session_a, pcp_a, driver_a) = build_session(a_id);
        let (session_b, pcp_b, _driver_b) = build_session(b_id);

        for kind in ["connection-request", "connection-response"] {
            let processor_a: Arc<dyn IncomingFrameProcessor> = Arc::new(PcpHandlerProcessor(pcp_a.clone()));
            session_a.endpoint_manager.register_processor(kind, processor_a).await;
            let processor_b: Arc<dyn IncomingFrameProcessor> = Arc::new(PcpHandlerProcessor(pcp_b.clone()));
            session_b.endpoint_manager.register_processor(kind, processor_b).await;
        }

        let (stream_a, stream_b) = tokio::io::duplex(16 * 1024);
        driver_a.register(b_id, stream_a);
        pcp_a
            .discovered
            .lock()
            .await
            .insert(b_id, DiscoveredEndpoint::new(b_id, Vec::new(), service_id, Medium::WifiLan));

        let options = ConnectionOptions::new(vec![Medium::WifiLan], Strategy::P2pCluster);
        let mut rng_a = Deterministic { seed: 11 };
        let mut rng_b = Deterministic { seed: 97 };
        let inbound_channel = Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(stream_b)));

        let (request_status, accept_status) = tokio::join!(
            pcp_a.request_connection(b_id, b"device-a".to_vec(), options, &mut rng_a),
            pcp_b.accept_inbound_channel(a_id, inbound_channel, &mut rng_b),
        );
        assert_eq!(request_status, Status::Success);
        assert_eq!(accept_status, Status::Success);

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(pcp_b.pending.lock().await.contains_key(&a_id));

        assert_eq!(pcp_b.accept_connection(a_id).await, Status::Success);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(pcp_a.accept_connection(b_id).await, Status::Success);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        assert_eq!(
            pcp_a.pending.lock().await.get(&b_id).unwrap().phase,
            PendingPhase::Connected
        );
        assert_eq!(
            pcp_b.pending.lock().await.get(&a_id).unwrap().phase,
            PendingPhase::Connected
        );
    }
}
