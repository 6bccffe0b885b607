//! Client-facing listener traits (spec.md §6.1) and the `Subscriber` adapter
//! that fans the transport layer's single event stream out to whichever
//! listeners the caller currently has registered.

use nc_core::endpoint::{EndpointId, ServiceId};
use nc_core::event::{BandwidthChanged, BandwidthQuality, ConnectionInitiated, EndpointFound, Subscriber};
use nc_core::payload::{Payload, PayloadProgressInfo};
use nc_core::status::Status;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

/// Observes the lifecycle of one or more connections, supplied once at
/// `StartAdvertising` and shared across every endpoint it accepts from.
pub trait ConnectionListener: Send {
    /// `endpoint_info` is the remote's advertised info and
    /// `authentication_digest` is the short string both peers should display
    /// and have their users compare before either calls `accept_connection`
    /// (spec.md §4.5).
    fn initiated(
        &mut self,
        endpoint_id: EndpointId,
        endpoint_info: &[u8],
        authentication_digest: &[u8],
        is_outgoing: bool,
    ) {
        let _ = (endpoint_id, endpoint_info, authentication_digest, is_outgoing);
    }

    fn accepted(&mut self, endpoint_id: EndpointId) {
        let _ = endpoint_id;
    }

    fn rejected(&mut self, endpoint_id: EndpointId, status: Status) {
        let _ = (endpoint_id, status);
    }

    fn disconnected(&mut self, endpoint_id: EndpointId) {
        let _ = endpoint_id;
    }

    fn bandwidth_changed(&mut self, endpoint_id: EndpointId, quality: BandwidthQuality) {
        let _ = (endpoint_id, quality);
    }
}

/// Observes discovery, supplied once at `StartDiscovery`.
pub trait DiscoveryListener: Send {
    fn endpoint_found(&mut self, endpoint_id: EndpointId, endpoint_info: &[u8], service_id: &ServiceId) {
        let _ = (endpoint_id, endpoint_info, service_id);
    }

    fn endpoint_lost(&mut self, endpoint_id: EndpointId) {
        let _ = endpoint_id;
    }
}

/// Observes payload transfer for one accepted endpoint, supplied at
/// `AcceptConnection`.
pub trait PayloadListener: Send {
    fn payload(&mut self, endpoint_id: EndpointId, payload: &Payload) {
        let _ = (endpoint_id, payload);
    }

    fn payload_progress(&mut self, endpoint_id: EndpointId, progress: &PayloadProgressInfo) {
        let _ = (endpoint_id, progress);
    }
}

/// The registrations a running session currently holds: one connection
/// listener, one discovery listener, and a payload listener per accepted
/// endpoint. Shared between `NearbyConnections` (which mutates it on every
/// `Start*`/`AcceptConnection` call) and the `FacadeSubscriber` wired into
/// `SessionContext` (which only reads it).
#[derive(Default)]
pub struct ListenerRegistry {
    connection: StdMutex<Option<Box<dyn ConnectionListener>>>,
    discovery: StdMutex<Option<Box<dyn DiscoveryListener>>>,
    payload: StdMutex<HashMap<EndpointId, Box<dyn PayloadListener>>>,
    /// `ServiceId` the discovery listener's endpoints were found under;
    /// `endpoint_found` only carries an endpoint info slice from the
    /// transport layer, so the service id is cached here at
    /// `StartDiscovery` time instead of threaded through every event.
    discovery_service: StdMutex<Option<ServiceId>>,
}

impl ListenerRegistry {
    pub fn set_connection_listener(&self, listener: Box<dyn ConnectionListener>) {
        *self.connection.lock().unwrap() = Some(listener);
    }

    pub fn set_discovery_listener(&self, listener: Box<dyn DiscoveryListener>, service_id: ServiceId) {
        *self.discovery.lock().unwrap() = Some(listener);
        *self.discovery_service.lock().unwrap() = Some(service_id);
    }

    pub fn clear_discovery_listener(&self) {
        self.discovery.lock().unwrap().take();
        self.discovery_service.lock().unwrap().take();
    }

    pub fn set_payload_listener(&self, endpoint_id: EndpointId, listener: Box<dyn PayloadListener>) {
        self.payload.lock().unwrap().insert(endpoint_id, listener);
    }

    pub fn remove_payload_listener(&self, endpoint_id: EndpointId) {
        self.payload.lock().unwrap().remove(&endpoint_id);
    }
}

/// Bridges `nc_core::event::Subscriber` (one event stream per session) onto
/// the three listener traits callers actually implement.
pub struct FacadeSubscriber(pub std::sync::Arc<ListenerRegistry>);

impl Subscriber for FacadeSubscriber {
    fn on_endpoint_found(&mut self, event: &EndpointFound<'_>) {
        let service_id = self.0.discovery_service.lock().unwrap().clone();
        let Some(service_id) = service_id else { return };
        if let Some(listener) = self.0.discovery.lock().unwrap().as_mut() {
            listener.endpoint_found(event.endpoint_id, event.endpoint_info, &service_id);
        }
    }

    fn on_endpoint_lost(&mut self, endpoint_id: EndpointId) {
        if let Some(listener) = self.0.discovery.lock().unwrap().as_mut() {
            listener.endpoint_lost(endpoint_id);
        }
    }

    fn on_connection_initiated(&mut self, event: &ConnectionInitiated<'_>) {
        if let Some(listener) = self.0.connection.lock().unwrap().as_mut() {
            listener.initiated(
                event.endpoint_id,
                event.endpoint_info,
                event.authentication_digest,
                event.is_outgoing,
            );
        }
    }

    fn on_connection_accepted(&mut self, endpoint_id: EndpointId) {
        if let Some(listener) = self.0.connection.lock().unwrap().as_mut() {
            listener.accepted(endpoint_id);
        }
    }

    fn on_connection_rejected(&mut self, endpoint_id: EndpointId, status: Status) {
        if let Some(listener) = self.0.connection.lock().unwrap().as_mut() {
            listener.rejected(endpoint_id, status);
        }
    }

    fn on_disconnected(&mut self, endpoint_id: EndpointId) {
        if let Some(listener) = self.0.connection.lock().unwrap().as_mut() {
            listener.disconnected(endpoint_id);
        }
        self.0.payload.lock().unwrap().remove(&endpoint_id);
    }

    fn on_bandwidth_changed(&mut self, event: &BandwidthChanged) {
        if let Some(listener) = self.0.connection.lock().unwrap().as_mut() {
            listener.bandwidth_changed(event.endpoint_id, event.quality);
        }
    }

    fn on_payload_progress(&mut self, endpoint_id: EndpointId, progress: &PayloadProgressInfo) {
        if let Some(listener) = self.0.payload.lock().unwrap().get_mut(&endpoint_id) {
            listener.payload_progress(endpoint_id, progress);
        }
    }

    fn on_payload_received(&mut self, endpoint_id: EndpointId, payload: &Payload) {
        if let Some(listener) = self.0.payload.lock().unwrap().get_mut(&endpoint_id) {
            listener.payload(endpoint_id, payload);
        }
    }
}
