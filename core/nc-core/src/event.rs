//! Structured event subscriber, grounded on
//! `s2n-quic-core::event::subscriber::Subscriber`: a no-op-by-default trait
//! so the compiler can optimize away events nobody subscribes to, plus a
//! tuple impl for fanning one event stream out to two subscribers (used to
//! combine a user-supplied subscriber with the built-in `tracing` one).

use crate::endpoint::EndpointId;
use crate::payload::{Payload, PayloadProgressInfo};
use crate::status::Status;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointFound<'a> {
    pub endpoint_id: EndpointId,
    pub endpoint_info: &'a [u8],
}

/// Mirrors the original's `ConnectionInfo` delivered to
/// `onConnectionInitiated`: the remote's advertised info plus a short
/// authentication digest both sides can read aloud to their users and
/// compare out of band before either one accepts (spec.md §4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionInitiated<'a> {
    pub endpoint_id: EndpointId,
    pub is_outgoing: bool,
    pub endpoint_info: &'a [u8],
    pub authentication_digest: &'a [u8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BandwidthChanged {
    pub endpoint_id: EndpointId,
    pub quality: BandwidthQuality,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandwidthQuality {
    Low,
    High,
}

/// Clients (and the crate's own `tracing` integration) implement this to
/// observe the lifecycle of discovery, connections, and payload transfer.
/// Every method has a no-op default so a subscriber only needs to override
/// the events it cares about.
pub trait Subscriber {
    fn on_endpoint_found(&mut self, event: &EndpointFound<'_>) {
        let _ = event;
    }

    fn on_endpoint_lost(&mut self, endpoint_id: EndpointId) {
        let _ = endpoint_id;
    }

    fn on_connection_initiated(&mut self, event: &ConnectionInitiated<'_>) {
        let _ = event;
    }

    fn on_connection_accepted(&mut self, endpoint_id: EndpointId) {
        let _ = endpoint_id;
    }

    fn on_connection_rejected(&mut self, endpoint_id: EndpointId, status: Status) {
        let _ = (endpoint_id, status);
    }

    fn on_disconnected(&mut self, endpoint_id: EndpointId) {
        let _ = endpoint_id;
    }

    fn on_bandwidth_changed(&mut self, event: &BandwidthChanged) {
        let _ = event;
    }

    fn on_payload_progress(&mut self, endpoint_id: EndpointId, progress: &PayloadProgressInfo) {
        let _ = (endpoint_id, progress);
    }

    /// Fires once, when a payload has fully arrived (spec.md §6.1
    /// `PayloadListener::payload`), distinct from the incremental
    /// `on_payload_progress` events leading up to it.
    fn on_payload_received(&mut self, endpoint_id: EndpointId, payload: &Payload) {
        let _ = (endpoint_id, payload);
    }
}

/// A subscriber that observes nothing; the default when a caller doesn't
/// supply one.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSubscriber;

impl Subscriber for NoopSubscriber {}

impl<A, B> Subscriber for (A, B)
where
    A: Subscriber,
    B: Subscriber,
{
    fn on_endpoint_found(&mut self, event: &EndpointFound<'_>) {
        self.0.on_endpoint_found(event);
        self.1.on_endpoint_found(event);
    }

    fn on_endpoint_lost(&mut self, endpoint_id: EndpointId) {
        self.0.on_endpoint_lost(endpoint_id);
        self.1.on_endpoint_lost(endpoint_id);
    }

    fn on_connection_initiated(&mut self, event: &ConnectionInitiated<'_>) {
        self.0.on_connection_initiated(event);
        self.1.on_connection_initiated(event);
    }

    fn on_connection_accepted(&mut self, endpoint_id: EndpointId) {
        self.0.on_connection_accepted(endpoint_id);
        self.1.on_connection_accepted(endpoint_id);
    }

    fn on_connection_rejected(&mut self, endpoint_id: EndpointId, status: Status) {
        self.0.on_connection_rejected(endpoint_id, status);
        self.1.on_connection_rejected(endpoint_id, status);
    }

    fn on_disconnected(&mut self, endpoint_id: EndpointId) {
        self.0.on_disconnected(endpoint_id);
        self.1.on_disconnected(endpoint_id);
    }

    fn on_bandwidth_changed(&mut self, event: &BandwidthChanged) {
        self.0.on_bandwidth_changed(event);
        self.1.on_bandwidth_changed(event);
    }

    fn on_payload_progress(&mut self, endpoint_id: EndpointId, progress: &PayloadProgressInfo) {
        self.0.on_payload_progress(endpoint_id, progress);
        self.1.on_payload_progress(endpoint_id, progress);
    }

    fn on_payload_received(&mut self, endpoint_id: EndpointId, payload: &Payload) {
        self.0.on_payload_received(endpoint_id, payload);
        self.1.on_payload_received(endpoint_id, payload);
    }
}

/// Bridges `Subscriber` events onto `tracing` spans/events, the always-on
/// half of the fanout tuple used by `nc-transport::session::SessionContext`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSubscriber;

#[cfg(feature = "tracing")]
impl Subscriber for TracingSubscriber {
    fn on_endpoint_found(&mut self, event: &EndpointFound<'_>) {
        tracing::debug!(endpoint_id = %event.endpoint_id, "endpoint_found");
    }

    fn on_endpoint_lost(&mut self, endpoint_id: EndpointId) {
        tracing::debug!(endpoint_id = %endpoint_id, "endpoint_lost");
    }

    fn on_connection_initiated(&mut self, event: &ConnectionInitiated<'_>) {
        tracing::info!(
            endpoint_id = %event.endpoint_id,
            is_outgoing = event.is_outgoing,
            authentication_digest = ?event.authentication_digest,
            "connection_initiated"
        );
    }

    fn on_connection_accepted(&mut self, endpoint_id: EndpointId) {
        tracing::info!(endpoint_id = %endpoint_id, "connection_accepted");
    }

    fn on_connection_rejected(&mut self, endpoint_id: EndpointId, status: Status) {
        tracing::info!(endpoint_id = %endpoint_id, ?status, "connection_rejected");
    }

    fn on_disconnected(&mut self, endpoint_id: EndpointId) {
        tracing::info!(endpoint_id = %endpoint_id, "disconnected");
    }

    fn on_bandwidth_changed(&mut self, event: &BandwidthChanged) {
        tracing::info!(endpoint_id = %event.endpoint_id, quality = ?event.quality, "bandwidth_changed");
    }

    fn on_payload_progress(&mut self, endpoint_id: EndpointId, progress: &PayloadProgressInfo) {
        tracing::trace!(
            endpoint_id = %endpoint_id,
            payload_id = progress.payload_id.0,
            status = ?progress.status,
            bytes_transferred = progress.bytes_transferred,
            "payload_progress"
        );
    }

    fn on_payload_received(&mut self, endpoint_id: EndpointId, payload: &Payload) {
        tracing::info!(
            endpoint_id = %endpoint_id,
            payload_id = payload.header.id.0,
            bytes = payload.bytes.len(),
            "payload_received"
        );
    }
}

#[cfg(not(feature = "tracing"))]
impl Subscriber for TracingSubscriber {}
