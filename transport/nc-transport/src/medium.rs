//! The medium capability trait (spec.md §9 redesign note: replace
//! inheritance of abstract medium classes with a capability interface plus
//! tag dispatch). Concrete radio drivers are out of scope (spec.md §1); this
//! module pins the interface a driver must offer and ships an in-memory
//! driver used by the test harness, the same role
//! `s2n-quic-platform::io::testing` plays for the teacher.

use crate::channel::RawTransport;
use async_trait::async_trait;
use nc_core::endpoint::EndpointId;
use nc_core::medium::Medium;
use std::io;

/// What the core needs from a concrete radio to run discovery and open a
/// byte-stream channel. `Advertise`/`Scan` are modeled as the driver handing
/// back a stream of sightings rather than invoking a callback directly, so
/// the Pcp handler can drive them from its own serial executor.
#[async_trait]
pub trait MediumDriver: Send + Sync {
    fn medium(&self) -> Medium;

    /// Opens a channel to `endpoint_id` using medium-specific out-of-band
    /// metadata (e.g. a Bluetooth MAC) if the connection wasn't reached via
    /// the normal discovery/advertise handshake.
    async fn connect(
        &self,
        endpoint_id: EndpointId,
        oob_metadata: Option<&[u8]>,
    ) -> io::Result<Box<dyn RawTransport>>;
}

/// An in-memory driver pairing two peers without touching any real radio,
/// used by the test harness (spec.md §8 scenario tests).
pub struct LoopbackDriver {
    medium: Medium,
    peers: std::sync::Mutex<std::collections::HashMap<EndpointId, tokio::io::DuplexStream>>,
}

impl LoopbackDriver {
    pub fn new(medium: Medium) -> Self {
        Self {
            medium,
            peers: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Registers the local end of a pre-established duplex pipe so a later
    /// `connect()` call for `endpoint_id` hands it back.
    pub fn register(&self, endpoint_id: EndpointId, stream: tokio::io::DuplexStream) {
        self.peers.lock().unwrap().insert(endpoint_id, stream);
    }
}

#[async_trait]
impl MediumDriver for LoopbackDriver {
    fn medium(&self) -> Medium {
        self.medium
    }

    async fn connect(
        &self,
        endpoint_id: EndpointId,
        _oob_metadata: Option<&[u8]>,
    ) -> io::Result<Box<dyn RawTransport>> {
        let stream = self
            .peers
            .lock()
            .unwrap()
            .remove(&endpoint_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no loopback peer registered"))?;
        Ok(Box::new(stream))
    }
}
