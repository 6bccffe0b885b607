//! Endpoint and service identity, and the `DiscoveredEndpoint` record the
//! Pcp handler keeps one of per (endpoint id, medium) pair.

use crate::medium::Medium;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// A 4-byte printable-ASCII endpoint identifier, unique within a client
/// session (spec.md §3).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId([u8; 4]);

impl EndpointId {
    /// Builds an id from 4 printable-ASCII bytes. Returns `None` if any byte
    /// falls outside `0x20..=0x7e`.
    pub fn new(bytes: [u8; 4]) -> Option<Self> {
        if bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
            Some(Self(bytes))
        } else {
            None
        }
    }

    /// Generates a random 4-character endpoint id from the printable
    /// uppercase-alphanumeric alphabet used by the reference implementation.
    pub fn generate(mut fill: impl FnMut(&mut [u8])) -> Self {
        const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut raw = [0u8; 4];
        fill(&mut raw);
        let mut bytes = [0u8; 4];
        for (out, b) in bytes.iter_mut().zip(raw.iter()) {
            *out = ALPHABET[(*b as usize) % ALPHABET.len()];
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // validated as printable ASCII at construction time
        core::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointId({})", self.as_str())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caller-chosen, short, stable string naming a discovery namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One medium's sighting of a remote endpoint.
///
/// spec.md §3: "One per (endpoint id, medium); multiple mediums for the
/// same remote id coexist". The Pcp handler keeps a `Vec<MediumSighting>`
/// per tracked endpoint id instead of one `DiscoveredEndpoint` per medium,
/// so that "lost the last medium" can be checked locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediumSighting {
    pub medium: Medium,
    /// Out-of-band connect metadata for this medium (e.g. a Bluetooth MAC),
    /// present when the sighting came from `InjectEndpoint` rather than
    /// discovery.
    pub oob_metadata: Option<Vec<u8>>,
}

/// A remote endpoint the client has seen via one or more mediums.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    pub endpoint_id: EndpointId,
    pub endpoint_info: Vec<u8>,
    pub service_id: ServiceId,
    pub mediums: Vec<MediumSighting>,
}

impl DiscoveredEndpoint {
    pub fn new(
        endpoint_id: EndpointId,
        endpoint_info: Vec<u8>,
        service_id: ServiceId,
        medium: Medium,
    ) -> Self {
        Self {
            endpoint_id,
            endpoint_info,
            service_id,
            mediums: alloc::vec![MediumSighting {
                medium,
                oob_metadata: None,
            }],
        }
    }

    /// Adds a sighting for `medium` if this endpoint wasn't already known to
    /// be reachable over it. Returns `true` if this was the very first
    /// sighting recorded for the endpoint (i.e. the caller should raise
    /// `endpoint_found`).
    pub fn record_sighting(&mut self, medium: Medium) -> bool {
        let is_first = self.mediums.is_empty();
        if !self.mediums.iter().any(|m| m.medium == medium) {
            self.mediums.push(MediumSighting {
                medium,
                oob_metadata: None,
            });
        }
        is_first
    }

    /// Removes a medium's sighting. Returns `true` if this was the last
    /// medium tracking the endpoint (i.e. the caller should raise
    /// `endpoint_lost`).
    pub fn remove_sighting(&mut self, medium: Medium) -> bool {
        self.mediums.retain(|m| m.medium != medium);
        self.mediums.is_empty()
    }

    /// Picks the medium to attempt a connection over first, using the given
    /// priority list; falls back to insertion order if none of the tracked
    /// mediums appear in the priority list.
    pub fn primary_medium(&self, priority: &[Medium]) -> Option<Medium> {
        priority
            .iter()
            .copied()
            .find(|candidate| self.mediums.iter().any(|m| m.medium == *candidate))
            .or_else(|| self.mediums.first().map(|m| m.medium))
    }
}
