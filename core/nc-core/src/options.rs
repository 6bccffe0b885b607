//! `ConnectionOptions` and the P2P strategy selector.

use crate::medium::Medium;
use alloc::vec::Vec;

/// Point-to-point control protocol strategy (spec.md glossary: Pcp).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Many-to-many: any advertiser may connect to any number of
    /// discoverers and vice versa.
    P2pCluster,
    /// One advertiser, many discoverers.
    P2pStar,
    /// Exactly one connection at a time on each side.
    P2pPointToPoint,
}

/// Out-of-band metadata used by `InjectEndpoint` to bypass discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutOfBandMetadata {
    pub medium: Medium,
    /// Medium-specific connect address (e.g. a Bluetooth MAC, an IP:port).
    pub remote_address: Vec<u8>,
}

/// Caller-supplied connection parameters (spec.md §3).
///
/// Immutable once a session using it starts; cloned into each
/// `PendingConnection` at the moment it's created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub allowed_mediums: Vec<Medium>,
    pub strategy: Strategy,
    pub auto_upgrade: bool,
    pub keep_alive_interval_ms: u32,
    pub keep_alive_timeout_ms: u32,
    /// Caller-supplied bytes threaded through `ConnectionRequestFrame`
    /// without interpretation by the core.
    pub out_of_band_metadata: Option<OutOfBandMetadata>,
}

/// Reported by `ConnectionOptions::validate` when construction-time
/// invariants are violated (spec.md §3: "Allowed set is non-empty;
/// keep-alive timeout ≥ 3x interval").
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("allowed medium set must not be empty")]
    EmptyMediumSet,
    #[error("keep_alive_timeout_ms must be at least 3x keep_alive_interval_ms")]
    KeepAliveTimeoutTooShort,
}

impl ConnectionOptions {
    pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u32 = 5_000;
    pub const DEFAULT_KEEP_ALIVE_TIMEOUT_MS: u32 = 30_000;

    pub fn new(allowed_mediums: Vec<Medium>, strategy: Strategy) -> Self {
        Self {
            allowed_mediums,
            strategy,
            auto_upgrade: true,
            keep_alive_interval_ms: Self::DEFAULT_KEEP_ALIVE_INTERVAL_MS,
            keep_alive_timeout_ms: Self::DEFAULT_KEEP_ALIVE_TIMEOUT_MS,
            out_of_band_metadata: None,
        }
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.allowed_mediums.is_empty() {
            return Err(OptionsError::EmptyMediumSet);
        }
        if u64::from(self.keep_alive_timeout_ms) < 3 * u64::from(self.keep_alive_interval_ms) {
            return Err(OptionsError::KeepAliveTimeoutTooShort);
        }
        Ok(())
    }
}
