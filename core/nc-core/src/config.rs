//! Session-wide configuration, threaded explicitly through constructors.
//!
//! Per the redesign notes (spec.md §9), this replaces the source's
//! `FeatureFlags::GetInstance()` singleton: every component that needs a
//! design constant takes a `&Config` at construction time instead of
//! reaching for global mutable state.

/// Immutable, session-wide design constants.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Reader pool / keep-alive pool bound (spec.md §4.3 `kMaxConcurrentEndpoints`).
    pub max_concurrent_endpoints: usize,
    /// Bound on `Unregister`'s wait for processor disconnection callbacks.
    pub process_disconnection_timeout_ms: u64,
    /// Fixed chunk size used by the payload sender (spec.md §4.6 step 1).
    pub payload_chunk_size: usize,
    /// Size above which a `bytes` payload is still accepted end-to-end by
    /// the roundtrip property test (spec.md §8, property 3); not otherwise
    /// enforced by the engine.
    pub max_bytes_payload_size: usize,
    /// How often the keep-alive loop writes a `KeepAliveFrame` on an idle
    /// channel (`kKeepAliveWriteIntervalMillis` in the original).
    pub keep_alive_write_interval_ms: u64,
    /// How long without a read before the keep-alive loop declares an
    /// endpoint dead (`kKeepAliveReadTimeoutMillis` in the original).
    pub keep_alive_read_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_endpoints: 50,
            process_disconnection_timeout_ms: 2_000,
            payload_chunk_size: 64 * 1024,
            max_bytes_payload_size: 10 * 1024 * 1024,
            keep_alive_write_interval_ms: 5_000,
            keep_alive_read_timeout_ms: 30_000,
        }
    }
}
