//! Shared data model for the nearby-connections core: endpoint/service
//! identifiers, the offline wire frames, the error/status taxonomy, the
//! payload model, and the small capability traits (`event::Subscriber`,
//! `random::Generator`) that the transport and crypto crates are built
//! against.
//!
//! Nothing in this crate performs I/O or spawns a task; it exists so that
//! `nc-transport` and `nc-crypto` share one definition of "what a frame, an
//! endpoint id, and an error look like".

pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod frame;
pub mod medium;
pub mod options;
pub mod payload;
pub mod random;
pub mod status;

pub use endpoint::{DiscoveredEndpoint, EndpointId, ServiceId};
pub use error::ErrorKind;
pub use medium::Medium;
pub use options::{ConnectionOptions, Strategy};
pub use payload::{Payload, PayloadHeader, PayloadId, PayloadKind, PayloadProgressInfo, PayloadStatus};
pub use status::Status;
