//! The session context: the single place every component reaches for its
//! shared collaborators, instead of the source's back-pointer graph
//! (spec.md §9 "cyclic observer graphs"). Dependency arrows run one way —
//! `PcpHandler` and `bandwidth_upgrade` hold an `Arc<SessionContext>`, the
//! endpoint manager and channel registry never hold a pointer back to
//! either of them.

use crate::endpoint_manager::EndpointManager;
use crate::medium::MediumDriver;
use nc_core::config::Config;
use nc_core::endpoint::EndpointId;
use nc_core::event::Subscriber;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything a Pcp handler or bandwidth-upgrade manager needs that isn't
/// its own state: the session-wide config, the endpoint manager (and,
/// through it, the channel registry), the registered medium drivers, and
/// the client's event subscriber.
pub struct SessionContext {
    pub config: Config,
    pub endpoint_manager: Arc<EndpointManager>,
    pub mediums: HashMap<nc_core::medium::Medium, Arc<dyn MediumDriver>>,
    pub subscriber: Mutex<Box<dyn Subscriber + Send>>,
}

impl SessionContext {
    pub fn new(
        config: Config,
        endpoint_manager: Arc<EndpointManager>,
        mediums: Vec<Arc<dyn MediumDriver>>,
        subscriber: Box<dyn Subscriber + Send>,
    ) -> Self {
        Self {
            config,
            endpoint_manager,
            mediums: mediums.into_iter().map(|d| (d.medium(), d)).collect(),
            subscriber: Mutex::new(subscriber),
        }
    }

    /// The endpoint id this session generates for itself, drawn from the
    /// random-generator capability rather than a per-process static (spec.md
    /// §3).
    pub fn generate_local_endpoint_id(&self, rng: &mut dyn nc_core::random::Generator) -> EndpointId {
        EndpointId::generate(|dest| rng.public_random_fill(dest))
    }
}
