//! Bandwidth-upgrade sub-state machine (spec.md §4.7): `stable` →
//! `negotiating` → `swapping` → `stable`, keyed by endpoint id. The swap
//! itself goes through `ChannelRegistry::swap`, so the endpoint manager's
//! reader loop (which re-fetches its channel by id every iteration) picks
//! up the new medium on its very next read with no explicit handoff.
//!
//! The side that sends `UpgradePathAvailable` doesn't dial the new medium
//! itself — it waits for the peer to connect back on it and only then runs
//! the swap. Which side owns the dial is therefore asymmetric:
//! `on_frame`'s `UpgradePathAvailable` arm (offer's recipient) dials and
//! swaps; `accept_upgraded_channel` (offer's sender) swaps once the peer's
//! inbound connection on the new medium is handed to it. The latter mirrors
//! `pcp_handler::PcpHandler::accept_inbound_channel`'s same limitation:
//! `MediumDriver` only exposes `connect`, never `listen`, so a caller outside
//! this module supplies the inbound channel.

use crate::channel::EndpointChannel;
use crate::endpoint_manager::IncomingFrameProcessor;
use crate::handshake;
use crate::medium::MediumDriver;
use crate::session::SessionContext;
use nc_core::endpoint::EndpointId;
use nc_core::event::{BandwidthChanged, BandwidthQuality};
use nc_core::frame::{BandwidthUpgradeEventType, BandwidthUpgradeNegotiationFrame, OfflineFrame};
use nc_core::medium::Medium;
use nc_core::random::Generator;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UpgradeState {
    Stable,
    Negotiating,
    Swapping,
}

struct UpgradeSlot {
    state: UpgradeState,
}

/// One instance per client session, shared by the Pcp handler (which decides
/// *when* to upgrade) and the endpoint manager (which routes negotiation
/// frames to it).
pub struct BandwidthUpgradeManager {
    session: Arc<SessionContext>,
    slots: Mutex<HashMap<EndpointId, UpgradeSlot>>,
    /// Signaled by `on_frame` when a `SafeToClosePriorChannel` arrives,
    /// letting `swap_in` know the peer has seen its `LastWriteToPriorChannel`
    /// before it closes the old channel.
    drains: Mutex<HashMap<EndpointId, Arc<Notify>>>,
}

impl BandwidthUpgradeManager {
    pub fn new(session: Arc<SessionContext>) -> Self {
        Self {
            session,
            slots: Mutex::new(HashMap::new()),
            drains: Mutex::new(HashMap::new()),
        }
    }

    async fn state_of(&self, endpoint_id: EndpointId) -> UpgradeState {
        self.slots
            .lock()
            .await
            .get(&endpoint_id)
            .map(|slot| slot.state)
            .unwrap_or(UpgradeState::Stable)
    }

    async fn reset_to_stable(&self, endpoint_id: EndpointId) {
        self.slots.lock().await.insert(
            endpoint_id,
            UpgradeSlot {
                state: UpgradeState::Stable,
            },
        );
    }

    /// Sends an `UpgradePathAvailable` offer and moves to `negotiating`. A
    /// no-op returning `false` if an upgrade for this endpoint is already in
    /// flight (spec.md §4.7's state diagram only leaves `stable` this way).
    pub async fn trigger_upgrade(&self, endpoint_id: EndpointId, target_medium: Medium) -> bool {
        {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(endpoint_id).or_insert(UpgradeSlot {
                state: UpgradeState::Stable,
            });
            if slot.state != UpgradeState::Stable {
                return false;
            }
            slot.state = UpgradeState::Negotiating;
        }

        let Some(channel) = self.session.endpoint_manager.registry().get(endpoint_id).await else {
            self.reset_to_stable(endpoint_id).await;
            return false;
        };
        let offer = OfflineFrame::BandwidthUpgradeNegotiation(BandwidthUpgradeNegotiationFrame {
            event_type: BandwidthUpgradeEventType::UpgradePathAvailable,
            medium_specific_payload: medium_tag_payload(target_medium),
            extra: Vec::new(),
        });
        if channel.write(&offer, [0u8; 16]).await.is_err() {
            self.reset_to_stable(endpoint_id).await;
            return false;
        }
        true
    }

    /// Dials `target_medium`, runs the handshake over the fresh channel, and
    /// swaps it in (the "swapping" phase) — the path an offer's recipient
    /// takes once it's ready to move (spec.md §4.7
    /// "peer-available & path-test-ok ▶ swapping").
    async fn perform_swap(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        target_medium: Medium,
        local_endpoint_id: EndpointId,
        rng: &mut dyn Generator,
    ) -> bool {
        let Some(driver) = self.session.mediums.get(&target_medium) else {
            self.reset_to_stable(endpoint_id).await;
            return false;
        };
        let transport = match driver.connect(endpoint_id, None).await {
            Ok(transport) => transport,
            Err(_) => {
                self.reset_to_stable(endpoint_id).await;
                return false;
            }
        };
        let new_channel = Arc::new(EndpointChannel::new(target_medium, transport));
        self.swap_in(endpoint_id, local_endpoint_id, new_channel, rng).await
    }

    /// Completes an upgrade on the offer's sending side once the peer's
    /// inbound connection on the new medium has been accepted elsewhere and
    /// handed to this method.
    pub async fn accept_upgraded_channel(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        local_endpoint_id: EndpointId,
        new_channel: Arc<EndpointChannel>,
        rng: &mut dyn Generator,
    ) -> bool {
        if self.state_of(endpoint_id).await != UpgradeState::Negotiating {
            return false;
        }
        self.swap_in(endpoint_id, local_endpoint_id, new_channel, rng).await
    }

    /// Runs the four-frame `ClientIntroduction`/`ClientIntroductionAck`
    /// round trip over the not-yet-registered new channel, so each side can
    /// confirm it's talking to the endpoint it thinks it is before the
    /// registry swap makes the channel live.
    async fn exchange_client_introduction(&self, channel: &Arc<EndpointChannel>, local_endpoint_id: EndpointId) -> bool {
        let intro = OfflineFrame::BandwidthUpgradeNegotiation(BandwidthUpgradeNegotiationFrame {
            event_type: BandwidthUpgradeEventType::ClientIntroduction,
            medium_specific_payload: local_endpoint_id.as_bytes().to_vec(),
            extra: Vec::new(),
        });
        if channel.write(&intro, [1u8; 16]).await.is_err() {
            return false;
        }
        let Ok(OfflineFrame::BandwidthUpgradeNegotiation(peer_intro)) = channel.read(0).await else {
            return false;
        };
        if peer_intro.event_type != BandwidthUpgradeEventType::ClientIntroduction {
            return false;
        }

        let ack = OfflineFrame::BandwidthUpgradeNegotiation(BandwidthUpgradeNegotiationFrame {
            event_type: BandwidthUpgradeEventType::ClientIntroductionAck,
            medium_specific_payload: Vec::new(),
            extra: Vec::new(),
        });
        if channel.write(&ack, [2u8; 16]).await.is_err() {
            return false;
        }
        let Ok(OfflineFrame::BandwidthUpgradeNegotiation(peer_ack)) = channel.read(0).await else {
            return false;
        };
        peer_ack.event_type == BandwidthUpgradeEventType::ClientIntroductionAck
    }

    async fn swap_in(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        local_endpoint_id: EndpointId,
        new_channel: Arc<EndpointChannel>,
        rng: &mut dyn Generator,
    ) -> bool {
        if let Some(slot) = self.slots.lock().await.get_mut(&endpoint_id) {
            slot.state = UpgradeState::Swapping;
        }

        let role = handshake::resolve_role(local_endpoint_id, endpoint_id);
        let (d2d, _master) = match handshake::run(&new_channel, role, rng).await {
            Ok(result) => result,
            Err(_) => {
                // new-channel-fail ▶ stable (old channel retained): we never
                // touched the registry, so the old channel is still live.
                self.reset_to_stable(endpoint_id).await;
                return false;
            }
        };
        new_channel.enable_encryption(d2d).await;

        if !self.exchange_client_introduction(&new_channel, local_endpoint_id).await {
            self.reset_to_stable(endpoint_id).await;
            return false;
        }

        let new_medium = new_channel.medium();
        let notify = Arc::new(Notify::new());
        self.drains.lock().await.insert(endpoint_id, notify.clone());

        if let Some(old_channel) = self.session.endpoint_manager.registry().get(endpoint_id).await {
            let last_write = OfflineFrame::BandwidthUpgradeNegotiation(BandwidthUpgradeNegotiationFrame {
                event_type: BandwidthUpgradeEventType::LastWriteToPriorChannel,
                medium_specific_payload: Vec::new(),
                extra: Vec::new(),
            });
            let _ = old_channel.write(&last_write, [3u8; 16]).await;

            // Bounded: a peer that never answers shouldn't hang the swap.
            // The channel stays unpaused while we wait so its reader loop can
            // still deliver the peer's `SafeToClosePriorChannel` reply to us.
            let _ = tokio::time::timeout(std::time::Duration::from_millis(500), notify.notified()).await;
            old_channel.pause();
        }
        self.drains.lock().await.remove(&endpoint_id);

        let previous = self
            .session
            .endpoint_manager
            .registry()
            .swap(endpoint_id, new_channel)
            .await;
        if let Some(previous) = previous {
            previous.close().await;
        }

        self.reset_to_stable(endpoint_id).await;
        self.session.subscriber.lock().await.on_bandwidth_changed(&BandwidthChanged {
            endpoint_id,
            quality: medium_quality(new_medium),
        });
        true
    }

    /// Routes an inbound `BandwidthUpgradeNegotiation` frame. `ClientIntroduction`
    /// and its ack are exchanged directly over the new channel inside
    /// `swap_in` before it's registered, so they never reach here.
    async fn on_frame(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        local_endpoint_id: EndpointId,
        frame: BandwidthUpgradeNegotiationFrame,
        rng: &mut dyn Generator,
    ) {
        match frame.event_type {
            BandwidthUpgradeEventType::UpgradePathAvailable => {
                let Some(target_medium) = medium_from_payload(&frame.medium_specific_payload) else {
                    return;
                };
                {
                    let mut slots = self.slots.lock().await;
                    let slot = slots.entry(endpoint_id).or_insert(UpgradeSlot {
                        state: UpgradeState::Stable,
                    });
                    if slot.state != UpgradeState::Stable {
                        return;
                    }
                    slot.state = UpgradeState::Negotiating;
                }
                self.perform_swap(endpoint_id, target_medium, local_endpoint_id, rng).await;
            }
            BandwidthUpgradeEventType::LastWriteToPriorChannel => {
                if let Some(channel) = self.session.endpoint_manager.registry().get(endpoint_id).await {
                    let ack = OfflineFrame::BandwidthUpgradeNegotiation(BandwidthUpgradeNegotiationFrame {
                        event_type: BandwidthUpgradeEventType::SafeToClosePriorChannel,
                        medium_specific_payload: Vec::new(),
                        extra: Vec::new(),
                    });
                    let _ = channel.write(&ack, [4u8; 16]).await;
                }
            }
            BandwidthUpgradeEventType::SafeToClosePriorChannel => {
                if let Some(notify) = self.drains.lock().await.get(&endpoint_id) {
                    notify.notify_one();
                }
            }
            BandwidthUpgradeEventType::ClientIntroduction | BandwidthUpgradeEventType::ClientIntroductionAck => {}
        }
    }
}

/// Wifi-family mediums beat Bluetooth/BLE; a coarse two-level signal is all
/// `ConnectionListener::bandwidth_changed` promises (spec.md §4.7).
fn medium_quality(medium: Medium) -> BandwidthQuality {
    match medium {
        Medium::WifiLan | Medium::WifiDirect | Medium::WifiHotspot | Medium::WebRtc => BandwidthQuality::High,
        Medium::BluetoothClassic | Medium::Ble => BandwidthQuality::Low,
    }
}

fn medium_tag_payload(medium: Medium) -> Vec<u8> {
    vec![match medium {
        Medium::BluetoothClassic => 0,
        Medium::Ble => 1,
        Medium::WifiLan => 2,
        Medium::WifiDirect => 3,
        Medium::WifiHotspot => 4,
        Medium::WebRtc => 5,
    }]
}

fn medium_from_payload(bytes: &[u8]) -> Option<Medium> {
    Some(match bytes.first()? {
        0 => Medium::BluetoothClassic,
        1 => Medium::Ble,
        2 => Medium::WifiLan,
        3 => Medium::WifiDirect,
        4 => Medium::WifiHotspot,
        5 => Medium::WebRtc,
        _ => return None,
    })
}

/// Adapts `Arc<BandwidthUpgradeManager>` to the endpoint manager's
/// synchronous `IncomingFrameProcessor`, holding the one RNG instance this
/// session's upgrade handshakes draw from (upgrades are rare enough that
/// serializing on one mutex costs nothing observable).
pub struct BandwidthUpgradeProcessor {
    pub manager: Arc<BandwidthUpgradeManager>,
    pub local_endpoint_id: EndpointId,
    pub rng: Arc<Mutex<Box<dyn Generator>>>,
}

impl IncomingFrameProcessor for BandwidthUpgradeProcessor {
    fn process(&self, endpoint_id: EndpointId, frame: OfflineFrame) {
        if let OfflineFrame::BandwidthUpgradeNegotiation(negotiation) = frame {
            let manager = self.manager.clone();
            let local_endpoint_id = self.local_endpoint_id;
            let rng = self.rng.clone();
            tokio::spawn(async move {
                let mut guard = rng.lock().await;
                manager.on_frame(endpoint_id, local_endpoint_id, negotiation, &mut **guard).await;
            });
        }
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
    use nc_core::random::testing::Deterministic;

    fn build_session(driver_medium: Medium) -> (Arc<SessionContext>, Arc<LoopbackDriver>) {
        let registry = Arc::new(ChannelRegistry::new());
        let manager = Arc::new(EndpointManager::new(Config::default(), registry, Arc::new(SystemClock::new())));
        let driver = Arc::new(LoopbackDriver::new(driver_medium));
        let session = Arc::new(SessionContext::new(
            Config::default(),
            manager,
            vec![driver.clone() as Arc<dyn MediumDriver>],
            Box::new(NoopSubscriber),
        ));
        (session, driver)
    }

    #[tokio::test]
    async fn trigger_upgrade_is_rejected_while_one_is_already_in_flight() {
        let b_id = EndpointId::new(*b"BBBB").unwrap();
        let (session, _driver) = build_session(Medium::WifiLan);

        let (chan_a, chan_b) = tokio::io::duplex(4096);
        session
            .endpoint_manager
            .register(b_id, Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(chan_a))), None)
            .await;
        let _keep_alive_peer = EndpointChannel::new(Medium::WifiLan, Box::new(chan_b));

        let manager = Arc::new(BandwidthUpgradeManager::new(session));
        assert!(manager.trigger_upgrade(b_id, Medium::WifiDirect).await);
        assert!(!manager.trigger_upgrade(b_id, Medium::WifiDirect).await);
    }

    /// A dials a fresh WifiDirect channel to B (the offer recipient's path,
    /// `perform_swap`) while B accepts the inbound channel handed to it (the
    /// offer sender's path, `accept_upgraded_channel`); both run the
    /// `ClientIntroduction` handshake and the `LastWriteToPriorChannel`/
    /// `SafeToClosePriorChannel` drain over their respective old channels,
    /// and both registries end up pointing at the new medium (spec.md §4.7
    /// "channel replaced").
    #[tokio::test]
    async fn swap_in_replaces_the_registered_channel_on_success() {
        let a_id = EndpointId::new(*b"AAAA").unwrap();
        let b_id = EndpointId::new(*b"BBBB").unwrap();
        let (session_a, driver_a) = build_session(Medium::WifiDirect);
        let (session_b, _driver_b) = build_session(Medium::WifiDirect);

        let (old_a, old_b) = tokio::io::duplex(4096);
        session_a
            .endpoint_manager
            .register(b_id, Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(old_a))), None)
            .await;
        session_b
            .endpoint_manager
            .register(a_id, Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(old_b))), None)
            .await;

        let manager_a = Arc::new(BandwidthUpgradeManager::new(session_a.clone()));
        let manager_b = Arc::new(BandwidthUpgradeManager::new(session_b.clone()));
        for (session, manager, local_id) in [(&session_a, &manager_a, a_id), (&session_b, &manager_b, b_id)] {
            let processor: Arc<dyn IncomingFrameProcessor> = Arc::new(BandwidthUpgradeProcessor {
                manager: manager.clone(),
                local_endpoint_id: local_id,
                rng: Arc::new(Mutex::new(Box::new(Deterministic { seed: 1 }) as Box<dyn Generator>)),
            });
            session
                .endpoint_manager
                .register_processor("bandwidth-upgrade", processor)
                .await;
        }
        // B is the offer's sender in this scenario: it's already waiting on
        // the upgrade it's about to be handed, as if it had just sent
        // `UpgradePathAvailable` over the old channel.
        manager_b.slots.lock().await.insert(
            a_id,
            UpgradeSlot {
                state: UpgradeState::Negotiating,
            },
        );

        let (new_a, new_b) = tokio::io::duplex(16 * 1024);
        driver_a.register(b_id, new_a);
        let peer_channel = Arc::new(EndpointChannel::new(Medium::WifiDirect, Box::new(new_b)));

        let mut rng_a = Deterministic { seed: 5 };
        let mut rng_b = Deterministic { seed: 50 };

        let (swap_ok, accept_ok) = tokio::join!(
            manager_a.perform_swap(b_id, Medium::WifiDirect, a_id, &mut rng_a),
            manager_b.accept_upgraded_channel(a_id, b_id, peer_channel, &mut rng_b),
        );
        assert!(swap_ok);
        assert!(accept_ok);

        assert_eq!(
            session_a.endpoint_manager.registry().get(b_id).await.unwrap().medium(),
            Medium::WifiDirect
        );
        assert_eq!(
            session_b.endpoint_manager.registry().get(a_id).await.unwrap().medium(),
            Medium::WifiDirect
        );
    }
}
