//! The medium capability tag.
//!
//! The source models concrete radios as subclasses of an abstract medium
//! base class; per the redesign notes this becomes a plain tag plus a
//! capability trait (`nc_transport::medium::MediumDriver`) that concrete
//! drivers implement and register against. Dispatch here is by matching on
//! the tag, never by virtual method call.

/// A concrete radio/transport a connection can be carried over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Medium {
    BluetoothClassic,
    Ble,
    WifiLan,
    WifiDirect,
    WifiHotspot,
    WebRtc,
}

impl Medium {
    pub const ALL: [Medium; 6] = [
        Medium::BluetoothClassic,
        Medium::Ble,
        Medium::WifiLan,
        Medium::WifiDirect,
        Medium::WifiHotspot,
        Medium::WebRtc,
    ];

    /// The design-default discovery medium priority list (spec.md §4.5):
    /// Wi-Fi LAN, WebRTC, Bluetooth Classic, BLE. Wi-Fi Direct/Hotspot are
    /// upgrade-only targets and are not consulted during discovery.
    pub fn default_discovery_priority() -> &'static [Medium] {
        &[
            Medium::WifiLan,
            Medium::WebRtc,
            Medium::BluetoothClassic,
            Medium::Ble,
        ]
    }

    /// True for mediums that are only ever reached via a bandwidth upgrade,
    /// never chosen directly by the Pcp handler during initial connect.
    pub fn is_upgrade_only(self) -> bool {
        matches!(self, Medium::WifiDirect | Medium::WifiHotspot)
    }
}
