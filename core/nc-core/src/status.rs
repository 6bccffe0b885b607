//! `Status` — the public-API-facing result code (spec.md §6.1).

/// The result of a public API call.
///
/// Internal error kinds (see `crate::error::ErrorKind`) carry strictly more
/// detail than this and convert into it with `ErrorKind::to_status` at the
/// point the error surfaces on a `PcpHandler` call path, mirroring the
/// teacher's `connection::Error` → `std::io::ErrorKind` narrowing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    #[error("success")]
    Success,
    #[error("already advertising")]
    AlreadyAdvertising,
    #[error("already discovering")]
    AlreadyDiscovering,
    #[error("an endpoint I/O error occurred")]
    EndpointIoError,
    #[error("the endpoint id is not known to this session")]
    EndpointUnknown,
    #[error("the remote endpoint rejected the connection")]
    ConnectionRejected,
    #[error("a Bluetooth medium error occurred")]
    BluetoothError,
    #[error("a BLE medium error occurred")]
    BleError,
    #[error("a Wi-Fi LAN medium error occurred")]
    WifiLanError,
    #[error("the payload id is not known to this session")]
    PayloadUnknown,
    #[error("the API call was made out of the expected order for the current state")]
    OutOfOrderApiCall,
    #[error("not connected to the given endpoint")]
    NotConnectedToEndpoint,
    #[error("an unspecified error occurred")]
    Error,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}
