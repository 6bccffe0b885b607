//! Orchestrates the UKEY2 handshake (`nc_crypto::ukey2`) over a raw
//! `EndpointChannel`, and installs the resulting D2D signcryption context
//! (spec.md §4.4). Tie-breaks simultaneous connects by endpoint id (§4.5).
//!
//! The four UKEY2 messages are exchanged before any `OfflineFrame` traffic
//! and before encryption is installed, so they're sent as small
//! tag-prefixed raw messages rather than wrapped in the offline-frame
//! envelope — matching `third_party/ukey2`'s handshake running underneath
//! (not inside) the connection's normal framing.

use crate::channel::{ChannelError, EndpointChannel};
use nc_core::endpoint::EndpointId;
use nc_core::error::HandshakeFailure;
use nc_core::random::Generator;
use nc_crypto::d2d::D2dContext;
use nc_crypto::ukey2::{
    ClientFinished, ClientInit, HandshakeRole, Initiator, Responder, ServerInit, P256_SHA256,
};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("{0}")]
    Failure(HandshakeFailure),
    #[error("the endpoint channel failed during the handshake")]
    Channel,
}

impl From<HandshakeFailure> for HandshakeError {
    fn from(value: HandshakeFailure) -> Self {
        HandshakeError::Failure(value)
    }
}

impl From<ChannelError> for HandshakeError {
    fn from(_: ChannelError) -> Self {
        HandshakeError::Channel
    }
}

impl From<HandshakeError> for nc_core::error::ErrorKind {
    fn from(value: HandshakeError) -> Self {
        match value {
            HandshakeError::Failure(failure) => nc_core::error::ErrorKind::Handshake(failure),
            HandshakeError::Channel => nc_core::error::ErrorKind::Io,
        }
    }
}

const TAG_CLIENT_INIT: u8 = 0;
const TAG_SERVER_INIT: u8 = 1;
const TAG_CLIENT_FINISHED: u8 = 2;
const TAG_ALERT: u8 = 0xff;

fn encode_client_init(value: &ClientInit) -> Vec<u8> {
    let mut out = vec![TAG_CLIENT_INIT, value.supported_ciphers.len() as u8];
    out.extend(value.supported_ciphers.iter().map(|c| c.0));
    out.extend_from_slice(&value.commitment);
    out
}

fn decode_client_init(bytes: &[u8]) -> Result<ClientInit, HandshakeError> {
    if bytes.first() != Some(&TAG_CLIENT_INIT) {
        return Err(HandshakeFailure::BadFrame.into());
    }
    let count = *bytes.get(1).ok_or(HandshakeFailure::BadFrame)? as usize;
    let ciphers_start = 2;
    let ciphers_end = ciphers_start + count;
    let commitment_end = ciphers_end + 32;
    let ciphers = bytes
        .get(ciphers_start..ciphers_end)
        .ok_or(HandshakeFailure::BadFrame)?;
    let commitment_bytes = bytes
        .get(ciphers_end..commitment_end)
        .ok_or(HandshakeFailure::BadFrame)?;
    let mut commitment = [0u8; 32];
    commitment.copy_from_slice(commitment_bytes);
    Ok(ClientInit {
        supported_ciphers: ciphers.iter().map(|&b| nc_crypto::ukey2::CipherId(b)).collect(),
        commitment,
    })
}

fn encode_server_init(value: &ServerInit) -> Vec<u8> {
    let mut out = vec![TAG_SERVER_INIT, value.selected_cipher.0];
    out.extend_from_slice(&(value.server_public_key.len() as u16).to_be_bytes());
    out.extend_from_slice(&value.server_public_key);
    out.extend_from_slice(&value.nonce);
    out
}

fn decode_server_init(bytes: &[u8]) -> Result<ServerInit, HandshakeError> {
    if bytes.first() != Some(&TAG_SERVER_INIT) {
        return Err(HandshakeFailure::BadFrame.into());
    }
    let selected_cipher = *bytes.get(1).ok_or(HandshakeFailure::BadFrame)?;
    let key_len = u16::from_be_bytes(
        bytes
            .get(2..4)
            .ok_or(HandshakeFailure::BadFrame)?
            .try_into()
            .unwrap(),
    ) as usize;
    let key_end = 4 + key_len;
    let nonce_end = key_end + 32;
    let server_public_key = bytes
        .get(4..key_end)
        .ok_or(HandshakeFailure::BadFrame)?
        .to_vec();
    let nonce_bytes = bytes.get(key_end..nonce_end).ok_or(HandshakeFailure::BadFrame)?;
    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(nonce_bytes);
    Ok(ServerInit {
        selected_cipher: nc_crypto::ukey2::CipherId(selected_cipher),
        server_public_key,
        nonce,
    })
}

fn encode_client_finished(value: &ClientFinished) -> Vec<u8> {
    let mut out = vec![TAG_CLIENT_FINISHED];
    out.extend_from_slice(&value.client_public_key);
    out
}

fn decode_client_finished(bytes: &[u8]) -> Result<ClientFinished, HandshakeError> {
    if bytes.first() != Some(&TAG_CLIENT_FINISHED) {
        return Err(HandshakeFailure::BadFrame.into());
    }
    Ok(ClientFinished {
        client_public_key: bytes[1..].to_vec(),
    })
}

fn alert_code(failure: HandshakeFailure) -> u8 {
    match failure {
        HandshakeFailure::Timeout => 0,
        HandshakeFailure::VersionMismatch => 1,
        HandshakeFailure::BadFrame => 2,
        HandshakeFailure::CipherMismatch => 3,
        HandshakeFailure::KeyAgreement => 4,
        HandshakeFailure::Replay => 5,
    }
}

async fn send_alert(channel: &EndpointChannel, failure: HandshakeFailure) {
    let _ = channel.write_raw(&[TAG_ALERT, alert_code(failure)]).await;
}

/// Which side of a tie-broken pair this session plays, per spec.md §4.5:
/// the lexicographically smaller endpoint id is the UKEY2 responder.
pub fn resolve_role(local: EndpointId, remote: EndpointId) -> HandshakeRole {
    if local.as_bytes() < remote.as_bytes() {
        HandshakeRole::Responder
    } else {
        HandshakeRole::Initiator
    }
}

/// Runs the four-message UKEY2 exchange over `channel` and returns a
/// `D2dContext` ready to install via `EndpointChannel::enable_encryption`,
/// alongside the raw `MasterSecret` it was derived from. Callers use the
/// latter to compute `nc_crypto::ukey2::verification_string` for the
/// `ConnectionInitiated` event (spec.md §4.5) rather than re-deriving it.
/// On any failure, writes an explicit `Alert` raw message before returning
/// the error (spec.md's supplemented alert-frame behavior), rather than
/// silently closing the channel.
pub async fn run(
    channel: &Arc<EndpointChannel>,
    role: HandshakeRole,
    rng: &mut dyn Generator,
) -> Result<(D2dContext, nc_crypto::ukey2::MasterSecret), HandshakeError> {
    let now_ms = 0;
    let result = match role {
        HandshakeRole::Initiator => run_initiator(channel, rng, now_ms).await,
        HandshakeRole::Responder => run_responder(channel, rng, now_ms).await,
    };
    if let Err(HandshakeError::Failure(failure)) = result {
        send_alert(channel, failure).await;
    }
    result.map(|master| (D2dContext::new(&master, role), master))
}

async fn run_initiator(
    channel: &Arc<EndpointChannel>,
    rng: &mut dyn Generator,
    now_ms: i64,
) -> Result<nc_crypto::ukey2::MasterSecret, HandshakeError> {
    let (initiator, client_init) = Initiator::start(rng);
    channel.write_raw(&encode_client_init(&client_init)).await?;

    let server_init_bytes = read_or_alert(channel, now_ms).await?;
    let server_init = decode_server_init(&server_init_bytes)?;
    if server_init.selected_cipher != P256_SHA256 {
        return Err(HandshakeFailure::CipherMismatch.into());
    }

    let (client_finished, master) = initiator.finish(&server_init)?;
    channel
        .write_raw(&encode_client_finished(&client_finished))
        .await?;
    Ok(master)
}

async fn run_responder(
    channel: &Arc<EndpointChannel>,
    rng: &mut dyn Generator,
    now_ms: i64,
) -> Result<nc_crypto::ukey2::MasterSecret, HandshakeError> {
    let client_init_bytes = read_or_alert(channel, now_ms).await?;
    let client_init = decode_client_init(&client_init_bytes)?;

    let (responder, server_init) = Responder::start(rng, &client_init)?;
    channel.write_raw(&encode_server_init(&server_init)).await?;

    let client_finished_bytes = read_or_alert(channel, now_ms).await?;
    let client_finished = decode_client_finished(&client_finished_bytes)?;
    Ok(responder.finish(&client_finished)?)
}

async fn read_or_alert(
    channel: &Arc<EndpointChannel>,
    now_ms: i64,
) -> Result<Vec<u8>, HandshakeError> {
    let bytes = channel.read_raw(now_ms).await?;
    if bytes.first() == Some(&TAG_ALERT) {
        let code = *bytes.get(1).unwrap_or(&2);
        let failure = match code {
            0 => HandshakeFailure::Timeout,
            1 => HandshakeFailure::VersionMismatch,
            3 => HandshakeFailure::CipherMismatch,
            4 => HandshakeFailure::KeyAgreement,
            5 => HandshakeFailure::Replay,
            _ => HandshakeFailure::BadFrame,
        };
        return Err(failure.into());
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_core::medium::Medium;
    use nc_core::random::testing::Deterministic;

    #[tokio::test]
    async fn initiator_and_responder_agree_on_a_context() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let chan_a = Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(a)));
        let chan_b = Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(b)));

        let mut rng_a = Deterministic { seed: 3 };
        let mut rng_b = Deterministic { seed: 201 };

        let (initiator_result, responder_result) = tokio::join!(
            run(&chan_a, HandshakeRole::Initiator, &mut rng_a),
            run(&chan_b, HandshakeRole::Responder, &mut rng_b)
        );

        let (mut initiator_d2d, initiator_master) = initiator_result.unwrap();
        let (mut responder_d2d, responder_master) = responder_result.unwrap();

        let sealed = initiator_d2d.signcrypt([7u8; 16], b"post-handshake traffic");
        let plaintext = responder_d2d.verify_decrypt(&sealed).unwrap();
        assert_eq!(plaintext, b"post-handshake traffic");

        assert_eq!(
            nc_crypto::ukey2::verification_string(&initiator_master),
            nc_crypto::ukey2::verification_string(&responder_master)
        );
    }

    #[test]
    fn tie_break_picks_the_lexicographically_smaller_id_as_responder() {
        let a = EndpointId::new(*b"AAAA").unwrap();
        let b = EndpointId::new(*b"BBBB").unwrap();
        assert_eq!(resolve_role(a, b), HandshakeRole::Responder);
        assert_eq!(resolve_role(b, a), HandshakeRole::Initiator);
    }

    /// A peer that returns a malformed server-init (spec.md §8 E5) fails
    /// the initiator's handshake with a wire error rather than hanging or
    /// panicking, and writes an alert before the fake peer's read returns.
    #[tokio::test]
    async fn malformed_server_init_fails_the_initiator() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let chan_a = Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(a)));
        let chan_b = Arc::new(EndpointChannel::new(Medium::WifiLan, Box::new(b)));
        let mut rng_a = Deterministic { seed: 5 };

        let fake_peer = async move {
            let _client_init = chan_b.read_raw(0).await.unwrap();
            chan_b.write_raw(&[TAG_SERVER_INIT, 0xFF]).await.unwrap();
        };

        let (initiator_result, _) = tokio::join!(run(&chan_a, HandshakeRole::Initiator, &mut rng_a), fake_peer);

        assert!(matches!(initiator_result, Err(HandshakeError::Failure(HandshakeFailure::BadFrame))));
    }
}
