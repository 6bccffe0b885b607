//! The four-message UKEY2 exchange (spec.md §4.4).
//!
//! ```text
//! Initiator                         Responder
//!   ClientInit   ------------------>
//!                <------------------  ServerInit
//!   ClientFinished ------------------>
//! ```
//!
//! `ClientInit` carries a commitment (`SHA256(ClientFinished bytes)`) rather
//! than the finished message itself, so the responder can't substitute its
//! own ephemeral key after seeing the initiator's — the same commit/reveal
//! shape the original `third_party/ukey2` headers document.

use crate::rng::GeneratorRng;
use crate::HandshakeError;
use nc_core::random::Generator;
use p256::ecdh::EphemeralSecret;
use p256::{EncodedPoint, PublicKey};
use sha2::{Digest, Sha256};

/// The only cipher this implementation offers: ECDH over P-256 with
/// HKDF-SHA256 key derivation, matching the teacher's minimal
/// `cipher_suite` model (one fixed negotiated suite rather than the QUIC
/// crate's full cipher-suite registry, since UKEY2 in practice only ever
/// negotiates this one).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CipherId(pub u8);

pub const P256_SHA256: CipherId = CipherId(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientInit {
    pub supported_ciphers: Vec<CipherId>,
    pub commitment: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInit {
    pub selected_cipher: CipherId,
    pub server_public_key: Vec<u8>,
    pub nonce: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientFinished {
    pub client_public_key: Vec<u8>,
}

impl ClientFinished {
    fn commitment(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.client_public_key);
        hasher.finalize().into()
    }
}

/// Which side of the tie-broken pair this handshake participant plays
/// (spec.md §4.5: the lexicographically smaller endpoint id is the
/// responder/"server" side).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// The shared secret material both sides arrive at: a distinct 32-byte key
/// for each direction of traffic, derived via HKDF-SHA256 with the salt
/// `SHA256("UKEY2 v1 next")` (spec.md §4.4).
#[derive(Clone)]
pub struct MasterSecret {
    pub client_to_server_key: [u8; 32],
    pub server_to_client_key: [u8; 32],
}

impl core::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MasterSecret").finish_non_exhaustive()
    }
}

fn hkdf_salt() -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"UKEY2 v1 next");
    hasher.finalize().into()
}

fn derive_master_secret(shared_secret: &[u8]) -> MasterSecret {
    let salt = hkdf_salt();
    let hk = hkdf::Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut client_to_server_key = [0u8; 32];
    let mut server_to_client_key = [0u8; 32];
    hk.expand(b"UKEY2 client", &mut client_to_server_key)
        .expect("32 bytes is a valid HKDF-SHA256 expand length");
    hk.expand(b"UKEY2 server", &mut server_to_client_key)
        .expect("32 bytes is a valid HKDF-SHA256 expand length");
    MasterSecret {
        client_to_server_key,
        server_to_client_key,
    }
}

/// A 6-digit decimal string derived from the master secret that a higher
/// layer may display to the user for out-of-band verification. Not
/// cryptographically load-bearing on its own; it's a convenience the
/// original UKEY2 handshake also exposes.
pub fn verification_string(master: &MasterSecret) -> Vec<u8> {
    let salt = hkdf_salt();
    let mut combined = Vec::with_capacity(64);
    combined.extend_from_slice(&master.client_to_server_key);
    combined.extend_from_slice(&master.server_to_client_key);
    let hk = hkdf::Hkdf::<Sha256>::new(Some(&salt), &combined);
    let mut digits = [0u8; 4];
    hk.expand(b"UKEY2 verification", &mut digits)
        .expect("4 bytes is a valid HKDF-SHA256 expand length");
    let value = u32::from_be_bytes(digits) % 1_000_000;
    format!("{value:06}").into_bytes()
}

/// Drives the initiator side of the handshake: `ClientInit` -> (peer's
/// `ServerInit`) -> `ClientFinished` -> `MasterSecret`.
pub struct Initiator {
    secret: EphemeralSecret,
    public_point: EncodedPoint,
}

impl Initiator {
    /// Builds the `ClientInit` message and the ephemeral keypair it
    /// commits to.
    pub fn start(rng: &mut dyn Generator) -> (Self, ClientInit) {
        let mut adapter = GeneratorRng(rng);
        let secret = EphemeralSecret::random(&mut adapter);
        let public_point = secret.public_key().to_encoded_point(true);
        let finished = ClientFinished {
            client_public_key: public_point.as_bytes().to_vec(),
        };
        let client_init = ClientInit {
            supported_ciphers: vec![P256_SHA256],
            commitment: finished.commitment(),
        };
        (
            Self {
                secret,
                public_point,
            },
            client_init,
        )
    }

    /// Consumes the responder's `ServerInit`, returning the `ClientFinished`
    /// to send back and the derived master secret.
    pub fn finish(
        self,
        server_init: &ServerInit,
    ) -> Result<(ClientFinished, MasterSecret), HandshakeError> {
        if server_init.selected_cipher != P256_SHA256 {
            return Err(HandshakeError::CipherMismatch);
        }
        let server_public = public_key_from_bytes(&server_init.server_public_key)?;
        let shared = self.secret.diffie_hellman(&server_public);
        let master = derive_master_secret(shared.raw_secret_bytes());
        let finished = ClientFinished {
            client_public_key: self.public_point.as_bytes().to_vec(),
        };
        Ok((finished, master))
    }
}

/// Drives the responder side: consumes `ClientInit`, produces `ServerInit`,
/// then consumes `ClientFinished` to verify the earlier commitment and
/// derive the master secret.
pub struct Responder {
    secret: EphemeralSecret,
    client_commitment: [u8; 32],
}

impl Responder {
    /// Picks a cipher from `client_init` and builds `ServerInit`.
    pub fn start(
        rng: &mut dyn Generator,
        client_init: &ClientInit,
    ) -> Result<(Self, ServerInit), HandshakeError> {
        if !client_init.supported_ciphers.contains(&P256_SHA256) {
            return Err(HandshakeError::CipherMismatch);
        }
        let mut adapter = GeneratorRng(rng);
        let secret = EphemeralSecret::random(&mut adapter);
        let public_point = secret.public_key().to_encoded_point(true);
        let mut nonce = [0u8; 32];
        adapter.0.public_random_fill(&mut nonce);
        let server_init = ServerInit {
            selected_cipher: P256_SHA256,
            server_public_key: public_point.as_bytes().to_vec(),
            nonce,
        };
        Ok((
            Self {
                secret,
                client_commitment: client_init.commitment,
            },
            server_init,
        ))
    }

    /// Verifies `client_finished` against the commitment received in
    /// `ClientInit` and derives the master secret.
    pub fn finish(self, client_finished: &ClientFinished) -> Result<MasterSecret, HandshakeError> {
        if client_finished.commitment() != self.client_commitment {
            return Err(HandshakeError::KeyAgreement);
        }
        let client_public = public_key_from_bytes(&client_finished.client_public_key)?;
        let shared = self.secret.diffie_hellman(&client_public);
        Ok(derive_master_secret(shared.raw_secret_bytes()))
    }
}

fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, HandshakeError> {
    let point = EncodedPoint::from_bytes(bytes).map_err(|_| HandshakeError::BadFrame)?;
    PublicKey::from_encoded_point(&point)
        .into_option()
        .ok_or(HandshakeError::KeyAgreement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_core::random::testing::Deterministic;

    #[test]
    fn handshake_agrees_on_a_master_secret() {
        let mut initiator_rng = Deterministic { seed: 1 };
        let mut responder_rng = Deterministic { seed: 200 };

        let (initiator, client_init) = Initiator::start(&mut initiator_rng);
        let (responder, server_init) = Responder::start(&mut responder_rng, &client_init).unwrap();
        let (client_finished, initiator_master) = initiator.finish(&server_init).unwrap();
        let responder_master = responder.finish(&client_finished).unwrap();

        assert_eq!(
            initiator_master.client_to_server_key,
            responder_master.client_to_server_key
        );
        assert_eq!(
            initiator_master.server_to_client_key,
            responder_master.server_to_client_key
        );
    }

    #[test]
    fn tampered_client_finished_is_rejected() {
        let mut initiator_rng = Deterministic { seed: 9 };
        let mut responder_rng = Deterministic { seed: 55 };

        let (initiator, client_init) = Initiator::start(&mut initiator_rng);
        let (responder, server_init) = Responder::start(&mut responder_rng, &client_init).unwrap();
        let (mut client_finished, _master) = initiator.finish(&server_init).unwrap();
        client_finished.client_public_key[0] ^= 0xff;

        assert_eq!(
            responder.finish(&client_finished).unwrap_err(),
            HandshakeError::KeyAgreement
        );
    }
}
