//! Adapts the workspace's `nc_core::random::Generator` capability trait to
//! the `rand_core::RngCore`/`CryptoRng` traits the elliptic-curve crate
//! expects, so the handshake never reaches for `OsRng` directly and stays
//! swappable with the deterministic test generator.

use nc_core::random::Generator;
use rand_core::{CryptoRng, RngCore};

pub struct GeneratorRng<'a, G: Generator + ?Sized>(pub &'a mut G);

impl<'a, G: Generator + ?Sized> RngCore for GeneratorRng<'a, G> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.0.private_random_fill(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.0.private_random_fill(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.private_random_fill(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.0.private_random_fill(dest);
        Ok(())
    }
}

// The generator is documented as producing secret-grade randomness via
// `private_random_fill`; this marker lets it satisfy APIs that require a
// cryptographically secure source (e.g. `p256::ecdh::EphemeralSecret::random`).
impl<'a, G: Generator + ?Sized> CryptoRng for GeneratorRng<'a, G> {}
