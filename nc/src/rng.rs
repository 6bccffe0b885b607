//! The production `Generator` this crate hands to the transport layer
//! outside of tests, backed by the operating system's CSPRNG.

use nc_core::random::Generator;
use rand::RngCore;

/// Adapts `rand::rngs::OsRng` to `nc_core::random::Generator`. Both public
/// and private fills draw from the same OS source; the trait's split only
/// matters for swapping in a weaker fake in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsGenerator;

impl Generator for OsGenerator {
    fn public_random_fill(&mut self, dest: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(dest);
    }

    fn private_random_fill(&mut self, dest: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(dest);
    }
}
