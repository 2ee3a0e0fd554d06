//! Authorization nonces: 32 opaque random bytes from the OS CSPRNG.
//!
//! The generator does not track what it has produced. Uniqueness per `(chainId, nonce)` is
//! enforced by the authorization store.

use rand::RngCore;
use rand::rngs::OsRng;

use crate::types::HexEncodedNonce;

#[derive(Debug, Default, Clone, Copy)]
pub struct NonceGenerator;

impl NonceGenerator {
    pub fn generate(&self) -> HexEncodedNonce {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        HexEncodedNonce(bytes)
    }
}
