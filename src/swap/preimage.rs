use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::rand::{RngCore as _, thread_rng};

pub fn sha256_preimage(preimage: &[u8; 32]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}

/// Hex payment hash of a hex preimage. `None` if the preimage is not 32 bytes of hex.
pub fn payment_hash_hex(preimage_hex: &str) -> Option<String> {
    let bytes: [u8; 32] = hex::decode(preimage_hex).ok()?.try_into().ok()?;
    Some(hex::encode(sha256_preimage(&bytes)))
}

/// Source of fresh swap secrets. Injectable so tests can force collisions.
pub trait PreimageSource: Send {
    fn next_preimage(&mut self) -> [u8; 32];
}

#[derive(Debug, Default)]
pub struct RandomPreimages;

impl PreimageSource for RandomPreimages {
    fn next_preimage(&mut self) -> [u8; 32] {
        let mut out = [0u8; 32];
        thread_rng().fill_bytes(&mut out);
        out
    }
}

/// A fresh `(preimage, r_hash)` pair, both hex encoded.
pub fn generate(source: &mut dyn PreimageSource) -> (String, String) {
    let preimage = source.next_preimage();
    (hex::encode(preimage), hex::encode(sha256_preimage(&preimage)))
}
