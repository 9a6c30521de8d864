//! Keystream encryption/decryption.

use keyble_proto::bytes::{be16, xor};

use crate::nonce::compute_nonce;
use crate::{Key, SessionNonce, aes_ecb_encrypt};

/// Encrypt or decrypt `data` with the lock's CTR-style keystream.
///
/// Keystream block `i` (1-based) is the AES encryption of
/// `[1] ++ nonce ++ be16(i)`; the keystream is XORed byte-wise against
/// `data` and truncated to its length. Pure XOR, so applying the function
/// twice with equal parameters returns the original data.
pub fn crypt_data(
    data: &[u8],
    type_id: u8,
    session_nonce: &SessionNonce,
    counter: u16,
    key: &Key,
) -> Vec<u8> {
    let nonce = compute_nonce(type_id, session_nonce, counter);
    let blocks = data.len().div_ceil(16);
    let mut keystream = Vec::with_capacity(blocks * 16);
    for index in 0..blocks {
        let mut block = [0u8; 16];
        block[0] = 1;
        block[1..14].copy_from_slice(&nonce);
        block[14..16].copy_from_slice(&be16(index as u16 + 1));
        keystream.extend_from_slice(&aes_ecb_encrypt(block, key));
    }
    xor(data, &keystream)
}
