//! Authentication value computation.

use keyble_proto::bytes::{be16, generic_ceil, pad_end, xor};

use crate::nonce::compute_nonce;
use crate::{Key, SessionNonce, aes_ecb_encrypt};

/// Length of an authentication value in bytes.
pub const AUTH_VALUE_LEN: usize = 4;

/// Compute the 4-byte authentication value over `data`.
///
/// CBC-MAC over the zero-padded data, seeded with an encrypted block
/// carrying the nonce and the unpadded data length, then XORed with an
/// independently derived nonce block.
pub fn authentication_value(
    data: &[u8],
    type_id: u8,
    session_nonce: &SessionNonce,
    counter: u16,
    key: &Key,
) -> [u8; AUTH_VALUE_LEN] {
    let nonce = compute_nonce(type_id, session_nonce, counter);
    let padded = pad_end(data, generic_ceil(data.len(), 16, 0));

    let mut seed_block = [0u8; 16];
    seed_block[0] = 9;
    seed_block[1..14].copy_from_slice(&nonce);
    seed_block[14..16].copy_from_slice(&be16(data.len() as u16));
    let mut seed = aes_ecb_encrypt(seed_block, key);

    for block in padded.chunks_exact(16) {
        let mut xored = [0u8; 16];
        xored.copy_from_slice(&xor(&seed, block));
        seed = aes_ecb_encrypt(xored, key);
    }

    let mut final_block = [0u8; 16];
    final_block[0] = 1;
    final_block[1..14].copy_from_slice(&nonce);
    // bytes 14..16 stay zero
    let mask = aes_ecb_encrypt(final_block, key);

    let mut value = [0u8; AUTH_VALUE_LEN];
    for (i, byte) in value.iter_mut().enumerate() {
        *byte = seed[i] ^ mask[i];
    }
    value
}
