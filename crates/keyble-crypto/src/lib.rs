//! Cryptographic engine for the eqiva smart lock protocol.
//!
//! The lock firmware implements a custom authenticated-encryption scheme
//! built entirely from AES-128 single-block ECB encryption: a 13-byte nonce
//! derived from message type, session nonce and security counter; a 4-byte
//! CBC-MAC-style authentication value; and a CTR-style XOR keystream used
//! for both encryption and decryption.
//!
//! All three functions are pure and deterministic and must stay bit-exact:
//! any divergence breaks interoperability with the physical lock.
//!
//! # Security
//!
//! This is NOT a standard AEAD construction; it is a faithful
//! reimplementation of what the lock firmware speaks. Nonce uniqueness is
//! the session layer's responsibility: a session nonce must never be reused
//! with the same key, and security counters must strictly increase.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod nonce;
pub mod stream;

pub use auth::{AUTH_VALUE_LEN, authentication_value};
pub use nonce::{NONCE_LEN, compute_nonce};
pub use stream::crypt_data;

/// An AES-128 key.
pub type Key = [u8; 16];

/// An 8-byte session nonce, exchanged once per connection.
pub type SessionNonce = [u8; 8];

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};

/// AES-128-encrypt a single 16-byte block in ECB mode.
pub(crate) fn aes_ecb_encrypt(block: [u8; 16], key: &Key) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::from(block);
    cipher.encrypt_block(&mut block);
    block.into()
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn aes_block_known_vector() {
        // FIPS-197 style check against an independently computed vector
        let key: Key = hex!("000102030405060708090a0b0c0d0e0f");
        let out = aes_ecb_encrypt([0u8; 16], &key);
        assert_eq!(out, hex!("c6a13b37878f5b826f4f8162a1c8d879"));
    }
}
