//! Small byte-sequence helpers shared by the codec and the crypto layer.
//!
//! These are deliberately plain functions over slices; every layer of the
//! protocol trades in owned byte vectors, so helpers return fresh
//! allocations rather than aliasing their input.

/// End-pad `data` with zero bytes to `len`.
///
/// Returns `data` unchanged if it is already `len` bytes or longer.
pub fn pad_end(data: &[u8], len: usize) -> Vec<u8> {
    let mut padded = data.to_vec();
    if padded.len() < len {
        padded.resize(len, 0);
    }
    padded
}

/// Smallest `y >= x` with `y = offset (mod step)`.
///
/// The secure-message padding rule is `generic_ceil(len, 15, 8)`: padding
/// plaintext to 8-mod-15 makes the final payload (plaintext + 2 counter
/// bytes + 4 authentication bytes, plus the type id byte) land exactly on a
/// fragment boundary, so secure messages never carry trailing pad bytes.
pub fn generic_ceil(x: usize, step: usize, offset: usize) -> usize {
    debug_assert!(step > 0);
    let x = x as isize;
    let step = step as isize;
    let offset = offset as isize;
    // ceil((x - offset) / step) for a possibly negative numerator
    let q = (x - offset + step - 1).div_euclid(step);
    (q * step + offset) as usize
}

/// XOR `data` against `other`, truncated to `data`'s length.
///
/// `other` must be at least as long as `data`.
pub fn xor(data: &[u8], other: &[u8]) -> Vec<u8> {
    debug_assert!(other.len() >= data.len());
    data.iter().zip(other).map(|(a, b)| a ^ b).collect()
}

/// Big-endian encoding of a 16-bit value.
pub fn be16(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// Read a big-endian 16-bit value from the first two bytes of `bytes`.
///
/// Returns `None` if fewer than two bytes are available.
pub fn read_be16(bytes: &[u8]) -> Option<u16> {
    let pair: [u8; 2] = bytes.get(..2)?.try_into().ok()?;
    Some(u16::from_be_bytes(pair))
}

/// Check whether bit `index` (0 = least significant) is set in `value`.
pub fn is_bit_set(value: u8, index: u8) -> bool {
    value & (1 << index) != 0
}
