//! Parser for the printed key-card data.
//!
//! Every lock ships with a card carrying a QR code whose text encodes the
//! device address, the factory user key and the serial number in one
//! fixed-width string:
//!
//! ```text
//! M<12 hex digits>K<32 hex digits><10 alphanumerics>
//! ```

use thiserror::Error;

/// Exact length of a key-card string.
const CARD_LEN: usize = 1 + 12 + 1 + 32 + 10;

/// Rejections of a key-card string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyCardError {
    /// The string does not have the fixed 56-character shape.
    #[error("malformed key card data: {0:?}")]
    Malformed(String),
}

/// Decoded contents of a key card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCard {
    /// Bluetooth address, colon separated (`AA:BB:CC:DD:EE:FF`).
    pub address: String,
    /// Factory card key, used once during pairing.
    pub key: [u8; 16],
    /// Serial number printed on the card.
    pub serial: String,
}

impl KeyCard {
    /// Parses the text content of a key-card QR code. Surrounding
    /// whitespace is ignored; scanners often append a trailing newline.
    ///
    /// # Errors
    ///
    /// Returns [`KeyCardError::Malformed`] unless the trimmed input is
    /// exactly the 56-character card format, with the offending string in
    /// the message.
    pub fn parse(data: &str) -> Result<Self, KeyCardError> {
        let data = data.trim();
        let malformed = || KeyCardError::Malformed(data.to_owned());
        let bytes = data.as_bytes();
        if bytes.len() != CARD_LEN || bytes[0] != b'M' || bytes[13] != b'K' {
            return Err(malformed());
        }

        let address_hex = &bytes[1..13];
        let key_hex = &bytes[14..46];
        let serial = &bytes[46..56];
        let upper_hex = |b: &u8| b.is_ascii_digit() || (b'A'..=b'F').contains(b);
        // cards print serials in uppercase only
        let serial_char = |b: &u8| b.is_ascii_digit() || b.is_ascii_uppercase();
        if !address_hex.iter().all(upper_hex)
            || !key_hex.iter().all(upper_hex)
            || !serial.iter().all(serial_char)
        {
            return Err(malformed());
        }

        let mut key = [0u8; 16];
        hex::decode_to_slice(key_hex, &mut key).map_err(|_| malformed())?;

        let address = address_hex
            .chunks_exact(2)
            .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(":");

        Ok(Self {
            address,
            key,
            // Validated as ASCII alphanumeric above.
            serial: String::from_utf8_lossy(serial).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    const CARD: &str = "MAABBCCDDEEFFK0102030405060708090A0B0C0D0E0F10SERIAL789A";

    #[test]
    fn parses_a_valid_card() {
        let card = KeyCard::parse(CARD).unwrap();
        assert_eq!(card.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(card.key, hex!("0102030405060708090A0B0C0D0E0F10"));
        assert_eq!(card.serial, "SERIAL789A");
    }

    #[test]
    fn ignores_surrounding_whitespace() {
        let card = KeyCard::parse(&format!("  {CARD}\n")).unwrap();
        assert_eq!(card.serial, "SERIAL789A");
    }

    #[test]
    fn rejects_wrong_length() {
        let err = KeyCard::parse("MAABBCCDDEEFFK01").unwrap_err();
        assert!(matches!(err, KeyCardError::Malformed(_)));
    }

    #[test]
    fn rejects_wrong_markers() {
        let mut s = CARD.to_owned();
        s.replace_range(0..1, "X");
        assert!(KeyCard::parse(&s).is_err());

        let mut s = CARD.to_owned();
        s.replace_range(13..14, "Q");
        assert!(KeyCard::parse(&s).is_err());
    }

    #[test]
    fn rejects_lowercase_hex() {
        let s = CARD.to_lowercase();
        assert!(KeyCard::parse(&s).is_err());
    }

    #[test]
    fn rejects_non_alphanumeric_serial() {
        let mut s = CARD.to_owned();
        s.replace_range(55..56, "!");
        assert!(KeyCard::parse(&s).is_err());
    }

    #[test]
    fn rejects_lowercase_serial() {
        let mut s = CARD.to_owned();
        s.replace_range(46..52, "serial");
        assert!(KeyCard::parse(&s).is_err());
    }
}
