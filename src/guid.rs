//! The server GUID exchanged during the SASL handshake.
//!
//! D-Bus GUIDs are 32 lowercase hex characters (128 bits), picked by whichever side
//! generates them and then just carried around as an opaque identifier.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Guid(String);

impl Guid {
    /// Generate a new random GUID, the way a bus server would mint one for a connecting peer.
    pub fn generate() -> Self {
        let mut s = String::with_capacity(32);
        for _ in 0..32 {
            let nibble = fastrand::u8(0..16);
            s.push(std::char::from_digit(nibble as u32, 16).unwrap());
        }
        Guid(s)
    }

    /// Parse a GUID from the hex string sent in the handshake's `OK <guid>` line.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Guid(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_guid_is_32_lowercase_hex_chars() {
        let guid = Guid::generate();
        assert_eq!(guid.as_str().len(), 32);
        assert!(guid.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(Guid::from_hex("deadbeef").is_none());
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        let bad = "z".repeat(32);
        assert!(Guid::from_hex(&bad).is_none());
    }

    #[test]
    fn from_hex_accepts_valid_guid() {
        let s = "0".repeat(32);
        assert_eq!(Guid::from_hex(&s).unwrap().as_str(), s);
    }
}
