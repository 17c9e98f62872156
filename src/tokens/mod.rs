//! Device tokens and token resolution
//!
//! A token is the 16 byte secret a device needs before it accepts commands.
//! Devices that have not been paired leak it in the checksum field of their
//! handshake reply; paired devices answer with a sentinel instead, and the
//! token must come from storage or manual configuration.

pub mod resolver;
pub mod store;

use crate::error::{MiioError, Result};
use crate::packet::CHECKSUM_LEN;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub use resolver::{TokenResolution, TokenResolver, TOKEN_LOOKUP_TIMEOUT};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};

/// 16 byte device token
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; CHECKSUM_LEN]);

impl Token {
    pub fn new(bytes: [u8; CHECKSUM_LEN]) -> Self {
        Self(bytes)
    }

    /// Interpret the checksum field of a reply.
    ///
    /// Returns `None` when every hex digit of the field is `0` or `f`: the
    /// device is hiding its token and the field is not a usable secret.
    pub fn from_wire(field: &[u8; CHECKSUM_LEN]) -> Option<Self> {
        if is_sentinel(field) {
            None
        } else {
            Some(Self(*field))
        }
    }

    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Check whether a checksum field is the "no token" sentinel
pub fn is_sentinel(field: &[u8; CHECKSUM_LEN]) -> bool {
    field
        .iter()
        .all(|b| matches!(b >> 4, 0x0 | 0xf) && matches!(b & 0x0f, 0x0 | 0xf))
}

impl FromStr for Token {
    type Err = MiioError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| MiioError::invalid_token(format!("{s:?} is not hex: {e}")))?;
        let bytes: [u8; CHECKSUM_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            MiioError::invalid_token(format!(
                "expected {CHECKSUM_LEN} bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Tokens end up in logs through Debug; only show a short prefix.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}…)", &self.to_hex()[..4])
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ffffffffffffffffffffffffffffffff")]
    #[case("00000000000000000000000000000000")]
    #[case("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF")]
    #[case("f0f0f0f00000ffff0f0f0f0f00ff00ff")]
    fn test_sentinel_fields_are_absent(#[case] field: &str) {
        let bytes: [u8; 16] = hex::decode(field).unwrap().try_into().unwrap();
        assert!(is_sentinel(&bytes));
        assert_eq!(Token::from_wire(&bytes), None);
    }

    #[rstest]
    #[case("00112233445566778899aabbccddeeff")]
    #[case("fffffffffffffffffffffffffffffffe")]
    #[case("10000000000000000000000000000000")]
    fn test_real_tokens_are_kept(#[case] field: &str) {
        let bytes: [u8; 16] = hex::decode(field).unwrap().try_into().unwrap();
        let token = Token::from_wire(&bytes).expect("real token");
        assert_eq!(token.to_hex(), field);
    }

    #[test]
    fn test_parse_and_display() {
        let token: Token = "00112233445566778899AABBCCDDEEFF".parse().unwrap();
        assert_eq!(token.to_string(), "00112233445566778899aabbccddeeff");
        assert_eq!(format!("{token:?}"), "Token(0011…)");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("zz".parse::<Token>().is_err());
        assert!("0011".parse::<Token>().is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let token: Token = "00112233445566778899aabbccddeeff".parse().unwrap();
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, "\"00112233445566778899aabbccddeeff\"");
        let back: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }
}
