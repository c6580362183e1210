use std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
};

use base64::Engine;
use rand::Rng;

/// A session id: 96 random bits rendered as 16 url-safe base64 characters.
///
/// The encoded form is stored inline so the id is `Copy` and displaying or
/// hashing it never allocates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid([u8; 16]);

impl Sid {
    /// A zeroed session id, only useful as a placeholder.
    pub const ZERO: Self = Sid(*b"AAAAAAAAAAAAAAAA");

    /// Generate a new random session id.
    pub fn new() -> Self {
        let mut raw = [0u8; 12]; // 12 bytes == 16 base64 chars
        rand::thread_rng().fill(&mut raw);

        let mut encoded = [0u8; 16];
        base64::prelude::BASE64_URL_SAFE_NO_PAD
            .encode_slice(raw, &mut encoded)
            .expect("12 bytes always encode to 16 chars");
        Sid(encoded)
    }

    fn as_str(&self) -> &str {
        // SAFETY: the inner buffer always holds base64 characters
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SidParseError {
    #[error("invalid sid length")]
    InvalidLength,
    #[error("invalid url-safe base64 string")]
    InvalidBase64,
}

impl FromStr for Sid {
    type Err = SidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 16 {
            return Err(SidParseError::InvalidLength);
        }
        if !bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_')
        {
            return Err(SidParseError::InvalidBase64);
        }
        let mut encoded = [0u8; 16];
        encoded.copy_from_slice(bytes);
        Ok(Sid(encoded))
    }
}

impl Default for Sid {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Sid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Debug for Sid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for Sid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Sid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SidVisitor;
        impl serde::de::Visitor<'_> for SidVisitor {
            type Value = Sid;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a 16 char url-safe base64 session id")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Sid::from_str(v).map_err(serde::de::Error::custom)
            }
        }
        deserializer.deserialize_str(SidVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_roundtrip() {
        let sid = Sid::new();
        assert_eq!(Sid::from_str(&sid.to_string()).unwrap(), sid);
    }

    #[test]
    fn sid_parse_fixed() {
        let sid = Sid::from_str("AAAAAAAAAAAAAAHs").unwrap();
        assert_eq!(sid.to_string(), "AAAAAAAAAAAAAAHs");
    }

    #[test]
    fn sid_parse_invalid() {
        assert_eq!(Sid::from_str("short").unwrap_err(), SidParseError::InvalidLength);
        assert_eq!(
            Sid::from_str("aoassaAZDoin#zd{").unwrap_err(),
            SidParseError::InvalidBase64
        );
    }

    #[test]
    fn sid_serde() {
        let sid = Sid::new();
        let json = serde_json::to_string(&sid).unwrap();
        assert_eq!(json, format!("\"{sid}\""));
        assert_eq!(serde_json::from_str::<Sid>(&json).unwrap(), sid);
    }
}
