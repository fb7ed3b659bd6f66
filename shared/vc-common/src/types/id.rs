//! Identifier Types

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize};

/// Opaque identifier for channels and users.
///
/// The relay historically used numeric ids while newer clients send strings,
/// so both JSON numbers and JSON strings are accepted. Always serialized as a
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WireId(String);

/// Voice channel id.
pub type ChannelId = WireId;

/// User id of a channel member.
pub type UserId = WireId;

impl WireId {
    /// Create an id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (treated as missing by the relay).
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for WireId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WireId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for WireId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for WireId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for WireId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct WireIdVisitor;

        impl de::Visitor<'_> for WireIdVisitor {
            type Value = WireId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or integer id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(WireId::new(v))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(WireId(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(WireId(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(WireId(v.to_string()))
            }
        }

        deserializer.deserialize_any(WireIdVisitor)
    }
}
