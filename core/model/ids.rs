use base64::Engine;
use serde::de::Visitor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("{input:?} is not a valid {kind} id")]
    Malformed { kind: &'static str, input: String },
}

/// Generates a content-independent identifier backed by a v4 UUID.
macro_rules! uuid_id {
    ($name:ident, $label:literal) => {
        #[derive(Copy, Default, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
        pub struct $name(u128);

        impl $name {
            pub(crate) fn next() -> Self {
                Self(uuid::Uuid::new_v4().as_u128())
            }

            pub fn as_uuid(&self) -> uuid::Uuid {
                uuid::Uuid::from_u128(self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.as_uuid().simple().fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s)
                    .map(|u| Self(u.as_u128()))
                    .map_err(|_| IdError::Malformed {
                        kind: $label,
                        input: s.to_string(),
                    })
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct IdVisitor;
                impl<'de> Visitor<'de> for IdVisitor {
                    type Value = $name;

                    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                        formatter.write_str(concat!("a ", $label, " id as a uuid string"))
                    }

                    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        v.parse::<$name>()
                            .map_err(|err| E::custom(err.to_string()))
                    }
                }
                deserializer.deserialize_str(IdVisitor)
            }
        }
    };
}

uuid_id!(CommitId, "commit");
uuid_id!(JobId, "job");

/// The SHA-256 of a blob of bytes, hex encoded.
///
#[derive(Default, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A content-derived identifier for a datum. It is stable across jobs: the same input files
/// under the same names always hash to the same id.
///
/// Datum ids are hex encoded, but they can be looked up by their base64 encoding as well.
///
#[derive(Default, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatumId(String);

impl DatumId {
    /// Hash an ordered list of `(logical path, content hash)` pairs.
    pub fn from_files<'a, I>(files: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a ContentHash)>,
    {
        let mut hasher = Sha256::new();
        for (path, hash) in files {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(hash.as_str().as_bytes());
            hasher.update([0]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Hash the ordered ids of the datums that make up a cross product.
    pub fn combine<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a DatumId>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.0.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a datum id given either as hex or as base64.
    pub fn parse(input: &str) -> Result<Self, IdError> {
        let malformed = || IdError::Malformed {
            kind: "datum",
            input: input.to_string(),
        };

        if input.len() == 64 && input.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(Self(input.to_ascii_lowercase()));
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(input)
            .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(input))
            .map_err(|_| malformed())?;

        if bytes.len() != 32 {
            return Err(malformed());
        }

        Ok(Self(hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        match hex::decode(&self.0) {
            Ok(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
            Err(_) => self.0.clone(),
        }
    }
}

impl std::fmt::Display for DatumId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
