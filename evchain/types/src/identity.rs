use std::fmt;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Maximum length of a principal name in bytes.
pub const MAX_PRINCIPAL_LEN: usize = 255;

/// Errors produced while constructing identity values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrincipalError {
    #[error("principal must not be empty")]
    Empty,
    #[error("principal must be at most {MAX_PRINCIPAL_LEN} bytes, got {0}")]
    TooLong(usize),
}

/// Opaque signer identity. 1..=255 bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Result<Self, PrincipalError> {
        let name = name.into();
        if name.is_empty() {
            return Err(PrincipalError::Empty);
        }
        if name.len() > MAX_PRINCIPAL_LEN {
            return Err(PrincipalError::TooLong(name.len()));
        }
        Ok(Principal(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role attached to an identity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

/// Ed25519 public key, hex encoded in transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verifies an Ed25519 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(&raw).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("public key must encode exactly 32 bytes"))?;
        Ok(PublicKey(bytes))
    }
}

/// On-chain identity record. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub public_key: PublicKey,
    pub role: Role,
}

impl IdentityRecord {
    pub fn new(public_key: PublicKey, role: Role) -> Self {
        IdentityRecord { public_key, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_principals() {
        assert_eq!(Principal::new(""), Err(PrincipalError::Empty));
        let oversized = "x".repeat(MAX_PRINCIPAL_LEN + 1);
        assert!(matches!(
            Principal::new(oversized),
            Err(PrincipalError::TooLong(_))
        ));
        assert!(Principal::new("x".repeat(MAX_PRINCIPAL_LEN)).is_ok());
    }

    #[test]
    fn identity_record_round_trips_with_hex_key() {
        let record = IdentityRecord::new(PublicKey::from_bytes([7u8; 32]), Role::User);
        let encoded = serde_json::to_string(&record).unwrap();
        assert!(encoded.contains(&hex::encode([7u8; 32])));
        assert!(encoded.contains("\"user\""));
        let decoded: IdentityRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record);
    }
}
