use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::identity::{Principal, PublicKey};

/// Outer transaction framing: the multiplexer dispatches on `app`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxEnvelope {
    pub app: String,
    pub data: Box<RawValue>,
}

/// Inner request: a type tag plus type-specific data. The signature of a
/// [`SignedPayload`] covers the exact `data` bytes as transmitted, so the
/// raw JSON text is carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub request_type: String,
    pub data: Box<RawValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedPayload {
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPayload {
    pub payload: Payload,
    /// Who is making the request.
    pub principal: Principal,
    /// Hex-encoded Ed25519 signature over `payload.data`.
    pub signature: String,
}

impl SignedPayload {
    /// Checks the signature against the given public key. Returns `false`
    /// for a well-formed but wrong signature; errors only on bad hex.
    pub fn validate_signature(&self, public_key: &PublicKey) -> Result<bool, hex::FromHexError> {
        let signature = hex::decode(&self.signature)?;
        Ok(public_key.verify(self.payload.data.get().as_bytes(), &signature))
    }
}

#[derive(Debug, Error)]
pub enum TxBuildError {
    #[error("no request data set on builder")]
    MissingData,
    #[error("no target app set on builder")]
    MissingApp,
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

enum SigningMode {
    Unsigned,
    Signed { principal: Principal, key: SigningKey },
}

/// Builds [`TxEnvelope`]s the way submitting agents do: pick an app, attach
/// a typed request body, and optionally sign it.
pub struct TxBuilder {
    app: Option<String>,
    request_type: Option<String>,
    data: Option<Vec<u8>>,
    mode: SigningMode,
}

impl TxBuilder {
    pub fn new() -> Self {
        TxBuilder {
            app: None,
            request_type: None,
            data: None,
            mode: SigningMode::Unsigned,
        }
    }

    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    pub fn data<T: Serialize>(
        mut self,
        request_type: impl Into<String>,
        data: &T,
    ) -> Result<Self, TxBuildError> {
        self.request_type = Some(request_type.into());
        self.data = Some(serde_json::to_vec(data)?);
        Ok(self)
    }

    pub fn signed(mut self, principal: Principal, key: SigningKey) -> Self {
        self.mode = SigningMode::Signed { principal, key };
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.mode = SigningMode::Unsigned;
        self
    }

    pub fn build(self) -> Result<TxEnvelope, TxBuildError> {
        let app = self.app.ok_or(TxBuildError::MissingApp)?;
        let (request_type, data) = match (self.request_type, self.data) {
            (Some(request_type), Some(data)) => (request_type, data),
            _ => return Err(TxBuildError::MissingData),
        };

        let data = RawValue::from_string(String::from_utf8(data).expect("json is utf-8"))?;
        let payload = Payload {
            request_type,
            data,
        };

        let inner = match self.mode {
            SigningMode::Unsigned => serde_json::to_string(&UnsignedPayload { payload })?,
            SigningMode::Signed { principal, key } => {
                let signature = key.sign(payload.data.get().as_bytes());
                serde_json::to_string(&SignedPayload {
                    payload,
                    principal,
                    signature: hex::encode(signature.to_bytes()),
                })?
            }
        };

        Ok(TxEnvelope {
            app,
            data: RawValue::from_string(inner)?,
        })
    }

    pub fn marshal(self) -> Result<Vec<u8>, TxBuildError> {
        Ok(serde_json::to_vec(&self.build()?)?)
    }
}

impl Default for TxBuilder {
    fn default() -> Self {
        TxBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes;
    use crate::requests::SeedRequest;
    use rand::rngs::OsRng;

    #[test]
    fn signed_payload_verifies_with_matching_key() {
        let key = SigningKey::generate(&mut OsRng);
        let public = PublicKey::from_bytes(key.verifying_key().to_bytes());
        let principal = Principal::new("alice").unwrap();

        let envelope = TxBuilder::new()
            .app(codes::identity::APP_NAME)
            .data(
                codes::identity::REQUEST_REGISTER,
                &serde_json::json!({"principal": "bob"}),
            )
            .unwrap()
            .signed(principal.clone(), key)
            .build()
            .unwrap();

        let signed: SignedPayload = serde_json::from_str(envelope.data.get()).unwrap();
        assert_eq!(signed.principal, principal);
        assert!(signed.validate_signature(&public).unwrap());

        let other = SigningKey::generate(&mut OsRng);
        let wrong = PublicKey::from_bytes(other.verifying_key().to_bytes());
        assert!(!signed.validate_signature(&wrong).unwrap());
    }

    #[test]
    fn unsigned_seed_round_trips() {
        let request = SeedRequest {
            principal: Principal::new("admin").unwrap(),
            key: PublicKey::from_bytes([1u8; 32]),
        };
        let bytes = TxBuilder::new()
            .app(codes::identity::APP_NAME)
            .data(codes::identity::REQUEST_SEED, &request)
            .unwrap()
            .unsigned()
            .marshal()
            .unwrap();

        let envelope: TxEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope.app, codes::identity::APP_NAME);
        let unsigned: UnsignedPayload = serde_json::from_str(envelope.data.get()).unwrap();
        assert_eq!(unsigned.payload.request_type, codes::identity::REQUEST_SEED);
        let decoded: SeedRequest = serde_json::from_str(unsigned.payload.data.get()).unwrap();
        assert_eq!(decoded, request);
    }
}
