use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{EventMetadata, ScrubbedEvent};
use crate::identity::{Principal, PublicKey, Role};
use crate::retention::RetentionPolicy;

/// Bootstrap request for the identity app. Unsigned: there is nobody to
/// sign with before the first admin exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRequest {
    pub principal: Principal,
    pub key: PublicKey,
}

/// Admin-signed request to register a new principal. The nonce keeps
/// repeated registrations from colliding in the consensus engine's tx cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub principal: Principal,
    pub role: Role,
    pub public_key: PublicKey,
    pub nonce: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub event: ScrubbedEvent,
    pub nonce: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateResponse {
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCountResponse {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPolicyRequest {
    pub policy: RetentionPolicy,
    pub nonce: Uuid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPolicyResponse {}
