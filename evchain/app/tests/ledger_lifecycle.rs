use chrono::{TimeZone, Utc};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use uuid::Uuid;

use evchain_app::{
    EventsApp, EventsRepository, FinalizeBlockRequest, IdentityApp, IdentityRepository, LedgerDb,
    Multiplexer, QueryRequest, RetentionPolicyApp, SubApp,
};
use evchain_types::codes::{events, identity, multiplex, retention};
use evchain_types::{
    CreateRequest, CreateResponse, EventPayload, IdentityRecord, MatchRule, PayloadField,
    PolicyAction, PolicyType, Principal, PublicKey, RegisterRequest, RetentionFilter,
    RetentionPolicy, Role, RuleGroup, ScrubbedEvent, SeedRequest, SetPolicyRequest, SystemMetadata,
    TxBuilder,
};

struct Harness {
    _dir: TempDir,
    muxer: Multiplexer,
    admin_key: SigningKey,
    admin: Principal,
    height: i64,
}

fn scrubbed_event(channel: &str, payload: &EventPayload) -> ScrubbedEvent {
    ScrubbedEvent {
        system: SystemMetadata {
            event_id: 4624,
            channel: channel.to_string(),
            computer: "dc-01".to_string(),
            ..SystemMetadata::default()
        },
        off_chain_hash: payload.hash_hex().unwrap(),
    }
}

fn sample_payload() -> EventPayload {
    EventPayload(vec![PayloadField {
        name: Some("SubjectUserName".into()),
        value: Some("user".into()),
    }])
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = LedgerDb::open(dir.path().join("ledger")).unwrap();

        let identities = IdentityRepository::load(db.clone()).unwrap();
        let events_repo = EventsRepository::load(db.clone()).unwrap();

        let apps: Vec<Box<dyn SubApp>> = vec![
            Box::new(IdentityApp::new(identities.clone())),
            Box::new(EventsApp::new(events_repo, identities.clone())),
            Box::new(RetentionPolicyApp::load(db.clone(), identities).unwrap()),
        ];
        let mut muxer = Multiplexer::new(db, apps).unwrap();
        muxer.init_chain();

        Harness {
            _dir: dir,
            muxer,
            admin_key: SigningKey::generate(&mut OsRng),
            admin: Principal::new("admin").unwrap(),
            height: 0,
        }
    }

    fn admin_public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.admin_key.verifying_key().to_bytes())
    }

    fn run_block(&mut self, txs: Vec<Vec<u8>>) -> evchain_app::FinalizeBlockResponse {
        self.height += 1;
        let response = self.muxer.finalize_block(FinalizeBlockRequest {
            height: self.height,
            time: Utc.timestamp_opt(1_700_000_000 + self.height, 0).unwrap(),
            txs,
            misbehavior: Vec::new(),
        });
        self.muxer.commit().unwrap();
        response
    }

    fn seed_tx(&self) -> Vec<u8> {
        TxBuilder::new()
            .app(identity::APP_NAME)
            .data(
                identity::REQUEST_SEED,
                &SeedRequest {
                    principal: self.admin.clone(),
                    key: self.admin_public_key(),
                },
            )
            .unwrap()
            .unsigned()
            .marshal()
            .unwrap()
    }

    fn register_tx(&self, principal: &str, role: Role, key: PublicKey) -> Vec<u8> {
        TxBuilder::new()
            .app(identity::APP_NAME)
            .data(
                identity::REQUEST_REGISTER,
                &RegisterRequest {
                    principal: Principal::new(principal).unwrap(),
                    role,
                    public_key: key,
                    nonce: Uuid::new_v4(),
                },
            )
            .unwrap()
            .signed(self.admin.clone(), self.admin_key.clone())
            .marshal()
            .unwrap()
    }

    fn create_tx(&self, event: &ScrubbedEvent) -> Vec<u8> {
        TxBuilder::new()
            .app(events::APP_NAME)
            .data(
                events::REQUEST_CREATE,
                &CreateRequest {
                    event: event.clone(),
                    nonce: Uuid::new_v4(),
                },
            )
            .unwrap()
            .signed(self.admin.clone(), self.admin_key.clone())
            .marshal()
            .unwrap()
    }

    fn set_policy_tx(&self, policy: &RetentionPolicy) -> Vec<u8> {
        TxBuilder::new()
            .app(retention::APP_NAME)
            .data(
                retention::REQUEST_SET_POLICY,
                &SetPolicyRequest {
                    policy: policy.clone(),
                    nonce: Uuid::new_v4(),
                },
            )
            .unwrap()
            .signed(self.admin.clone(), self.admin_key.clone())
            .marshal()
            .unwrap()
    }
}

fn sample_policy() -> RetentionPolicy {
    RetentionPolicy {
        filters: vec![RetentionFilter {
            label: "security-90d".into(),
            match_rule: MatchRule {
                channel: Some("Security".into()),
                ..MatchRule::default()
            },
            policy: PolicyAction {
                policy_type: PolicyType::Timestamp,
                rule_group: None,
                retention_period_secs: 90 * 24 * 3600,
                volume: 0,
            },
        }],
    }
}

#[test]
fn seed_then_register_then_query() {
    let mut harness = Harness::new();

    // First seed succeeds and marks the registry as bootstrapped.
    let response = harness.run_block(vec![harness.seed_tx()]);
    assert_eq!(response.tx_results[0].code, identity::CODE_OK);

    // A second seed is rejected deterministically.
    let response = harness.run_block(vec![harness.seed_tx()]);
    assert_eq!(response.tx_results[0].code, identity::CODE_ALREADY_SEEDED);

    // The admin registers a user.
    let user_key = PublicKey::from_bytes([3u8; 32]);
    let response = harness.run_block(vec![harness.register_tx("user1", Role::User, user_key)]);
    assert_eq!(response.tx_results[0].code, identity::CODE_OK);

    // Query returns the record with an inclusion proof.
    let response = harness.muxer.query(
        identity::APP_NAME,
        &QueryRequest {
            path: "/user1".to_string(),
            height: 0,
            prove: true,
        },
    );
    assert_eq!(response.code, identity::CODE_OK);
    let record: IdentityRecord = serde_json::from_slice(&response.value).unwrap();
    assert_eq!(record.role, Role::User);
    assert_eq!(record.public_key, user_key);
    assert!(response.proof.is_some());
}

#[test]
fn duplicate_seed_within_one_block_admits_exactly_one() {
    let mut harness = Harness::new();
    let response = harness.run_block(vec![harness.seed_tx(), harness.seed_tx()]);
    assert_eq!(response.tx_results[0].code, identity::CODE_OK);
    assert_eq!(response.tx_results[1].code, identity::CODE_ALREADY_SEEDED);
}

#[test]
fn non_admin_register_is_unauthorized() {
    let mut harness = Harness::new();
    harness.run_block(vec![harness.seed_tx()]);

    let user_key = SigningKey::generate(&mut OsRng);
    let user_public = PublicKey::from_bytes(user_key.verifying_key().to_bytes());
    harness.run_block(vec![harness.register_tx("user1", Role::User, user_public)]);

    let tx = TxBuilder::new()
        .app(identity::APP_NAME)
        .data(
            identity::REQUEST_REGISTER,
            &RegisterRequest {
                principal: Principal::new("user2").unwrap(),
                role: Role::User,
                public_key: PublicKey::from_bytes([9u8; 32]),
                nonce: Uuid::new_v4(),
            },
        )
        .unwrap()
        .signed(Principal::new("user1").unwrap(), user_key)
        .marshal()
        .unwrap();

    let response = harness.run_block(vec![tx]);
    assert_eq!(response.tx_results[0].code, identity::CODE_UNAUTHORIZED);
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut harness = Harness::new();
    harness.run_block(vec![harness.seed_tx()]);

    let key = PublicKey::from_bytes([3u8; 32]);
    let response = harness.run_block(vec![
        harness.register_tx("user1", Role::User, key),
        harness.register_tx("user1", Role::User, key),
    ]);
    assert_eq!(response.tx_results[0].code, identity::CODE_OK);
    assert_eq!(
        response.tx_results[1].code,
        identity::CODE_PRINCIPAL_ALREADY_EXISTS
    );

    let response = harness.run_block(vec![harness.register_tx("user1", Role::User, key)]);
    assert_eq!(
        response.tx_results[0].code,
        identity::CODE_PRINCIPAL_ALREADY_EXISTS
    );
}

#[test]
fn create_event_emits_typed_event_and_is_queryable() {
    let mut harness = Harness::new();
    harness.run_block(vec![harness.seed_tx()]);

    let payload = sample_payload();
    let event = scrubbed_event("Security", &payload);
    let response = harness.run_block(vec![harness.create_tx(&event)]);
    let result = &response.tx_results[0];
    assert_eq!(result.code, events::CODE_OK);

    let typed = &result.events[0];
    assert_eq!(typed.kind, events::EVENT_CREATE);
    let event_id_attr = typed
        .attributes
        .iter()
        .find(|attribute| attribute.key == events::ATTRIBUTE_EVENT_ID)
        .unwrap();

    let created: CreateResponse = serde_json::from_slice(&result.data).unwrap();
    assert_eq!(created.metadata.event_id.to_hex(), event_id_attr.value);
    assert_eq!(created.metadata.principal, harness.admin);

    let response = harness.muxer.query(
        events::APP_NAME,
        &QueryRequest {
            path: format!("/event-by-id/{}", created.metadata.event_id.to_hex()),
            height: 0,
            prove: true,
        },
    );
    assert_eq!(response.code, events::CODE_OK);
    assert!(response.proof.is_some());

    let count = harness.muxer.query(
        events::APP_NAME,
        &QueryRequest {
            path: "/count".to_string(),
            height: 0,
            prove: false,
        },
    );
    assert_eq!(count.code, events::CODE_OK);
    assert_eq!(
        serde_json::from_slice::<evchain_types::EventCountResponse>(&count.value)
            .unwrap()
            .count,
        1
    );
}

#[test]
fn identical_creates_in_one_block_deduplicate() {
    let mut harness = Harness::new();
    harness.run_block(vec![harness.seed_tx()]);

    let payload = sample_payload();
    let event = scrubbed_event("Security", &payload);
    // Separate txs (distinct nonces) carrying the same event still collide
    // on the derived event id within one block.
    let response = harness.run_block(vec![harness.create_tx(&event), harness.create_tx(&event)]);
    assert_eq!(response.tx_results[0].code, events::CODE_OK);
    assert_eq!(response.tx_results[1].code, events::CODE_UNKNOWN_ERROR);
}

#[test]
fn retention_policy_is_single_shot() {
    let mut harness = Harness::new();
    harness.run_block(vec![harness.seed_tx()]);

    let response = harness.run_block(vec![harness.set_policy_tx(&sample_policy())]);
    assert_eq!(response.tx_results[0].code, retention::CODE_OK);

    let response = harness.run_block(vec![harness.set_policy_tx(&sample_policy())]);
    assert_eq!(
        response.tx_results[0].code,
        retention::CODE_POLICY_ALREADY_SET
    );

    let response = harness.muxer.query(
        retention::APP_NAME,
        &QueryRequest {
            path: "/".to_string(),
            height: 0,
            prove: false,
        },
    );
    assert_eq!(response.code, retention::CODE_OK);
    let stored: evchain_types::StoredPolicy = serde_json::from_slice(&response.value).unwrap();
    assert_eq!(stored.author, harness.admin);
}

#[test]
fn unset_policy_query_reports_policy_not_set() {
    let harness = Harness::new();
    let response = harness.muxer.query(
        retention::APP_NAME,
        &QueryRequest {
            path: "/".to_string(),
            height: 0,
            prove: false,
        },
    );
    assert_eq!(response.code, retention::CODE_POLICY_NOT_SET);
}

#[test]
fn unknown_app_is_rejected() {
    let harness = Harness::new();
    let tx = br#"{"app":"nonsense","data":{}}"#.to_vec();
    let response = harness.muxer.check_tx(&tx);
    assert_eq!(response.code, multiplex::CODE_UNKNOWN_APP);
}

#[test]
fn composite_hash_is_sha256_over_sorted_sub_roots() {
    let mut harness = Harness::new();
    let response = harness.run_block(vec![harness.seed_tx()]);

    // Reconstruct: info() exposes each sub-app root; names sort as
    // events < identity < retention_policy.
    let info = harness.muxer.info();
    let mut digest = Sha256::new();
    let apps = info.data.as_object().unwrap();
    let mut names: Vec<&String> = apps.keys().collect();
    names.sort();
    for name in names {
        let root = apps[name]["app_hash"].as_str().unwrap();
        digest.update(hex::decode(root).unwrap());
    }
    let expected: Vec<u8> = digest.finalize().to_vec();
    assert_eq!(response.app_hash, expected);
}

#[test]
fn duplicate_vote_evidence_decrements_validator_power() {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use evchain_app::{Misbehavior, MisbehaviorKind};

    let mut harness = Harness::new();

    // Register a validator through the distinguished tx form.
    let pub_key = [9u8; 32];
    let validator_tx = format!("val:ed25519!{}!5", BASE64.encode(pub_key)).into_bytes();
    let response = harness.run_block(vec![validator_tx]);
    assert_eq!(response.tx_results[0].code, multiplex::CODE_OK);
    assert_eq!(response.validator_updates.len(), 1);

    // Its address is the truncated SHA-256 of the public key.
    let digest: [u8; 32] = Sha256::digest(pub_key).into();
    let address = digest[..20].to_vec();

    harness.height += 1;
    let response = harness.muxer.finalize_block(FinalizeBlockRequest {
        height: harness.height,
        time: Utc.timestamp_opt(1_700_000_000 + harness.height, 0).unwrap(),
        txs: Vec::new(),
        misbehavior: vec![
            Misbehavior {
                kind: MisbehaviorKind::DuplicateVote,
                validator_address: address.clone(),
                power: 5,
            },
            // Unknown validators are skipped, not fatal.
            Misbehavior {
                kind: MisbehaviorKind::DuplicateVote,
                validator_address: vec![0u8; 20],
                power: 3,
            },
        ],
    });
    harness.muxer.commit().unwrap();

    assert_eq!(response.validator_updates.len(), 1);
    let update = &response.validator_updates[0];
    assert_eq!(update.pub_key, pub_key.to_vec());
    assert_eq!(update.power, 4);

    // Power is clamped at zero.
    harness.height += 1;
    let response = harness.muxer.finalize_block(FinalizeBlockRequest {
        height: harness.height,
        time: Utc.timestamp_opt(1_700_000_000 + harness.height, 0).unwrap(),
        txs: Vec::new(),
        misbehavior: vec![Misbehavior {
            kind: MisbehaviorKind::DuplicateVote,
            validator_address: address,
            power: 0,
        }],
    });
    assert_eq!(response.validator_updates[0].power, 0);
}

#[test]
fn commit_applies_staged_writes_in_block_order() {
    let mut harness = Harness::new();
    harness.run_block(vec![harness.seed_tx()]);

    // Both registrations land in one block; after commit both are durable
    // and visible to queries.
    let response = harness.run_block(vec![
        harness.register_tx("user1", Role::User, PublicKey::from_bytes([3u8; 32])),
        harness.register_tx("user2", Role::Admin, PublicKey::from_bytes([4u8; 32])),
    ]);
    assert!(response
        .tx_results
        .iter()
        .all(|result| result.code == identity::CODE_OK));

    for (name, role) in [("user1", Role::User), ("user2", Role::Admin)] {
        let response = harness.muxer.query(
            identity::APP_NAME,
            &QueryRequest {
                path: format!("/{name}"),
                height: 0,
                prove: false,
            },
        );
        assert_eq!(response.code, identity::CODE_OK);
        let record: IdentityRecord = serde_json::from_slice(&response.value).unwrap();
        assert_eq!(record.role, role);
    }
}
