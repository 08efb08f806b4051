use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, warn};

use evchain_types::codes::{events as event_codes, identity as identity_codes, retention};
use evchain_types::proof::TreeProof;
use evchain_types::{
    CreateResponse, EventMetadata, EventWithMetadata, IdentityRecord, MissingEvent, Principal,
    StoredPolicy, TxHash,
};

use crate::error::ClientError;
use crate::pool::{Pool, PoolConfig, PoolMember};
use crate::rpc::{AbciQueryResponse, RpcClient};

#[async_trait]
impl PoolMember for RpcClient {
    async fn probe(&self) -> bool {
        self.abci_info().await.is_ok()
    }

    async fn close(&self) {}
}

/// Pool-backed chain client. Reads rotate across live nodes; the retention
/// policy is cross-checked against a quorum so one malicious node cannot
/// serve a divergent policy.
pub struct RoundRobinClient {
    pool: Pool<RpcClient>,
    minimum_nodes: usize,
}

fn app_query_data(app: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "app": app })).expect("static json")
}

/// Structural check of a query proof: the value must be the proven one and
/// absence proofs must bound the key consistently.
fn check_query_proof(response: &AbciQueryResponse, key: &[u8]) -> Result<(), ClientError> {
    let Some(proof) = &response.proof else {
        return Ok(());
    };

    match proof {
        TreeProof::Existence(existence) => {
            let root = existence.compute_root();
            let proven = proof.verify(&root, key)?;
            if proven.as_deref() != Some(response.value.as_slice()) {
                return Err(evchain_types::proof::ProofError::Invalid(
                    "proof does not cover the returned value",
                )
                .into());
            }
        }
        TreeProof::Absence(absence) => {
            let root = absence
                .left
                .as_ref()
                .or(absence.right.as_ref())
                .map(|side| side.compute_root())
                .unwrap_or_else(evchain_types::proof::empty_hash);
            proof.verify(&root, key)?;
        }
    }
    Ok(())
}

impl RoundRobinClient {
    pub async fn connect(
        addresses: &[String],
        minimum_nodes: usize,
        pool_config: PoolConfig,
    ) -> Result<Self, ClientError> {
        let mut clients = Vec::with_capacity(addresses.len());
        for address in addresses {
            clients.push(RpcClient::new(address.clone())?);
        }
        Ok(RoundRobinClient {
            pool: Pool::new(clients, pool_config).await,
            minimum_nodes: minimum_nodes.max(1),
        })
    }

    pub fn pool(&self) -> &Pool<RpcClient> {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get_identity(
        &self,
        principal: &Principal,
    ) -> Result<IdentityRecord, ClientError> {
        let conn = self.pool.get().await?;
        let response = conn
            .abci_query(
                &format!("/{principal}"),
                &app_query_data(identity_codes::APP_NAME),
                0,
                true,
            )
            .await?;

        if response.code == identity_codes::CODE_NOT_FOUND {
            return Err(ClientError::PrincipalNotFound);
        }
        if response.code != identity_codes::CODE_OK {
            return Err(ClientError::QueryFailed {
                codespace: response.codespace,
                code: response.code,
                log: response.log,
            });
        }

        check_query_proof(&response, principal.as_bytes())?;
        Ok(serde_json::from_slice(&response.value)?)
    }

    pub async fn get_event_by_id(
        &self,
        event_id: &evchain_types::EventId,
    ) -> Result<EventWithMetadata, ClientError> {
        let conn = self.pool.get().await?;
        let response = conn
            .abci_query(
                &format!("/event-by-id/{}", event_id.to_hex()),
                &app_query_data(event_codes::APP_NAME),
                0,
                true,
            )
            .await?;

        if response.code == event_codes::CODE_EVENT_NOT_FOUND {
            return Err(ClientError::EventNotFound);
        }
        if response.code != event_codes::CODE_OK {
            return Err(ClientError::QueryFailed {
                codespace: response.codespace,
                code: response.code,
                log: response.log,
            });
        }

        check_query_proof(&response, event_id.as_bytes())?;
        Ok(serde_json::from_slice(&response.value)?)
    }

    pub async fn get_event_metadata_by_tx(
        &self,
        tx_hash: &TxHash,
    ) -> Result<EventMetadata, ClientError> {
        let conn = self.pool.get().await?;
        let tx = conn.tx(tx_hash).await?;
        let response: CreateResponse = serde_json::from_slice(&tx.tx_result.data)?;
        Ok(response.metadata)
    }

    pub async fn get_event_by_tx(
        &self,
        tx_hash: &TxHash,
    ) -> Result<EventWithMetadata, ClientError> {
        let metadata = self.get_event_metadata_by_tx(tx_hash).await?;
        self.get_event_by_id(&metadata.event_id).await
    }

    /// Searches for admitted events in the half-open height range
    /// `[lower, upper)`. Returns the page's events and the total match
    /// count reported by the node.
    pub async fn search_events(
        &self,
        lower_height: i64,
        upper_height: i64,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<MissingEvent>, u64), ClientError> {
        let conn = self.pool.get().await?;
        let query = format!(
            "tx.height >= {lower_height} AND tx.height < {upper_height} AND {}.{}='{}'",
            event_codes::EVENT_CREATE,
            event_codes::ATTRIBUTE_TYPE,
            event_codes::ATTRIBUTE_VALUE_CREATE,
        );
        let result = conn.tx_search(&query, page, per_page).await?;

        let mut missing = Vec::with_capacity(result.txs.len());
        for tx in &result.txs {
            let decoded: CreateResponse = match serde_json::from_slice(&tx.tx_result.data) {
                Ok(decoded) => decoded,
                Err(err) => {
                    // Return every transaction we can still use.
                    error!(?err, tx_hash = %tx.hash, "failed to decode tx result data");
                    continue;
                }
            };
            missing.push(MissingEvent::new(
                decoded.metadata.event_id,
                Utc::now(),
                tx.height,
            ));
        }

        Ok((missing, result.total_count))
    }

    /// Fetches the retention policy from every live node and compares the
    /// answers. Requires at least `minimum_nodes` responses; any divergence
    /// fails the whole read.
    pub async fn get_retention_policy(&self) -> Result<Option<StoredPolicy>, ClientError> {
        let clients = self.pool.get_all(false).await;
        if clients.len() < self.minimum_nodes {
            return Err(ClientError::NotEnoughNodes {
                required: self.minimum_nodes,
                available: clients.len(),
            });
        }

        let mut policies: Vec<Option<StoredPolicy>> = Vec::with_capacity(clients.len());
        for client in &clients {
            match fetch_policy(client).await {
                Ok(policy) => policies.push(policy),
                Err(err) => {
                    warn!(?err, client = client.remote(), "failed to get retention policy");
                }
            }
        }

        if policies.len() < self.minimum_nodes {
            return Err(ClientError::NotEnoughNodes {
                required: self.minimum_nodes,
                available: policies.len(),
            });
        }

        resolve_policy_quorum(policies)
    }
}

async fn fetch_policy(client: &RpcClient) -> Result<Option<StoredPolicy>, ClientError> {
    let response = client
        .abci_query("/", &app_query_data(retention::APP_NAME), 0, false)
        .await?;

    if response.codespace == retention::CODESPACE && response.code == retention::CODE_OK {
        Ok(Some(serde_json::from_slice(&response.value)?))
    } else if response.codespace == retention::CODESPACE
        && response.code == retention::CODE_POLICY_NOT_SET
    {
        Ok(None)
    } else {
        Err(ClientError::QueryFailed {
            codespace: response.codespace,
            code: response.code,
            log: response.log,
        })
    }
}

/// Pure quorum comparison: all answers must agree exactly.
pub fn resolve_policy_quorum(
    policies: Vec<Option<StoredPolicy>>,
) -> Result<Option<StoredPolicy>, ClientError> {
    let mut iter = policies.into_iter();
    let Some(first) = iter.next() else {
        return Ok(None);
    };
    for policy in iter {
        if policy != first {
            return Err(ClientError::PolicyMismatch);
        }
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evchain_types::{
        MatchRule, PolicyAction, PolicyType, RetentionFilter, RetentionPolicy,
    };

    fn policy(label: &str) -> StoredPolicy {
        StoredPolicy {
            policy: RetentionPolicy {
                filters: vec![RetentionFilter {
                    label: label.into(),
                    match_rule: MatchRule::default(),
                    policy: PolicyAction {
                        policy_type: PolicyType::Timestamp,
                        rule_group: None,
                        retention_period_secs: 3600,
                        volume: 0,
                    },
                }],
            },
            author: Principal::new("admin").unwrap(),
            applied_at: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    #[test]
    fn quorum_accepts_unanimous_answers() {
        let resolved = resolve_policy_quorum(vec![
            Some(policy("a")),
            Some(policy("a")),
            Some(policy("a")),
        ])
        .unwrap();
        assert_eq!(resolved, Some(policy("a")));
    }

    #[test]
    fn quorum_rejects_any_divergence() {
        let result = resolve_policy_quorum(vec![
            Some(policy("a")),
            Some(policy("a")),
            Some(policy("b")),
        ]);
        assert!(matches!(result, Err(ClientError::PolicyMismatch)));
    }

    #[test]
    fn quorum_rejects_set_vs_unset_divergence() {
        let result = resolve_policy_quorum(vec![Some(policy("a")), None]);
        assert!(matches!(result, Err(ClientError::PolicyMismatch)));
    }

    #[test]
    fn quorum_of_unset_policies_is_unset() {
        assert_eq!(resolve_policy_quorum(vec![None, None]).unwrap(), None);
    }
}
