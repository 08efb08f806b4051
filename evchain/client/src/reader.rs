use async_trait::async_trait;

use evchain_types::{
    EventWithMetadata, IdentityRecord, MissingEvent, Principal, StoredPolicy, TxHash,
};

use crate::client::RoundRobinClient;
use crate::error::ClientError;

/// Read-side chain surface used by the off-chain replica. Abstracted so the
/// reconciliation machinery can run against fakes in tests.
#[async_trait]
pub trait ChainReader: Send + Sync + 'static {
    async fn get_identity(&self, principal: &Principal) -> Result<IdentityRecord, ClientError>;

    async fn get_event_by_tx(&self, tx_hash: &TxHash) -> Result<EventWithMetadata, ClientError>;

    async fn search_events(
        &self,
        lower_height: i64,
        upper_height: i64,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<MissingEvent>, u64), ClientError>;

    async fn get_retention_policy(&self) -> Result<Option<StoredPolicy>, ClientError>;
}

#[async_trait]
impl ChainReader for RoundRobinClient {
    async fn get_identity(&self, principal: &Principal) -> Result<IdentityRecord, ClientError> {
        RoundRobinClient::get_identity(self, principal).await
    }

    async fn get_event_by_tx(&self, tx_hash: &TxHash) -> Result<EventWithMetadata, ClientError> {
        RoundRobinClient::get_event_by_tx(self, tx_hash).await
    }

    async fn search_events(
        &self,
        lower_height: i64,
        upper_height: i64,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<MissingEvent>, u64), ClientError> {
        RoundRobinClient::search_events(self, lower_height, upper_height, page, per_page).await
    }

    async fn get_retention_policy(&self) -> Result<Option<StoredPolicy>, ClientError> {
        RoundRobinClient::get_retention_policy(self).await
    }
}
