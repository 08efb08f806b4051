//! Chain access for off-chain replicas.
//!
//! Wraps the consensus nodes' JSON-RPC surface behind a liveness-tested
//! round-robin pool, adds quorum comparison for the retention policy, and
//! follows the chain over websockets to surface new block heights and
//! freshly admitted event ids.

pub mod client;
pub mod error;
pub mod follower;
pub mod pool;
pub mod reader;
pub mod rpc;

pub use client::RoundRobinClient;
pub use error::ClientError;
pub use follower::{spawn_follower, FollowerConfig, FollowerStreams};
pub use pool::{Pool, PoolConfig, PoolError, PoolMember};
pub use reader::ChainReader;
pub use rpc::{AbciInfo, AbciQueryResponse, RpcClient, TxResponse, TxResultBody, TxSearchResponse};
