use thiserror::Error;

use evchain_types::proof::ProofError;

use crate::pool::PoolError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("tx not found")]
    EventNotFound,
    #[error("principal not found")]
    PrincipalNotFound,
    #[error("not enough nodes to satisfy minimum nodes requirement, expected: {required}, actual: {available}")]
    NotEnoughNodes { required: usize, available: usize },
    #[error("policies returned by chain nodes do not match")]
    PolicyMismatch,
    #[error("ABCI query failed, code: {codespace}:{code}, log: {log}")]
    QueryFailed {
        codespace: String,
        code: u32,
        log: String,
    },
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("rpc response carried no result")]
    EmptyResponse,
    #[error("invalid node url: {0}")]
    InvalidUrl(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Proof(#[from] ProofError),
}
