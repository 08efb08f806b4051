use std::path::Path;
use std::sync::Arc;

use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options};
use thiserror::Error;

pub(crate) const CF_IDENTITY: &str = "identity";
pub(crate) const CF_EVENTS: &str = "events";
pub(crate) const CF_RETENTION: &str = "retention";
pub(crate) const CF_MUXER: &str = "muxer";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    Backend(#[from] rocksdb::Error),
    #[error("missing column family {0}")]
    MissingColumnFamily(&'static str),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Shared rocksdb handle for the ledger. One column family per sub-app plus
/// one for the multiplexer's own state.
#[derive(Clone)]
pub struct LedgerDb {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl LedgerDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_IDENTITY, Options::default()),
            ColumnFamilyDescriptor::new(CF_EVENTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_RETENTION, Options::default()),
            ColumnFamilyDescriptor::new(CF_MUXER, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        Ok(LedgerDb { db: Arc::new(db) })
    }

    pub(crate) fn cf(
        &self,
        name: &'static str,
    ) -> Result<Arc<BoundColumnFamily<'_>>, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or(StorageError::MissingColumnFamily(name))
    }

    pub(crate) fn get(
        &self,
        cf: &'static str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let handle = self.cf(cf)?;
        Ok(self.db.get_cf(&handle, key)?)
    }

    pub(crate) fn put(
        &self,
        cf: &'static str,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StorageError> {
        let handle = self.cf(cf)?;
        Ok(self.db.put_cf(&handle, key, value)?)
    }
}
