//! Persistent fingerprint store: an embedded, single-writer/multi-reader
//! key/value database with two buckets, `queries` (known-good) and
//! `abnormal` (seen and rejected). One store (a `sled` directory) per
//! `(target_ip, db_type)` pair — see `SPEC_FULL.md` §4.3 and §6.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::event::QueryContext;
use crate::fingerprint::Fingerprint;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bucket {
    Queries,
    Abnormal,
}

impl Bucket {
    fn tree_name(self) -> &'static str {
        match self {
            Bucket::Queries => "queries",
            Bucket::Abnormal => "abnormal",
        }
    }
}

/// Canonicalised `QueryContext` bytes persisted alongside a fingerprint, for
/// `show`/`purge` inspection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreEntry {
    pub query: String,
    pub database: String,
    pub username: String,
    pub client_ip: String,
    pub epoch_seconds: u64,
}

impl From<&QueryContext> for StoreEntry {
    fn from(ctx: &QueryContext) -> Self {
        Self {
            query: crate::fingerprint::canonicalise(&ctx.query),
            database: ctx.database.clone(),
            username: ctx.username.clone(),
            client_ip: ctx.client_ip.to_string(),
            epoch_seconds: ctx.epoch_seconds,
        }
    }
}

pub struct FingerprintStore {
    queries: sled::Tree,
    abnormal: sled::Tree,
}

impl FingerprintStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let queries = db.open_tree(Bucket::Queries.tree_name())?;
        let abnormal = db.open_tree(Bucket::Abnormal.tree_name())?;
        Ok(Self { queries, abnormal })
    }

    fn tree(&self, bucket: Bucket) -> &sled::Tree {
        match bucket {
            Bucket::Queries => &self.queries,
            Bucket::Abnormal => &self.abnormal,
        }
    }

    /// Idempotent insert: the first write for a fingerprint wins, later ones
    /// are a no-op. Returns whether this call was the one that inserted.
    pub fn put(&self, bucket: Bucket, fp: &Fingerprint, entry: &StoreEntry) -> Result<bool, StoreError> {
        let tree = self.tree(bucket);
        let value = serde_json::to_vec(entry)?;
        // compare_and_swap(expect-absent) so concurrent puts for the same
        // fingerprint from different sessions still only let the first one
        // through — plain contains_key-then-insert would race.
        let inserted = tree.compare_and_swap(fp, None as Option<&[u8]>, Some(value))?.is_ok();
        tree.flush()?;
        Ok(inserted)
    }

    pub fn exists(&self, bucket: Bucket, fp: &Fingerprint) -> Result<bool, StoreError> {
        Ok(self.tree(bucket).contains_key(fp)?)
    }

    /// Restartable, finite iteration over one bucket. Snapshot isolation is
    /// provided by `sled`'s own MVCC-style tree iterator.
    pub fn iter(&self, bucket: Bucket) -> impl Iterator<Item = Result<(Fingerprint, StoreEntry), StoreError>> {
        self.tree(bucket).iter().map(|res| {
            let (key, value) = res?;
            let mut fp = [0u8; 20];
            fp.copy_from_slice(&key);
            let entry: StoreEntry = serde_json::from_slice(&value)?;
            Ok((fp, entry))
        })
    }
}

/// Path of the store directory for a `(target_ip, db_type)` pair, per §6:
/// `<db_dir>/<target_ip>_<db_type>.db`.
pub fn store_path(db_dir: &Path, target_ip: &str, db_type: &str) -> std::path::PathBuf {
    db_dir.join(format!("{target_ip}_{db_type}.db"))
}
