//! The transactional key-value store Joshua is built on (C1, data-model
//! substrate for C2–C4 and C7).
//!
//! A real deployment would sit this crate on a serializable,
//! multi-key-transactional store with watches, versionstamps, atomic add,
//! snapshot reads, and a directory namespace allocator — that store is an
//! external collaborator, not something this crate owns. This module
//! provides a thin, FoundationDB-shaped transaction API on top of a single
//! `sled::Tree` so the rest of the crate has something that compiles and
//! behaves that way: tuple-packed keys in one flat keyspace, point
//! reads/writes inside a retrying transaction, counters via
//! read-modify-write atomic add, a monotonic versionstamp counter, and
//! watches emulated with per-key `tokio::sync::Notify` handles bumped
//! after a transaction commits.
//!
//! sled's transactions only support point operations (`get`/`insert`/
//! `remove`), not range scans, inside the closure. Operations that need to
//! touch a whole subspace (stop()'s incomplete-range delete, delete()'s
//! multi-subspace purge, should_run()'s heartbeat walk) first take a
//! non-transactional snapshot scan to enumerate the keys involved, then
//! fold point operations on exactly those keys into one transaction. The
//! key set can go stale between the scan and the commit under concurrent
//! writers; every caller of `scan_prefix` in this crate is already
//! written to tolerate that, the same bounded-overshoot tolerance
//! `fail_fast`/`max_runs` already accept elsewhere.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::IVec;
use tokio::sync::Notify;

use crate::error::JoshuaError;
use crate::store::directory::{Directory, Subspace};

const VERSIONSTAMP_COUNTER_KEY: &[u8] = b"~meta/versionstamp_counter";

/// A handle to the store, cheaply cloneable, shared by every component.
#[derive(Clone)]
pub struct Store {
    tree: sled::Tree,
    dir: Arc<Directory>,
    versionstamp: Arc<AtomicU64>,
    watches: Arc<DashMap<Vec<u8>, Arc<Notify>>>,
}

impl Store {
    /// Open (creating if absent) a store persisted at `path`, rooted under
    /// `root` (default `["joshua"]` per §4.1).
    pub fn open(path: impl AsRef<Path>, root: &[&str]) -> Result<Self, JoshuaError> {
        let db = sled::open(path).map_err(|e| JoshuaError::Store(e.to_string()))?;
        Self::from_db(db, root)
    }

    /// An ephemeral, temporary-directory-backed store — used by tests and
    /// by standalone agent runs that don't need cross-restart durability
    /// of their own coordination state (the ensembles they operate on
    /// still live in whatever store the caller pointed them at).
    pub fn temporary(root: &[&str]) -> Result<Self, JoshuaError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| JoshuaError::Store(e.to_string()))?;
        Self::from_db(db, root)
    }

    fn from_db(db: sled::Db, root: &[&str]) -> Result<Self, JoshuaError> {
        let tree = db
            .open_tree("joshua")
            .map_err(|e| JoshuaError::Store(e.to_string()))?;
        let initial = tree
            .get(VERSIONSTAMP_COUNTER_KEY)
            .map_err(|e| JoshuaError::Store(e.to_string()))?
            .map(|v| decode_u64(&v))
            .unwrap_or(0);
        Ok(Store {
            tree,
            dir: Arc::new(Directory::new(root.iter().map(|s| s.to_string()).collect())),
            versionstamp: Arc::new(AtomicU64::new(initial)),
            watches: Arc::new(DashMap::new()),
        })
    }

    pub fn directory(&self, path: &[&str]) -> Subspace {
        self.dir.create_or_open(path)
    }

    /// Run `f` inside a transaction, retrying on store-level conflicts.
    /// `f` returns `Ok` to commit or `Err(JoshuaError)` to abort (no
    /// writes are applied on abort).
    pub fn transact<T, F>(&self, f: F) -> Result<T, JoshuaError>
    where
        F: Fn(&Txn) -> ConflictableTransactionResult<T, JoshuaError>,
    {
        self.tree
            .transaction(|tt| f(&Txn { tt }))
            .map_err(|e| match e {
                TransactionError::Abort(inner) => inner,
                TransactionError::Storage(se) => JoshuaError::Store(se.to_string()),
            })
    }

    /// A read performed outside any transaction: it never participates in
    /// a read-conflict set. Used at the "snapshot read" points (§4.3
    /// `should_run`, §4.4 steps 5/7) where two concurrent readers must
    /// never conflict with each other.
    pub fn snapshot_get(&self, key: &[u8]) -> Result<Option<IVec>, JoshuaError> {
        self.tree
            .get(key)
            .map_err(|e| JoshuaError::Store(e.to_string()))
    }

    /// Enumerate every key/value in `subspace` as of the current snapshot.
    /// Not transactional — see the module-level note on range scans.
    pub fn scan_prefix(&self, subspace: &Subspace) -> Result<Vec<(Vec<u8>, IVec)>, JoshuaError> {
        let (start, end) = subspace.range();
        self.tree
            .range(start..end)
            .map(|r| r.map(|(k, v)| (k.to_vec(), v)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| JoshuaError::Store(e.to_string()))
    }

    /// Like `scan_prefix` but bounded to keys >= `from` within the
    /// subspace — used by `list_all`'s cross-transaction pagination.
    pub fn scan_from(
        &self,
        subspace: &Subspace,
        from: Vec<u8>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, IVec)>, JoshuaError> {
        let (_, end) = subspace.range();
        self.tree
            .range(from..end)
            .take(limit)
            .map(|r| r.map(|(k, v)| (k.to_vec(), v)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| JoshuaError::Store(e.to_string()))
    }

    /// Mint a fresh, process-wide-monotonic 10-byte versionstamp, recorded
    /// durably as part of the given transaction so it survives a restart
    /// without ever being reused.
    pub fn mint_versionstamp(&self, txn: &Txn) -> ConflictableTransactionResult<[u8; 10], JoshuaError> {
        let next = self.versionstamp.fetch_add(1, Ordering::SeqCst) + 1;
        txn.tt.insert(VERSIONSTAMP_COUNTER_KEY, &encode_u64(next)[..])?;
        let mut out = [0u8; 10];
        out[..8].copy_from_slice(&next.to_be_bytes());
        Ok(out)
    }

    /// Register interest in the next write to `key`, returning a future
    /// that resolves once it happens. Call `notify_change` after any
    /// transaction that touched a change-counter key.
    pub fn watch(&self, key: &[u8]) -> impl std::future::Future<Output = ()> {
        let notify = self
            .watches
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        async move { notify.notified().await }
    }

    /// Wake every watcher registered on `key`. A no-op if nobody is
    /// watching.
    pub fn notify_change(&self, key: &[u8]) {
        if let Some(n) = self.watches.get(key) {
            n.notify_waiters();
        }
    }
}

/// A running transaction — a thin wrapper over sled's point-operation API
/// plus the counter/versionstamp conveniences this crate needs.
pub struct Txn<'a> {
    tt: &'a TransactionalTree,
}

impl Txn<'_> {
    pub fn get(&self, key: &[u8]) -> ConflictableTransactionResult<Option<IVec>, JoshuaError> {
        Ok(self.tt.get(key)?)
    }

    pub fn exists(&self, key: &[u8]) -> ConflictableTransactionResult<bool, JoshuaError> {
        Ok(self.tt.get(key)?.is_some())
    }

    pub fn set(&self, key: &[u8], value: impl AsRef<[u8]>) -> ConflictableTransactionResult<(), JoshuaError> {
        self.tt.insert(key, value.as_ref())?;
        Ok(())
    }

    pub fn remove(&self, key: &[u8]) -> ConflictableTransactionResult<(), JoshuaError> {
        self.tt.remove(key)?;
        Ok(())
    }

    /// Read current u64 counter (0 if absent), add `delta` (clamped at
    /// zero — counters are never negative), write back, return the new
    /// value.
    pub fn atomic_add(&self, key: &[u8], delta: i64) -> ConflictableTransactionResult<u64, JoshuaError> {
        let current = self.tt.get(key)?.map(|v| decode_u64(&v)).unwrap_or(0);
        let next = (current as i64 + delta).max(0) as u64;
        self.tt.insert(key, &encode_u64(next)[..])?;
        Ok(next)
    }

    /// Abort the enclosing transaction with a business-logic error — no
    /// writes made so far in this attempt are applied.
    pub fn abort(e: JoshuaError) -> ConflictableTransactionError<JoshuaError> {
        ConflictableTransactionError::Abort(e)
    }
}

pub fn encode_u64(v: u64) -> [u8; 8] {
    v.to_le_bytes()
}

pub fn decode_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    let n = bytes.len().min(8);
    arr[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tuple::Tuple;

    #[test]
    fn atomic_add_accumulates_across_transactions() {
        let store = Store::temporary(&["joshua-test"]).unwrap();
        let sub = store.directory(&["counters"]);
        let key = sub.pack(&Tuple::new().push("started"));

        for _ in 0..5 {
            store
                .transact(|txn| txn.atomic_add(&key, 1))
                .unwrap();
        }

        let value = store.snapshot_get(&key).unwrap().unwrap();
        assert_eq!(decode_u64(&value), 5);
    }

    #[test]
    fn versionstamps_are_monotonic_and_unique() {
        let store = Store::temporary(&["joshua-test"]).unwrap();
        let mut stamps = Vec::new();
        for _ in 0..10 {
            let vs = store.transact(|txn| store.mint_versionstamp(txn)).unwrap();
            stamps.push(vs);
        }
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted, "versionstamps must be issued in increasing order");
        let unique: std::collections::HashSet<_> = stamps.iter().collect();
        assert_eq!(unique.len(), stamps.len());
    }

    #[test]
    fn abort_leaves_no_trace() {
        let store = Store::temporary(&["joshua-test"]).unwrap();
        let sub = store.directory(&["x"]);
        let key = sub.pack(&Tuple::new().push("y"));

        let result: Result<(), JoshuaError> = store.transact(|txn| {
            txn.set(&key, b"should not stick")?;
            Err(Txn::abort(JoshuaError::ClaimLost))
        });
        assert!(result.is_err());
        assert!(store.snapshot_get(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_resolves_after_notify() {
        let store = Store::temporary(&["joshua-test"]).unwrap();
        let key = b"some/change/counter".to_vec();
        let fut = store.watch(&key);
        store.notify_change(&key);
        tokio::time::timeout(std::time::Duration::from_millis(100), fut)
            .await
            .expect("watch should resolve promptly after notify_change");
    }
}
