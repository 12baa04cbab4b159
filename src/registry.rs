//! Ensemble registry and lifecycle (C2, §4.2).
//!
//! Owns the `/ensembles/all`, `/ensembles/active`, `/ensembles/sanity` and
//! `/ensembles/data` subspaces. Every public method here is one
//! transaction unless its doc comment says otherwise — `list_all`'s
//! cross-transaction pagination is the one deliberate exception (§4.2,
//! §7 "transaction-too-old during long scans").

use sha2::{Digest, Sha256};

use crate::error::{JoshuaError, JoshuaResult};
use crate::model::{derive_remaining, derive_runtime, Counters, EnsembleProperties, EnsembleSummary, now_unix};
use crate::store::{read_blob, write_blob, Store, Subspace, Tuple};

/// Handle onto the ensemble subspaces; cheaply cloneable (wraps `Store`).
#[derive(Clone)]
pub struct Registry {
    store: Store,
    all: Subspace,
    active: Subspace,
    sanity: Subspace,
    data: Subspace,
    incomplete: Subspace,
}

impl Registry {
    pub fn new(store: Store) -> Self {
        let ensembles = store.directory(&["ensembles"]);
        Registry {
            all: ensembles.child("all"),
            active: ensembles.child("active"),
            sanity: ensembles.child("sanity"),
            data: ensembles.child("data"),
            incomplete: ensembles.child("incomplete"),
            store,
        }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn all_subspace(&self) -> &Subspace {
        &self.all
    }

    pub(crate) fn index_subspace(&self, is_sanity: bool) -> &Subspace {
        if is_sanity {
            &self.sanity
        } else {
            &self.active
        }
    }

    pub(crate) fn incomplete_subspace(&self) -> &Subspace {
        &self.incomplete
    }

    fn properties_subspace(&self, eid: &str) -> Subspace {
        self.all.child(eid).child("properties")
    }

    fn count_subspace(&self, eid: &str) -> Subspace {
        self.all.child(eid).child("count")
    }

    /// Compute the EID for a tarball a caller is about to submit, without
    /// writing anything — lets `create`'s caller log or branch on it.
    pub fn compute_eid(username: &str, tarball: &[u8]) -> String {
        let hash = Sha256::digest(tarball);
        let hash16 = hex::encode(&hash[..8]);
        let now = chrono::Utc::now();
        format!("{}-{}-{}", now.format("%Y%m%d-%H%M%S"), username, hash16)
    }

    /// §4.2 `create`. Idempotent: resubmitting the same tarball by the
    /// same user within the same second returns the existing EID.
    pub fn create(
        &self,
        username: &str,
        mut properties: EnsembleProperties,
        tarball: &[u8],
        is_sanity: bool,
    ) -> JoshuaResult<String> {
        let eid = Self::compute_eid(username, tarball);

        write_blob(&self.store, &self.data.child(&eid), tarball)?;

        let sentinel = self.all.child(&eid).key();
        let already_exists = self.store.snapshot_get(&sentinel)?.is_some();
        if already_exists {
            return Ok(eid);
        }

        properties.username = username.to_string();
        let props_sub = self.properties_subspace(&eid);
        let index = self.index_subspace(is_sanity).clone();
        let props = properties.clone();

        self.store.transact(|txn| {
            if txn.exists(&sentinel)? {
                return Ok(());
            }
            txn.set(&sentinel, b"")?;
            write_properties(txn, &props_sub, &props)?;
            txn.set(&index.pack(&Tuple::new().push(eid.clone())), b"")?;
            txn.atomic_add(&index.child(CHANGE_COUNTER_NAME).key(), 1)?;
            Ok(())
        })?;
        self.store.notify_change(&index.child(CHANGE_COUNTER_NAME).key());

        Ok(eid)
    }

    /// §4.2 `stop`.
    pub fn stop(&self, eid: &str, is_sanity: bool) -> JoshuaResult<()> {
        let sentinel = self.all.child(eid).key();
        if self.store.snapshot_get(&sentinel)?.is_none() {
            return Err(JoshuaError::EnsembleNotFound(eid.to_string()));
        }

        let index = self.index_subspace(is_sanity).clone();
        let props_sub = self.properties_subspace(eid);
        let incomplete_sub = self.incomplete.child(eid);
        let incomplete_keys: Vec<Vec<u8>> = self
            .store
            .scan_prefix(&incomplete_sub)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();

        let stopped = self.store.transact(|txn| {
            let index_key = index.pack(&Tuple::new().push(eid.to_string()));
            if !txn.exists(&index_key)? {
                return Ok(false);
            }
            let submitted = txn
                .get(&props_sub.pack(&Tuple::new().push("submitted")))?
                .map(|v| decode_i64(&v))
                .unwrap_or_else(now_unix);
            let stoptime = now_unix();
            txn.set(
                &props_sub.pack(&Tuple::new().push("stopped")),
                encode_i64(stoptime),
            )?;
            txn.set(
                &props_sub.pack(&Tuple::new().push("runtime")),
                encode_i64(stoptime - submitted),
            )?;
            txn.remove(&index_key)?;
            for key in &incomplete_keys {
                txn.remove(key)?;
            }
            txn.atomic_add(&index.child(CHANGE_COUNTER_NAME).key(), 1)?;
            Ok(true)
        })?;

        if stopped {
            self.store.notify_change(&index.child(CHANGE_COUNTER_NAME).key());
        }
        Ok(())
    }

    /// §4.2 `resume`. Returns `true` iff the ensemble transitioned from
    /// stopped to active/sanity.
    pub fn resume(&self, eid: &str, is_sanity: bool) -> JoshuaResult<bool> {
        let index = self.index_subspace(is_sanity).clone();
        let index_key = index.pack(&Tuple::new().push(eid.to_string()));
        let transitioned = self.store.transact(|txn| {
            if txn.exists(&index_key)? {
                return Ok(false);
            }
            txn.set(&index_key, b"")?;
            txn.atomic_add(&index.child(CHANGE_COUNTER_NAME).key(), 1)?;
            Ok(true)
        })?;
        if transitioned {
            self.store.notify_change(&index.child(CHANGE_COUNTER_NAME).key());
        }
        Ok(transitioned)
    }

    /// §4.2 `delete`. Purges every subspace this ensemble ever touched.
    pub fn delete(&self, eid: &str) -> JoshuaResult<()> {
        for kind in ["pass", "fail", "large"] {
            crate::store::delete_blob(&self.store, &self.results_subspace(kind, eid))?;
        }
        crate::store::delete_blob(&self.store, &self.data.child(eid))?;
        crate::store::delete_blob(&self.store, &self.incomplete.child(eid))?;
        crate::store::delete_blob(&self.store, &self.all.child(eid))?;

        for (is_sanity, name) in [(false, "active"), (true, "sanity")] {
            let index = self.index_subspace(is_sanity).clone();
            let index_key = index.pack(&Tuple::new().push(eid.to_string()));
            let removed = self.store.transact(|txn| {
                if txn.exists(&index_key)? {
                    txn.remove(&index_key)?;
                    txn.atomic_add(&index.child(CHANGE_COUNTER_NAME).key(), 1)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })?;
            if removed {
                tracing::debug!(eid, index = name, "removed deleted ensemble from index");
                self.store.notify_change(&index.child(CHANGE_COUNTER_NAME).key());
            }
        }
        Ok(())
    }

    /// §4.2 `list_active`.
    pub fn list_active(&self) -> JoshuaResult<Vec<EnsembleSummary>> {
        self.list_index(false)
    }

    /// §4.2 `list_sanity`.
    pub fn list_sanity(&self) -> JoshuaResult<Vec<EnsembleSummary>> {
        self.list_index(true)
    }

    fn list_index(&self, is_sanity: bool) -> JoshuaResult<Vec<EnsembleSummary>> {
        let index = self.index_subspace(is_sanity).clone();
        let entries = self.store.scan_prefix(&index)?;
        let mut out = Vec::new();
        for (key, _) in entries {
            let Some(rest) = index.unpack(&key) else { continue };
            if rest.is_empty() {
                continue; // the change-counter key itself
            }
            let Ok(tuple) = Tuple::unpack(rest) else { continue };
            let Some(crate::store::Element::Str(eid)) = tuple.0.into_iter().next() else {
                continue;
            };
            if let Some(summary) = self.read_summary(&eid)? {
                out.push(summary);
            }
        }
        Ok(out)
    }

    /// §4.2 `list_all` — paginated range scan across `/all`, reopening a
    /// fresh transaction (here: a fresh snapshot) every `page_size` keys
    /// to model "transaction_too_old, retry from last key" (§7).
    pub fn list_all(&self, page_size: usize) -> JoshuaResult<Vec<String>> {
        let mut out = Vec::new();
        let mut cursor = self.all.key();
        loop {
            let page = self.store.scan_from(&self.all, cursor.clone(), page_size)?;
            if page.is_empty() {
                break;
            }
            let mut advanced = false;
            for (key, _) in &page {
                if let Some(rest) = self.all.unpack(key) {
                    if let Ok(tuple) = Tuple::unpack(rest) {
                        if tuple.0.len() == 1 {
                            if let crate::store::Element::Str(eid) = &tuple.0[0] {
                                out.push(eid.clone());
                            }
                        }
                    }
                }
                cursor = next_key_after(key);
                advanced = true;
            }
            if !advanced || page.len() < page_size {
                break;
            }
        }
        Ok(out)
    }

    /// Read back a single ensemble's properties, counters, and derived
    /// fields (§4.2 "properties derivation").
    pub fn read_summary(&self, eid: &str) -> JoshuaResult<Option<EnsembleSummary>> {
        if self.store.snapshot_get(&self.all.child(eid).key())?.is_none() {
            return Ok(None);
        }
        let properties = self.read_properties(eid)?;
        let counters = self.read_counters(eid)?;
        let runtime = derive_runtime(&properties);
        let remaining = derive_remaining(&properties, &counters, runtime);
        Ok(Some(EnsembleSummary {
            eid: eid.to_string(),
            properties,
            counters,
            runtime,
            remaining,
        }))
    }

    fn read_properties(&self, eid: &str) -> JoshuaResult<EnsembleProperties> {
        let sub = self.properties_subspace(eid);
        let entries = self.store.scan_prefix(&sub)?;
        let mut props = EnsembleProperties::new("");
        for (key, value) in entries {
            let Some(rest) = sub.unpack(&key) else { continue };
            let Ok(tuple) = Tuple::unpack(rest) else { continue };
            let Some(crate::store::Element::Str(name)) = tuple.0.into_iter().next() else {
                continue;
            };
            apply_property(&mut props, &name, &value);
        }
        Ok(props)
    }

    fn read_counters(&self, eid: &str) -> JoshuaResult<Counters> {
        let sub = self.count_subspace(eid);
        let entries = self.store.scan_prefix(&sub)?;
        let mut counters = Counters::default();
        for (key, value) in entries {
            let Some(rest) = sub.unpack(&key) else { continue };
            let Ok(tuple) = Tuple::unpack(rest) else { continue };
            let Some(crate::store::Element::Str(name)) = tuple.0.into_iter().next() else {
                continue;
            };
            let v = crate::store::kv::decode_u64(&value);
            match name.as_str() {
                "started" => counters.started = v,
                "ended" => counters.ended = v,
                "pass" => counters.pass = v,
                "fail" => counters.fail = v,
                "duration" => counters.duration = v,
                _ => {}
            }
        }
        Ok(counters)
    }

    /// §4.2 `watch_active` / `watch_sanity`: returns the current list plus
    /// a future resolving on the next change-counter bump.
    pub fn watch(&self, is_sanity: bool) -> JoshuaResult<(Vec<EnsembleSummary>, impl std::future::Future<Output = ()> + '_)> {
        let list = self.list_index(is_sanity)?;
        let index = self.index_subspace(is_sanity);
        let fut = self.store.watch(&index.child(CHANGE_COUNTER_NAME).key());
        Ok((list, fut))
    }

    pub fn read_tarball(&self, eid: &str) -> JoshuaResult<Vec<u8>> {
        read_blob(&self.store, &self.data.child(eid))
    }

    /// The change-counter key callers watch directly (§4.2 `watch_active`
    /// / `watch_sanity`) when they only need the wake-up, not the
    /// refreshed list `watch()` also returns.
    pub(crate) fn change_counter_key(&self, is_sanity: bool) -> Vec<u8> {
        self.index_subspace(is_sanity).child(CHANGE_COUNTER_NAME).key()
    }
}

const CHANGE_COUNTER_NAME: &str = "~change";

fn write_properties(txn: &crate::store::Txn, sub: &Subspace, props: &EnsembleProperties) -> sled::transaction::ConflictableTransactionResult<(), JoshuaError> {
    let set_str = |txn: &crate::store::Txn, name: &str, v: &str| txn.set(&sub.pack(&Tuple::new().push(name)), v.as_bytes());
    set_str(txn, "username", &props.username)?;
    txn.set(&sub.pack(&Tuple::new().push("submitted")), encode_i64(props.submitted))?;
    set_str(txn, "compressed", if props.compressed { "1" } else { "0" })?;
    txn.set(&sub.pack(&Tuple::new().push("priority")), encode_i64(props.priority))?;
    if let Some(t) = props.timeout {
        txn.set(&sub.pack(&Tuple::new().push("timeout")), encode_i64(t as i64))?;
    }
    txn.set(&sub.pack(&Tuple::new().push("fail_fast")), encode_i64(props.fail_fast as i64))?;
    txn.set(&sub.pack(&Tuple::new().push("max_runs")), encode_i64(props.max_runs as i64))?;
    set_str(txn, "test_command", &props.test_command)?;
    set_str(txn, "timeout_command", &props.timeout_command)?;
    if let Some(e) = &props.env {
        set_str(txn, "env", e)?;
    }
    for (k, v) in &props.extra {
        set_str(txn, &format!("extra.{k}"), v)?;
    }
    Ok(())
}

fn apply_property(props: &mut EnsembleProperties, name: &str, value: &[u8]) {
    let as_str = || String::from_utf8_lossy(value).to_string();
    let as_i64 = || decode_i64(value);
    match name {
        "username" => props.username = as_str(),
        "submitted" => props.submitted = as_i64(),
        "compressed" => props.compressed = value == b"1",
        "priority" => props.priority = as_i64(),
        "timeout" => props.timeout = Some(as_i64() as u64),
        "fail_fast" => props.fail_fast = as_i64() as u64,
        "max_runs" => props.max_runs = as_i64() as u64,
        "test_command" => props.test_command = as_str(),
        "timeout_command" => props.timeout_command = as_str(),
        "env" => props.env = Some(as_str()),
        "stopped" => props.stopped = Some(as_i64()),
        "runtime" => props.runtime = Some(as_i64()),
        other => {
            if let Some(key) = other.strip_prefix("extra.") {
                props.extra.insert(key.to_string(), as_str());
            }
        }
    }
}

fn encode_i64(v: i64) -> [u8; 8] {
    v.to_le_bytes()
}

fn decode_i64(bytes: &[u8]) -> i64 {
    let mut arr = [0u8; 8];
    let n = bytes.len().min(8);
    arr[..n].copy_from_slice(&bytes[..n]);
    i64::from_le_bytes(arr)
}

/// Smallest key strictly greater than `key`, for pagination cursors.
fn next_key_after(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn registry() -> Registry {
        Registry::new(Store::temporary(&["joshua-registry-test"]).unwrap())
    }

    #[test]
    fn create_then_read_summary_round_trips_properties() {
        let reg = registry();
        let mut props = EnsembleProperties::new("alice");
        props.max_runs = 10;
        props.priority = 50;
        let eid = reg.create("alice", props, b"tarball bytes", false).unwrap();

        let summary = reg.read_summary(&eid).unwrap().unwrap();
        assert_eq!(summary.properties.username, "alice");
        assert_eq!(summary.properties.max_runs, 10);
        assert_eq!(summary.properties.priority, 50);
        assert_eq!(summary.counters, Counters::default());
    }

    #[test]
    fn create_is_idempotent_for_same_user_and_tarball() {
        let reg = registry();
        let props = EnsembleProperties::new("alice");
        let eid1 = reg.create("alice", props.clone(), b"same bytes", false).unwrap();
        let eid2 = reg.create("alice", props, b"same bytes", false).unwrap();
        assert_eq!(eid1, eid2);
        assert_eq!(reg.list_active().unwrap().len(), 1);
    }

    #[test]
    fn create_inserts_into_active_or_sanity_index() {
        let reg = registry();
        let eid_active = reg.create("alice", EnsembleProperties::new("alice"), b"a", false).unwrap();
        let eid_sanity = reg.create("bob", EnsembleProperties::new("bob"), b"b", true).unwrap();

        assert_eq!(reg.list_active().unwrap().iter().map(|s| &s.eid).collect::<Vec<_>>(), vec![&eid_active]);
        assert_eq!(reg.list_sanity().unwrap().iter().map(|s| &s.eid).collect::<Vec<_>>(), vec![&eid_sanity]);
    }

    #[test]
    fn stop_removes_from_index_and_sets_stopped_and_runtime() {
        let reg = registry();
        let eid = reg.create("alice", EnsembleProperties::new("alice"), b"a", false).unwrap();
        reg.stop(&eid, false).unwrap();

        assert!(reg.list_active().unwrap().is_empty());
        let summary = reg.read_summary(&eid).unwrap().unwrap();
        assert!(summary.properties.stopped.is_some());
        assert!(summary.properties.runtime.is_some());
    }

    #[test]
    fn stop_on_unknown_ensemble_is_an_error() {
        let reg = registry();
        let err = reg.stop("no-such-eid", false).unwrap_err();
        assert!(matches!(err, JoshuaError::EnsembleNotFound(_)));
    }

    #[test]
    fn resume_reinserts_into_index_and_reports_transition() {
        let reg = registry();
        let eid = reg.create("alice", EnsembleProperties::new("alice"), b"a", false).unwrap();
        reg.stop(&eid, false).unwrap();

        assert!(reg.resume(&eid, false).unwrap());
        assert!(!reg.resume(&eid, false).unwrap(), "second resume is a no-op");
        assert_eq!(reg.list_active().unwrap().len(), 1);
    }

    #[test]
    fn delete_purges_every_subspace() {
        let reg = registry();
        let eid = reg.create("alice", EnsembleProperties::new("alice"), b"tarball", false).unwrap();
        reg.delete(&eid).unwrap();

        assert!(reg.read_summary(&eid).unwrap().is_none());
        assert!(reg.read_tarball(&eid).unwrap().is_empty());
        assert!(reg.list_active().unwrap().is_empty());
    }

    #[test]
    fn tarball_round_trips_byte_identical() {
        let reg = registry();
        let tarball: Vec<u8> = (0..100_000u32).map(|i| (i % 250) as u8).collect();
        let eid = reg.create("alice", EnsembleProperties::new("alice"), &tarball, false).unwrap();
        assert_eq!(reg.read_tarball(&eid).unwrap(), tarball);
    }

    #[test]
    fn list_all_paginates_across_many_entries() {
        let reg = registry();
        let mut eids = Vec::new();
        for i in 0..25 {
            let eid = reg
                .create(&format!("user{i}"), EnsembleProperties::new(format!("user{i}")), format!("t{i}").as_bytes(), false)
                .unwrap();
            eids.push(eid);
        }
        let mut listed = reg.list_all(4).unwrap();
        listed.sort();
        eids.sort();
        assert_eq!(listed, eids);
    }
}
