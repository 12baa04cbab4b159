//! Run claim & heartbeat protocol (C3, §4.3).
//!
//! `/ensembles/incomplete/<EID>/<seed>` and its siblings (`began_at`,
//! `hostname`, `/heartbeat/<seed>`) are the only state this module
//! touches. Every instance of this process shares one `InstanceId`
//! (8 random bytes, §4.3), stamped into a claim so a heartbeat or steal
//! can tell "mine" from "someone else's" without a second round trip.

use rand::RngCore;

use crate::error::JoshuaResult;
use crate::registry::Registry;
use crate::store::{Element, Tuple};

pub const STALE_HEARTBEAT_SECS: i64 = 10;

/// 8 random bytes identifying this agent process (§4.3, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceId(pub [u8; 8]);

impl InstanceId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        InstanceId(bytes)
    }
}

/// One entry from `show_in_progress` (§4.3).
#[derive(Debug, Clone)]
pub struct InProgressRun {
    pub seed: u64,
    pub began_at: i64,
    pub hostname: String,
    pub heartbeat: i64,
    pub running_for: i64,
}

pub struct ClaimProtocol {
    registry: Registry,
    instance_id: InstanceId,
}

impl ClaimProtocol {
    pub fn new(registry: Registry, instance_id: InstanceId) -> Self {
        ClaimProtocol { registry, instance_id }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn incomplete_eid(&self, eid: &str) -> crate::store::Subspace {
        self.registry.incomplete_subspace().child(eid)
    }

    /// §4.3 `try_start`.
    pub fn try_start(&self, eid: &str, seed: u64, is_sanity: bool, hostname: &str) -> JoshuaResult<bool> {
        let index_key = self
            .registry
            .index_subspace(is_sanity)
            .pack(&Tuple::new().push(eid.to_string()));
        let incomplete = self.incomplete_eid(eid);
        let seed_key = incomplete.pack(&Tuple::new().push(Element::Int(seed as i64)));
        let began_key = incomplete.child_tuple(&Tuple::new().push(Element::Int(seed as i64))).child("began_at").key();
        let hostname_key = incomplete.child_tuple(&Tuple::new().push(Element::Int(seed as i64))).child("hostname").key();
        let heartbeat_key = incomplete
            .child("heartbeat")
            .pack(&Tuple::new().push(Element::Int(seed as i64)));
        let started_counter = self.registry.all_subspace().child(eid).child("count").pack(&Tuple::new().push("started"));
        let mine = self.instance_id.0;
        let hostname = hostname.to_string();

        self.registry.store().transact(|txn| {
            if !txn.exists(&index_key)? {
                return Ok(false);
            }
            if let Some(existing) = txn.get(&seed_key)? {
                return Ok(existing.as_ref() == mine);
            }
            txn.atomic_add(&started_counter, 1)?;
            txn.set(&seed_key, mine)?;
            txn.set(&began_key, crate::model::now_unix().to_le_bytes())?;
            txn.set(&hostname_key, hostname.as_bytes())?;
            txn.set(&heartbeat_key, crate::model::now_unix().to_le_bytes())?;
            Ok(true)
        })
    }

    /// §4.3 `heartbeat_and_check`.
    pub fn heartbeat_and_check(&self, eid: &str, seed: u64, is_sanity: bool) -> JoshuaResult<bool> {
        let index_key = self
            .registry
            .index_subspace(is_sanity)
            .pack(&Tuple::new().push(eid.to_string()));
        let incomplete = self.incomplete_eid(eid);
        let seed_key = incomplete.pack(&Tuple::new().push(Element::Int(seed as i64)));
        let heartbeat_key = incomplete
            .child("heartbeat")
            .pack(&Tuple::new().push(Element::Int(seed as i64)));
        let mine = self.instance_id.0;

        self.registry.store().transact(|txn| {
            if !txn.exists(&index_key)? {
                return Ok(false);
            }
            match txn.get(&seed_key)? {
                Some(owner) if owner.as_ref() == mine => {
                    txn.set(&heartbeat_key, crate::model::now_unix().to_le_bytes())?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    /// §4.3 `should_run`. Snapshot reads for `started`/`max_runs`; only
    /// the actual steal (deleting a dead claimant) takes a transaction,
    /// and that transaction's read of the stale heartbeat key creates the
    /// read-conflict this protocol relies on for exclusivity.
    pub fn should_run(&self, eid: &str) -> JoshuaResult<bool> {
        let store = self.registry.store();
        let count_sub = self.registry.all_subspace().child(eid).child("count");
        let started = store
            .snapshot_get(&count_sub.pack(&Tuple::new().push("started")))?
            .map(|v| crate::store::kv::decode_u64(&v))
            .unwrap_or(0);
        let max_runs = self.read_max_runs(eid)?;
        if max_runs == 0 || started < max_runs {
            return Ok(true);
        }

        let incomplete = self.incomplete_eid(eid);
        let heartbeat_sub = incomplete.child("heartbeat");
        let entries = store.scan_prefix(&heartbeat_sub)?;
        if entries.is_empty() {
            return Ok(true);
        }

        let now = crate::model::now_unix();
        let mut oldest: Option<(Vec<u8>, u64, i64)> = None;
        for (key, value) in &entries {
            let Some(rest) = heartbeat_sub.unpack(key) else { continue };
            let Ok(tuple) = Tuple::unpack(rest) else { continue };
            let Some(Element::Int(seed)) = tuple.0.into_iter().next() else { continue };
            let ts = crate::model::decode_i64(value);
            let age = now - ts;
            if oldest.as_ref().map(|(_, _, a)| age > *a).unwrap_or(true) {
                oldest = Some((key.clone(), seed as u64, age));
            }
        }
        let Some((heartbeat_key, dead_seed, age)) = oldest else {
            return Ok(true);
        };
        if age <= STALE_HEARTBEAT_SECS {
            return Ok(false);
        }

        let seed_key = incomplete.pack(&Tuple::new().push(Element::Int(dead_seed as i64)));
        let dead_sub = incomplete.child_tuple(&Tuple::new().push(Element::Int(dead_seed as i64)));
        let began_key = dead_sub.child("began_at").key();
        let hostname_key = dead_sub.child("hostname").key();

        store.transact(|txn| {
            // Reading the heartbeat key here is what installs the
            // read-conflict: a concurrent stealer racing on the same dead
            // seed will fail to commit if it reads the same key after us.
            let Some(current) = txn.get(&heartbeat_key)? else {
                return Ok(true); // already stolen by someone else
            };
            let current_ts = crate::model::decode_i64(&current);
            if now - current_ts <= STALE_HEARTBEAT_SECS {
                return Ok(false); // someone else already refreshed it
            }
            txn.remove(&heartbeat_key)?;
            txn.remove(&seed_key)?;
            txn.remove(&began_key)?;
            txn.remove(&hostname_key)?;
            Ok(true)
        })
    }

    fn read_max_runs(&self, eid: &str) -> JoshuaResult<u64> {
        let props_sub = self.registry.all_subspace().child(eid).child("properties");
        Ok(self
            .registry
            .store()
            .snapshot_get(&props_sub.pack(&Tuple::new().push("max_runs")))?
            .map(|v| crate::model::decode_i64(&v) as u64)
            .unwrap_or(0))
    }

    /// §4.3 `show_in_progress`.
    pub fn show_in_progress(&self, eid: &str) -> JoshuaResult<Vec<InProgressRun>> {
        let incomplete = self.incomplete_eid(eid);
        let entries = self.registry.store().scan_prefix(&incomplete)?;
        let now = crate::model::now_unix();
        let mut by_seed: std::collections::HashMap<u64, (Option<i64>, Option<String>, Option<i64>)> =
            std::collections::HashMap::new();

        for (key, value) in entries {
            let Some(rest) = incomplete.unpack(&key) else { continue };
            let Ok(tuple) = Tuple::unpack(rest) else { continue };
            match tuple.0.as_slice() {
                [Element::Str(tag)] if tag == "heartbeat" => continue, // handled below via child subspace scan
                [Element::Int(seed)] => {
                    by_seed.entry(*seed as u64).or_default();
                }
                [Element::Int(seed), Element::Str(field)] => {
                    let entry = by_seed.entry(*seed as u64).or_default();
                    match field.as_str() {
                        "began_at" => entry.0 = Some(crate::model::decode_i64(&value)),
                        "hostname" => entry.1 = Some(String::from_utf8_lossy(&value).to_string()),
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        let heartbeat_sub = incomplete.child("heartbeat");
        for (key, value) in self.registry.store().scan_prefix(&heartbeat_sub)? {
            let Some(rest) = heartbeat_sub.unpack(&key) else { continue };
            let Ok(tuple) = Tuple::unpack(rest) else { continue };
            if let Some(Element::Int(seed)) = tuple.0.into_iter().next() {
                let entry = by_seed.entry(seed as u64).or_default();
                entry.2 = Some(crate::model::decode_i64(&value));
            }
        }

        let mut out: Vec<InProgressRun> = by_seed
            .into_iter()
            .filter_map(|(seed, (began_at, hostname, heartbeat))| {
                let began_at = began_at?;
                let heartbeat = heartbeat?;
                Some(InProgressRun {
                    seed,
                    began_at,
                    hostname: hostname.unwrap_or_default(),
                    heartbeat,
                    running_for: now - began_at,
                })
            })
            .collect();
        out.sort_by_key(|r| r.seed);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EnsembleProperties;
    use crate::store::Store;

    fn setup() -> (Registry, ClaimProtocol, String) {
        let store = Store::temporary(&["joshua-claim-test"]).unwrap();
        let registry = Registry::new(store);
        let eid = registry
            .create("alice", EnsembleProperties::new("alice"), b"tarball", false)
            .unwrap();
        let claim = ClaimProtocol::new(registry.clone(), InstanceId::generate());
        (registry, claim, eid)
    }

    #[test]
    fn try_start_claims_a_fresh_seed() {
        let (_reg, claim, eid) = setup();
        assert!(claim.try_start(&eid, 1, false, "host-a").unwrap());
    }

    #[test]
    fn try_start_is_reentrant_for_same_instance() {
        let (_reg, claim, eid) = setup();
        assert!(claim.try_start(&eid, 1, false, "host-a").unwrap());
        assert!(claim.try_start(&eid, 1, false, "host-a").unwrap());
    }

    #[test]
    fn try_start_rejects_a_seed_claimed_by_another_instance() {
        let (registry, claim, eid) = setup();
        assert!(claim.try_start(&eid, 1, false, "host-a").unwrap());

        let other = ClaimProtocol::new(registry, InstanceId::generate());
        assert!(!other.try_start(&eid, 1, false, "host-b").unwrap());
    }

    #[test]
    fn try_start_fails_once_ensemble_is_stopped() {
        let (registry, claim, eid) = setup();
        registry.stop(&eid, false).unwrap();
        assert!(!claim.try_start(&eid, 1, false, "host-a").unwrap());
    }

    #[test]
    fn heartbeat_fails_once_claim_is_stolen() {
        let (registry, claim, eid) = setup();
        claim.try_start(&eid, 1, false, "host-a").unwrap();

        // simulate a steal: another instance overwrites the claim
        let other = ClaimProtocol::new(registry.clone(), InstanceId::generate());
        let incomplete = registry.incomplete_subspace().child(&eid);
        let seed_key = incomplete.pack(&Tuple::new().push(Element::Int(1)));
        registry
            .store()
            .transact(|txn| txn.set(&seed_key, other.instance_id().0))
            .unwrap();

        assert!(!claim.heartbeat_and_check(&eid, 1, false).unwrap());
    }

    #[test]
    fn heartbeat_fails_once_ensemble_stops() {
        let (registry, claim, eid) = setup();
        claim.try_start(&eid, 1, false, "host-a").unwrap();
        registry.stop(&eid, false).unwrap();
        assert!(!claim.heartbeat_and_check(&eid, 1, false).unwrap());
    }

    #[test]
    fn should_run_true_when_under_max_runs() {
        let (_reg, claim, eid) = setup();
        assert!(claim.should_run(&eid).unwrap());
    }

    #[test]
    fn should_run_steals_a_stale_claim() {
        let (registry, claim, eid) = setup();
        registry
            .store()
            .transact(|txn| {
                txn.set(
                    &registry
                        .all_subspace()
                        .child(&eid)
                        .child("properties")
                        .pack(&Tuple::new().push("max_runs")),
                    1i64.to_le_bytes(),
                )
            })
            .unwrap();

        let dead = ClaimProtocol::new(registry.clone(), InstanceId::generate());
        assert!(dead.try_start(&eid, 99, false, "dead-host").unwrap());

        // backdate the heartbeat past the stale threshold
        let incomplete = registry.incomplete_subspace().child(&eid);
        let heartbeat_key = incomplete
            .child("heartbeat")
            .pack(&Tuple::new().push(Element::Int(99)));
        let stale = crate::model::now_unix() - STALE_HEARTBEAT_SECS - 1;
        registry
            .store()
            .transact(|txn| txn.set(&heartbeat_key, stale.to_le_bytes()))
            .unwrap();

        assert!(claim.should_run(&eid).unwrap());
        assert!(claim.try_start(&eid, 100, false, "live-host").unwrap());
    }

    #[test]
    fn show_in_progress_reports_claimed_seeds() {
        let (_reg, claim, eid) = setup();
        claim.try_start(&eid, 42, false, "host-a").unwrap();
        let runs = claim.show_in_progress(&eid).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].seed, 42);
        assert_eq!(runs[0].hostname, "host-a");
    }
}
