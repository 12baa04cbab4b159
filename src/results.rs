//! Result sink (C4, §4.4).
//!
//! Transactional result insertion, counters, fail-fast / max-runs
//! termination, and large-output spill. This is the only module that
//! calls `Registry::stop` as a side effect of ordinary run completion.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::JoshuaResult;
use crate::registry::Registry;
use crate::store::{write_blob, Element, Tuple, INLINE_LIMIT};

/// Outcome of `insert_results`, for callers that want to know whether the
/// write actually landed (vs. being silently dropped per I3/I4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Row written, ensemble still running afterwards.
    Inserted,
    /// Row written, and this insertion also stopped the ensemble
    /// (fail_fast or max_runs reached).
    InsertedAndStopped,
    /// Nothing written: ensemble already stopped, or the matching
    /// `/incomplete` entry was gone (race, I3).
    Dropped,
}

pub struct ResultSink {
    registry: Registry,
}

impl ResultSink {
    pub fn new(registry: Registry) -> Self {
        ResultSink { registry }
    }

    /// §4.4 `insert_results`. `output` is the raw (uncompressed) payload;
    /// spill-to-blob and compression are handled internally per the
    /// ensemble's `compressed` property.
    pub fn insert_results(
        &self,
        eid: &str,
        seed: u64,
        code: i32,
        output: &[u8],
        is_sanity: bool,
        fail_fast: u64,
        max_runs: u64,
        duration_secs: f64,
        compressed: bool,
    ) -> JoshuaResult<InsertOutcome> {
        let store = self.registry.store();
        let all = self.registry.all_subspace().child(eid);
        let count_sub = all.child("count");
        let incomplete = self.registry.incomplete_subspace().child(eid);
        let seed_key = incomplete.pack(&Tuple::new().push(Element::Int(seed as i64)));
        let began_key = incomplete
            .child_tuple(&Tuple::new().push(Element::Int(seed as i64)))
            .child("began_at")
            .key();
        let hostname_key = incomplete
            .child_tuple(&Tuple::new().push(Element::Int(seed as i64)))
            .child("hostname")
            .key();
        let heartbeat_key = incomplete
            .child("heartbeat")
            .pack(&Tuple::new().push(Element::Int(seed as i64)));
        let index_key = self
            .registry
            .index_subspace(is_sanity)
            .pack(&Tuple::new().push(eid.to_string()));

        let large_sub = self.registry.results_subspace("large", eid).child(&seed.to_string());
        let (stored_output, spill) = prepare_payload(output, seed, large_sub, compressed);
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let results_sub = if code != 0 {
            self.registry.results_subspace("fail", eid)
        } else {
            self.registry.results_subspace("pass", eid)
        };

        let outcome = store.transact(|txn| {
            if !txn.exists(&index_key)? {
                return Ok(InsertOutcome::Dropped);
            }
            if !txn.exists(&seed_key)? {
                return Ok(InsertOutcome::Dropped);
            }
            txn.remove(&seed_key)?;
            txn.remove(&began_key)?;
            txn.remove(&hostname_key)?;
            txn.remove(&heartbeat_key)?;

            txn.atomic_add(&count_sub.pack(&Tuple::new().push("ended")), 1)?;
            let mut should_stop = false;
            if code != 0 {
                let fail_count = txn.atomic_add(&count_sub.pack(&Tuple::new().push("fail")), 1)?;
                if fail_fast > 0 && fail_count >= fail_fast {
                    should_stop = true;
                }
            } else {
                txn.atomic_add(&count_sub.pack(&Tuple::new().push("pass")), 1)?;
            }
            let ended_count = store_snapshot_ended(txn, &count_sub)?;
            if max_runs > 0 && ended_count >= max_runs {
                should_stop = true;
            }
            txn.atomic_add(
                &count_sub.pack(&Tuple::new().push("duration")),
                duration_secs.floor() as i64,
            )?;

            let vs = self.registry.store().mint_versionstamp(txn)?;
            let row_key = results_sub.pack(&Tuple::new().push(Element::Bytes(vs.to_vec())).push(Element::Int(code as i64)).push(hostname.clone()).push(Element::Int(seed as i64)));
            txn.set(&row_key, &stored_output)?;

            Ok(if should_stop {
                InsertOutcome::InsertedAndStopped
            } else {
                InsertOutcome::Inserted
            })
        })?;

        match outcome {
            InsertOutcome::Dropped => {}
            InsertOutcome::Inserted => {
                if let Some((subspace, payload)) = spill {
                    write_blob(store, &subspace, &payload)?;
                }
                store.notify_change(&count_sub.pack(&Tuple::new().push("ended")));
            }
            InsertOutcome::InsertedAndStopped => {
                if let Some((subspace, payload)) = spill {
                    write_blob(store, &subspace, &payload)?;
                }
                store.notify_change(&count_sub.pack(&Tuple::new().push("ended")));
                // Bounded overshoot is acceptable (§4.4, §8): stop() may
                // race with another finalizer also crossing the
                // threshold; both attempts are safe, only the first wins
                // I5.
                let _ = self.registry.stop(eid, is_sanity);
            }
        }

        Ok(outcome)
    }
}

fn store_snapshot_ended(
    txn: &crate::store::Txn,
    count_sub: &crate::store::Subspace,
) -> sled::transaction::ConflictableTransactionResult<u64, crate::error::JoshuaError> {
    let key = count_sub.pack(&Tuple::new().push("ended"));
    Ok(txn.get(&key)?.map(|v| crate::store::kv::decode_u64(&v)).unwrap_or(0))
}

/// Large-output spill (§4.4): compress (if the ensemble wants it),
/// compare against `INLINE_LIMIT`, and if over, replace the stored output
/// with the `value_in_blob` marker and return the blob write to do after
/// the transaction commits.
fn prepare_payload(
    output: &[u8],
    seed: u64,
    large_sub: crate::store::Subspace,
    compressed: bool,
) -> (Vec<u8>, Option<(crate::store::Subspace, Vec<u8>)>) {
    let maybe_compressed = if compressed { zlib_compress(output) } else { output.to_vec() };

    if maybe_compressed.len() <= INLINE_LIMIT {
        return (maybe_compressed, None);
    }

    let marker = format!(
        r#"<Test><JoshuaMessage Message="value_in_blob" BlobKey="{seed}" BlobVersion="2"/></Test>"#
    );
    let marker_bytes = if compressed {
        zlib_compress(marker.as_bytes())
    } else {
        marker.into_bytes()
    };
    (marker_bytes, Some((large_sub, maybe_compressed)))
}

fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("in-memory encoder never fails");
    encoder.finish().expect("in-memory encoder never fails")
}

impl Registry {
    /// `/ensembles/results/<kind>/<EID>` where `kind` is `pass`, `fail`,
    /// or `large` (§3) — kind comes first so a `kind` range-delete (not
    /// used here, but kept for symmetry with the index subspaces) would
    /// span every ensemble's rows of that kind.
    pub(crate) fn results_subspace(&self, kind: &str, eid: &str) -> crate::store::Subspace {
        self.store().directory(&["ensembles", "results", kind]).child(eid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{ClaimProtocol, InstanceId};
    use crate::model::EnsembleProperties;
    use crate::store::Store;

    fn setup() -> (Registry, ClaimProtocol, ResultSink, String) {
        let store = Store::temporary(&["joshua-results-test"]).unwrap();
        let registry = Registry::new(store);
        let eid = registry
            .create("alice", EnsembleProperties::new("alice"), b"tarball", false)
            .unwrap();
        let claim = ClaimProtocol::new(registry.clone(), InstanceId::generate());
        let sink = ResultSink::new(registry.clone());
        (registry, claim, sink, eid)
    }

    #[test]
    fn inserting_a_pass_increments_counters_and_writes_a_row() {
        let (registry, claim, sink, eid) = setup();
        claim.try_start(&eid, 1, false, "host-a").unwrap();
        let outcome = sink
            .insert_results(&eid, 1, 0, b"ok", false, 0, 0, 1.5, false)
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);

        let summary = registry.read_summary(&eid).unwrap().unwrap();
        assert_eq!(summary.counters.pass, 1);
        assert_eq!(summary.counters.fail, 0);
        assert_eq!(summary.counters.ended, 1);
        assert_eq!(summary.counters.duration, 1);
    }

    #[test]
    fn inserting_without_a_matching_incomplete_entry_is_dropped() {
        let (_reg, _claim, sink, eid) = setup();
        let outcome = sink.insert_results(&eid, 999, 0, b"ok", false, 0, 0, 0.0, false).unwrap();
        assert_eq!(outcome, InsertOutcome::Dropped);
    }

    #[test]
    fn fail_fast_stops_the_ensemble_once_threshold_is_reached() {
        let (registry, claim, sink, eid) = setup();
        for seed in 1..=3u64 {
            claim.try_start(&eid, seed, false, "host-a").unwrap();
            sink.insert_results(&eid, seed, 1, b"boom", false, 3, 0, 0.1, false)
                .unwrap();
        }
        assert!(registry.list_active().unwrap().is_empty());
        let summary = registry.read_summary(&eid).unwrap().unwrap();
        assert_eq!(summary.counters.fail, 3);
    }

    #[test]
    fn max_runs_stops_the_ensemble_once_ended_reaches_it() {
        let (registry, claim, sink, eid) = setup();
        for seed in 1..=2u64 {
            claim.try_start(&eid, seed, false, "host-a").unwrap();
            sink.insert_results(&eid, seed, 0, b"ok", false, 0, 2, 0.1, false)
                .unwrap();
        }
        assert!(registry.list_active().unwrap().is_empty());
    }

    #[test]
    fn large_output_is_spilled_and_round_trips_via_blob_read() {
        let (registry, claim, sink, eid) = setup();
        claim.try_start(&eid, 7, false, "host-a").unwrap();
        let big_output = vec![b'x'; 50_000];
        sink.insert_results(&eid, 7, 0, &big_output, false, 0, 0, 0.1, false)
            .unwrap();

        let rows = registry
            .store()
            .scan_prefix(&registry.results_subspace("pass", &eid))
            .unwrap();
        assert_eq!(rows.len(), 1);
        let marker = String::from_utf8_lossy(&rows[0].1).to_string();
        assert!(marker.contains("value_in_blob"));
        assert!(marker.contains("BlobVersion=\"2\""));

        let blob_sub = registry
            .store()
            .directory(&["ensembles", "results"])
            .child("large")
            .child(&eid)
            .child("7");
        let restored = crate::store::read_blob(registry.store(), &blob_sub).unwrap();
        assert_eq!(restored, big_output);
    }

    #[test]
    fn second_racing_finalizer_does_not_write_a_second_row() {
        let (registry, claim, sink, eid) = setup();
        claim.try_start(&eid, 1, false, "host-a").unwrap();
        sink.insert_results(&eid, 1, 0, b"first", false, 0, 0, 0.1, false).unwrap();
        // Same seed again with no claim left: dropped, not a second row.
        let outcome = sink.insert_results(&eid, 1, 0, b"second", false, 0, 0, 0.1, false).unwrap();
        assert_eq!(outcome, InsertOutcome::Dropped);

        let rows = registry
            .store()
            .scan_prefix(&registry.results_subspace("pass", &eid))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
