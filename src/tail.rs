//! Tail/subscribe stream (C7, §4.7).
//!
//! Merge-read of `pass`+`fail` (or fail-only) result rows for one
//! ensemble, in versionstamp order, following along as new rows land
//! until the ensemble is gone from the active index.

use tokio_stream::Stream;

use crate::error::JoshuaResult;
use crate::registry::Registry;
use crate::store::{Element, Tuple};
use crate::xml::parse_value_in_blob;

const BATCH_DEADLINE_MS: u64 = 250;

/// One decoded result row.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub eid: String,
    pub seed: u64,
    pub code: i32,
    pub hostname: String,
    pub output: Vec<u8>,
}

/// What kinds of rows a tail should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailFilter {
    PassAndFail,
    FailOnly,
}

pub struct TailStream {
    registry: Registry,
    eid: String,
    filter: TailFilter,
    cursor: Vec<u8>,
    finished: bool,
}

impl TailStream {
    /// Start tailing `eid` from `from_versionstamp` (empty = beginning).
    pub fn new(registry: Registry, eid: impl Into<String>, filter: TailFilter, from_versionstamp: Vec<u8>) -> Self {
        TailStream {
            registry,
            eid: eid.into(),
            filter,
            cursor: from_versionstamp,
            finished: false,
        }
    }

    fn kinds(&self) -> &'static [&'static str] {
        match self.filter {
            TailFilter::PassAndFail => &["pass", "fail"],
            TailFilter::FailOnly => &["fail"],
        }
    }

    /// Pull every row committed since the cursor, across the relevant
    /// kinds, sorted into versionstamp order (the leading tuple element
    /// of every row key).
    fn drain_available(&mut self) -> JoshuaResult<Vec<ResultRecord>> {
        let mut rows: Vec<(Vec<u8>, ResultRecord)> = Vec::new();
        for kind in self.kinds() {
            let sub = self.registry.results_subspace(kind, &self.eid);
            for (key, value) in self.registry.store().scan_prefix(&sub)? {
                let Some(rest) = sub.unpack(&key) else { continue };
                if rest < self.cursor.as_slice() {
                    continue;
                }
                let Ok(tuple) = Tuple::unpack(rest) else { continue };
                let [Element::Bytes(_vs), Element::Int(code), Element::Str(hostname), Element::Int(seed)] =
                    tuple.0.as_slice()
                else {
                    continue;
                };
                let output = self.resolve_output(&value, *seed as u64)?;
                rows.push((
                    rest.to_vec(),
                    ResultRecord {
                        eid: self.eid.clone(),
                        seed: *seed as u64,
                        code: *code as i32,
                        hostname: hostname.clone(),
                        output,
                    },
                ));
            }
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some((last_key, _)) = rows.last() {
            self.cursor = bump(last_key);
        }
        Ok(rows.into_iter().map(|(_, r)| r).collect())
    }

    /// Resolve `value_in_blob` markers by reading the referenced blob
    /// (honouring `BlobVersion` 1 vs 2, §3 "Large outputs").
    fn resolve_output(&self, stored: &[u8], seed: u64) -> JoshuaResult<Vec<u8>> {
        let Ok(text) = std::str::from_utf8(stored) else {
            return Ok(stored.to_vec());
        };
        let Some(marker) = parse_value_in_blob(text) else {
            return Ok(stored.to_vec());
        };
        let sub = match marker.version {
            2 => self
                .registry
                .store()
                .directory(&["ensembles", "results", "large"])
                .child(&self.eid)
                .child(&seed.to_string()),
            _ => self
                .registry
                .store()
                .directory(&["ensembles", "results", "large"])
                .child(&seed.to_string()),
        };
        crate::store::read_blob(self.registry.store(), &sub)
    }

    fn ensemble_still_active(&self) -> JoshuaResult<bool> {
        let key = self
            .registry
            .index_subspace(false)
            .pack(&Tuple::new().push(self.eid.clone()));
        Ok(self.registry.store().snapshot_get(&key)?.is_some())
    }

    /// Block until either more rows are available or the stream should
    /// end, per §4.7's loop: read a batch, and if exhausted wait on the
    /// ensemble's `ended` counter or its active-index entry (or time out
    /// after `BATCH_DEADLINE_MS` and just retry).
    pub async fn next_batch(&mut self) -> JoshuaResult<Option<Vec<ResultRecord>>> {
        if self.finished {
            return Ok(None);
        }
        let rows = self.drain_available()?;
        if !rows.is_empty() {
            return Ok(Some(rows));
        }
        if !self.ensemble_still_active()? {
            self.finished = true;
            return Ok(None);
        }

        let ended_key = self
            .registry
            .all_subspace()
            .child(&self.eid)
            .child("count")
            .pack(&Tuple::new().push("ended"));
        let active_key = self
            .registry
            .index_subspace(false)
            .child("~change")
            .key();

        let ended_watch = self.registry.store().watch(&ended_key);
        let active_watch = self.registry.store().watch(&active_key);
        let deadline = tokio::time::sleep(std::time::Duration::from_millis(BATCH_DEADLINE_MS));

        tokio::select! {
            _ = ended_watch => {}
            _ = active_watch => {}
            _ = deadline => {}
        }
        Ok(Some(Vec::new()))
    }

    /// Adapt to a `Stream` of individual records (flattening batches),
    /// ending the stream once the ensemble is gone and drained.
    pub fn into_stream(mut self) -> impl Stream<Item = ResultRecord> {
        async_stream::stream! {
            loop {
                match self.next_batch().await {
                    Ok(Some(batch)) => {
                        for record in batch {
                            yield record;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "tail stream read failed, stopping");
                        break;
                    }
                }
            }
        }
    }
}

fn bump(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.push(0);
    out
}
