//! Blob striping for payloads too large to fit in a single value (C1).
//!
//! Tarballs (§4.1) and spilled large outputs (§4.4) are both written
//! through this module: consecutive 8 KiB chunks keyed by byte offset,
//! batched into transactions of at most 128 KiB so a single blob write
//! never becomes one unbounded transaction.

use crate::error::JoshuaError;
use crate::store::directory::Subspace;
use crate::store::kv::Store;
use crate::store::tuple::{Element, Tuple};

pub const CHUNK_SIZE: usize = 8 * 1024;
const MAX_TXN_BYTES: usize = 128 * 1024;
const CHUNKS_PER_TXN: usize = MAX_TXN_BYTES / CHUNK_SIZE;

/// Threshold above which a result payload is spilled to a blob instead of
/// stored inline (§4.4).
pub const INLINE_LIMIT: usize = CHUNK_SIZE;

pub fn write_blob(store: &Store, subspace: &Subspace, data: &[u8]) -> Result<(), JoshuaError> {
    let chunks: Vec<&[u8]> = data.chunks(CHUNK_SIZE).collect();
    for (batch_index, batch) in chunks.chunks(CHUNKS_PER_TXN).enumerate() {
        let start_index = batch_index * CHUNKS_PER_TXN;
        store.transact(|txn| {
            for (i, chunk) in batch.iter().enumerate() {
                let offset = (start_index + i) * CHUNK_SIZE;
                let key = subspace.pack(&Tuple::new().push(Element::Int(offset as i64)));
                txn.set(&key, chunk)?;
            }
            Ok(())
        })?;
    }
    if data.is_empty() {
        // Ensure an empty blob still exists as a readable (empty) entity.
        let key = subspace.pack(&Tuple::new().push(Element::Int(0)));
        store.transact(|txn| txn.set(&key, b""))?;
    }
    Ok(())
}

pub fn read_blob(store: &Store, subspace: &Subspace) -> Result<Vec<u8>, JoshuaError> {
    let mut entries = store.scan_prefix(subspace)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut out = Vec::new();
    for (_, value) in entries {
        if value.is_empty() {
            break;
        }
        out.extend_from_slice(&value);
    }
    Ok(out)
}

pub fn delete_blob(store: &Store, subspace: &Subspace) -> Result<(), JoshuaError> {
    let keys: Vec<Vec<u8>> = store
        .scan_prefix(subspace)?
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    if keys.is_empty() {
        return Ok(());
    }
    store.transact(|txn| {
        for key in &keys {
            txn.remove(key)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_payload() {
        let store = Store::temporary(&["joshua-test"]).unwrap();
        let sub = store.directory(&["blob", "small"]);
        write_blob(&store, &sub, b"hello world").unwrap();
        assert_eq!(read_blob(&store, &sub).unwrap(), b"hello world".to_vec());
    }

    #[test]
    fn round_trips_multi_chunk_payload() {
        let store = Store::temporary(&["joshua-test"]).unwrap();
        let sub = store.directory(&["blob", "big"]);
        let data: Vec<u8> = (0..(CHUNK_SIZE * 5 + 37))
            .map(|i| (i % 251) as u8)
            .collect();
        write_blob(&store, &sub, &data).unwrap();
        assert_eq!(read_blob(&store, &sub).unwrap(), data);
    }

    #[test]
    fn delete_removes_every_chunk() {
        let store = Store::temporary(&["joshua-test"]).unwrap();
        let sub = store.directory(&["blob", "doomed"]);
        write_blob(&store, &sub, &vec![7u8; CHUNK_SIZE * 3]).unwrap();
        delete_blob(&store, &sub).unwrap();
        assert!(read_blob(&store, &sub).unwrap().is_empty());
        assert!(store.scan_prefix(&sub).unwrap().is_empty());
    }

    #[test]
    fn round_trip_is_byte_identical_for_tarball_sized_input() {
        let store = Store::temporary(&["joshua-test"]).unwrap();
        let sub = store.directory(&["blob", "tarball"]);
        let mut data = Vec::new();
        for i in 0..200_000u32 {
            data.extend_from_slice(&i.to_le_bytes());
        }
        write_blob(&store, &sub, &data).unwrap();
        assert_eq!(read_blob(&store, &sub).unwrap(), data);
    }
}
