//! KV namespace & blob store (C1) — the substrate every other module is
//! built on. See the module-level docs on `kv` for the shape of the
//! transaction API and its deliberate departures from a real
//! multi-key-transactional store.

pub mod blob;
pub mod directory;
pub mod kv;
pub mod tuple;

pub use blob::{read_blob, write_blob, delete_blob, CHUNK_SIZE, INLINE_LIMIT};
pub use directory::{Directory, Subspace};
pub use kv::{Store, Txn};
pub use tuple::{Element, Tuple};
