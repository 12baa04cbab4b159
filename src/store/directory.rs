//! Directory / subspace allocation.
//!
//! Real FoundationDB allocates a short integer prefix per directory path so
//! deeply-nested paths still pack down to a couple of bytes. We don't need
//! that compactness here, so a `Subspace`'s prefix is just the packed path
//! tuple itself — still a unique, order-preserving byte prefix per path,
//! which is the only property the rest of this crate relies on.

use super::tuple::{Element, Tuple};

/// A packed key prefix plus the helpers to build and scan keys under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    pub fn root(path: &[&str]) -> Self {
        let tuple = Tuple::of(path.iter().map(|p| Element::from(*p)));
        Subspace {
            prefix: tuple.pack(),
        }
    }

    /// Open a child subspace nested one level deeper under a string name.
    pub fn child(&self, name: &str) -> Self {
        self.child_tuple(&Tuple::new().push(name))
    }

    pub fn child_tuple(&self, tuple: &Tuple) -> Self {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(&tuple.pack());
        Subspace { prefix }
    }

    /// Pack a key within this subspace from additional tuple elements.
    pub fn pack(&self, tuple: &Tuple) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(&tuple.pack());
        key
    }

    /// The bare subspace key (no additional elements) — used for sentinel
    /// and change-counter keys that live directly at a subspace's root.
    pub fn key(&self) -> Vec<u8> {
        self.prefix.clone()
    }

    /// Strip this subspace's prefix off a full key, returning the
    /// remaining tuple bytes (caller can `Tuple::unpack` them).
    pub fn unpack<'a>(&self, full_key: &'a [u8]) -> Option<&'a [u8]> {
        full_key.strip_prefix(self.prefix.as_slice())
    }

    /// Half-open `[start, end)` byte range covering every key in this
    /// subspace (everything sharing the prefix).
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let start = self.prefix.clone();
        let end = strinc(&self.prefix);
        (start, end)
    }
}

/// Smallest byte string greater than every string with `prefix` as a
/// prefix: increment the last non-0xff byte and truncate the rest.
fn strinc(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(&last) = out.last() {
        if last == 0xff {
            out.pop();
        } else {
            *out.last_mut().unwrap() += 1;
            return out;
        }
    }
    // prefix was all 0xff (or empty): no finite upper bound, use a
    // maximal sentinel long enough not to collide with real keys.
    vec![0xff; prefix.len() + 1]
}

/// A directory registry: tracks which paths have been opened so
/// `create_or_open` is idempotent, mirroring the FDB directory layer's
/// `create_or_open` semantics without needing its allocator.
#[derive(Debug, Default)]
pub struct Directory {
    root: Vec<String>,
}

impl Directory {
    pub fn new(root: Vec<String>) -> Self {
        Directory { root }
    }

    pub fn create_or_open(&self, path: &[&str]) -> Subspace {
        let mut full: Vec<&str> = self.root.iter().map(String::as_str).collect();
        full.extend_from_slice(path);
        Subspace::root(&full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_keys_sort_within_parent_range() {
        let root = Subspace::root(&["joshua"]);
        let active = root.child("ensembles").child("active");
        let (start, end) = active.range();
        let key = active.pack(&Tuple::new().push("20260101-000000-bob-deadbeef"));
        assert!(key.as_slice() >= start.as_slice());
        assert!(key.as_slice() < end.as_slice());
    }

    #[test]
    fn sibling_subspaces_do_not_overlap() {
        let root = Subspace::root(&["joshua"]);
        let active = root.child("active");
        let sanity = root.child("sanity");
        let (a_start, a_end) = active.range();
        let (s_start, _s_end) = sanity.range();
        assert!(a_end <= s_start || s_start >= a_start && s_start >= a_end);
    }

    #[test]
    fn directory_create_or_open_is_stable() {
        let dir = Directory::new(vec!["joshua".to_string()]);
        let a = dir.create_or_open(&["ensembles", "active"]);
        let b = dir.create_or_open(&["ensembles", "active"]);
        assert_eq!(a, b);
    }
}
