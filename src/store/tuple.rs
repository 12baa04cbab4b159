//! Order-preserving tuple encoding for keys.
//!
//! A minimal stand-in for the FoundationDB tuple layer: enough element
//! types to express every key this crate needs (byte strings, UTF-8
//! strings, and signed integers), encoded so that the byte-wise order of
//! the encoding matches the natural order of the tuple. That property is
//! what lets range scans over a subspace return entries in EID or
//! versionstamp order without decoding each key first.

use std::cmp::Ordering;

const TAG_BYTES: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const ESCAPE: u8 = 0x00;
const ESCAPE_FOLLOW: u8 = 0xff;

/// One element of a tuple key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Bytes(Vec<u8>),
    Str(String),
    Int(i64),
}

impl From<&str> for Element {
    fn from(s: &str) -> Self {
        Element::Str(s.to_string())
    }
}

impl From<String> for Element {
    fn from(s: String) -> Self {
        Element::Str(s)
    }
}

impl From<i64> for Element {
    fn from(v: i64) -> Self {
        Element::Int(v)
    }
}

impl From<u64> for Element {
    fn from(v: u64) -> Self {
        Element::Int(v as i64)
    }
}

impl From<Vec<u8>> for Element {
    fn from(v: Vec<u8>) -> Self {
        Element::Bytes(v)
    }
}

/// A sequence of elements packed into one key component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuple(pub Vec<Element>);

impl Tuple {
    pub fn new() -> Self {
        Tuple(Vec::new())
    }

    pub fn of<I: IntoIterator<Item = Element>>(elems: I) -> Self {
        Tuple(elems.into_iter().collect())
    }

    pub fn push(mut self, e: impl Into<Element>) -> Self {
        self.0.push(e.into());
        self
    }

    /// Encode into an order-preserving byte string.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for elem in &self.0 {
            match elem {
                Element::Bytes(b) => {
                    out.push(TAG_BYTES);
                    escape_into(b, &mut out);
                    out.push(ESCAPE);
                }
                Element::Str(s) => {
                    out.push(TAG_STRING);
                    escape_into(s.as_bytes(), &mut out);
                    out.push(ESCAPE);
                }
                Element::Int(v) => {
                    out.push(TAG_INT);
                    // Bias by 2^63 so two's-complement ordering becomes
                    // unsigned byte-wise ordering, then emit big-endian.
                    let biased = (*v as i128 + (1i128 << 63)) as u64;
                    out.extend_from_slice(&biased.to_be_bytes());
                }
            }
        }
        out
    }

    /// Decode a previously packed tuple. Only used by readers (tail
    /// stream, show_in_progress) that need the original values back.
    pub fn unpack(mut buf: &[u8]) -> Result<Tuple, String> {
        let mut elems = Vec::new();
        while !buf.is_empty() {
            let tag = buf[0];
            buf = &buf[1..];
            match tag {
                TAG_BYTES | TAG_STRING => {
                    let (raw, rest) = unescape_until_terminator(buf)?;
                    buf = rest;
                    if tag == TAG_BYTES {
                        elems.push(Element::Bytes(raw));
                    } else {
                        elems.push(Element::Str(
                            String::from_utf8(raw).map_err(|e| e.to_string())?,
                        ));
                    }
                }
                TAG_INT => {
                    if buf.len() < 8 {
                        return Err("truncated int element".to_string());
                    }
                    let mut arr = [0u8; 8];
                    arr.copy_from_slice(&buf[..8]);
                    buf = &buf[8..];
                    let biased = u64::from_be_bytes(arr);
                    let v = (biased as i128 - (1i128 << 63)) as i64;
                    elems.push(Element::Int(v));
                }
                other => return Err(format!("unknown tuple tag {other:#x}")),
            }
        }
        Ok(Tuple(elems))
    }
}

fn escape_into(raw: &[u8], out: &mut Vec<u8>) {
    for &b in raw {
        out.push(b);
        if b == ESCAPE {
            out.push(ESCAPE_FOLLOW);
        }
    }
}

fn unescape_until_terminator(buf: &[u8]) -> Result<(Vec<u8>, &[u8]), String> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == ESCAPE {
            if i + 1 < buf.len() && buf[i + 1] == ESCAPE_FOLLOW {
                out.push(ESCAPE);
                i += 2;
                continue;
            }
            // bare 0x00: terminator
            return Ok((out, &buf[i + 1..]));
        }
        out.push(buf[i]);
        i += 1;
    }
    Err("unterminated bytes/string element".to_string())
}

/// Compare two packed tuples byte-wise (this is exactly the order a range
/// scan over the backing store will return them in).
pub fn byte_order(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_tuple() {
        let t = Tuple::new()
            .push("ensembles")
            .push("active")
            .push(Element::Int(-2))
            .push(Element::Bytes(vec![0x00, 0x01, 0xff]));
        let packed = t.pack();
        let back = Tuple::unpack(&packed).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn int_ordering_is_preserved() {
        let a = Tuple::new().push(Element::Int(-3)).pack();
        let b = Tuple::new().push(Element::Int(-1)).pack();
        let c = Tuple::new().push(Element::Int(0)).pack();
        let d = Tuple::new().push(Element::Int(100)).pack();
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn string_prefix_ordering_is_preserved() {
        let a = Tuple::new().push("20260101-000000-alice-aaaa").pack();
        let b = Tuple::new().push("20260101-000001-alice-bbbb").pack();
        assert!(a < b);
    }

    proptest::proptest! {
        /// The whole point of this encoding (§4.1 "order-preserving"):
        /// packed byte order must agree with integer order for every
        /// pair, not just the handful of fixed cases above.
        #[test]
        fn packed_int_order_matches_int_order(a: i64, b: i64) {
            let packed_a = Tuple::new().push(Element::Int(a)).pack();
            let packed_b = Tuple::new().push(Element::Int(b)).pack();
            proptest::prop_assert_eq!(a.cmp(&b), packed_a.cmp(&packed_b));
        }

        #[test]
        fn any_mixed_tuple_round_trips(a: i64, s in "[ -~]{0,32}", bytes: Vec<u8>) {
            let t = Tuple::new().push(Element::Int(a)).push(s).push(Element::Bytes(bytes));
            let packed = t.pack();
            let back = Tuple::unpack(&packed).unwrap();
            proptest::prop_assert_eq!(t, back);
        }
    }
}
