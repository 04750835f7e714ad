//! Helpers for walking CBOR maps and arrays.
//!
//! Message payloads are open maps rather than fixed structs, so they are
//! navigated by key instead of being decoded through derive.  The helpers
//! here wrap [`minicbor::Decoder`] with the lookup-by-key and typed-getter
//! operations the payload validation and the attestation hasher need.
//! Indefinite-length items are not produced by any supported peer and are
//! treated as absent.

use minicbor::data::Type;
use minicbor::Decoder;

/// Position a decoder at the value stored under `key` in the map `d` points
/// at.  `d` itself is not advanced.  Returns `None` if `d` is not a definite
/// map or the key is missing.
pub fn follow_key<'b>(d: &Decoder<'b>, key: &str) -> Option<Decoder<'b>> {
    let mut d = d.clone();
    let entries = d.map().ok()??;
    for _ in 0..entries {
        if d.datatype().ok()? != Type::String {
            // Non-string key; skip the pair.
            d.skip().ok()?;
            d.skip().ok()?;
            continue;
        }
        if d.str().ok()? == key {
            return Some(d);
        }
        d.skip().ok()?;
    }
    None
}

/// Read an unsigned integer value.
pub fn uint_value(d: &mut Decoder<'_>) -> Option<u64> {
    match d.datatype().ok()? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => d.u64().ok(),
        _ => None,
    }
}

/// Read a text value.
pub fn str_value<'b>(d: &mut Decoder<'b>) -> Option<&'b str> {
    match d.datatype().ok()? {
        Type::String => d.str().ok(),
        _ => None,
    }
}

/// Read the raw data of a text or byte string.  Both are accepted; the
/// attestation payload mixes the two freely.
pub fn data_value<'b>(d: &mut Decoder<'b>) -> Option<&'b [u8]> {
    match d.datatype().ok()? {
        Type::Bytes => d.bytes().ok(),
        Type::String => d.str().ok().map(str::as_bytes),
        _ => None,
    }
}

/// Whether the decoder points at a container (map or array).
pub fn is_container(d: &Decoder<'_>) -> bool {
    matches!(d.datatype(), Ok(Type::Map) | Ok(Type::Array))
}

/// The byte range `[start, end)` covered by the item `d` points at,
/// relative to the decoder's input.  Advances `d` past the item.
pub fn item_range(d: &mut Decoder<'_>) -> Option<core::ops::Range<usize>> {
    let start = d.position();
    d.skip().ok()?;
    Some(start..d.position())
}

/// Iterator over the elements of a definite array.
pub struct Children<'b> {
    d: Decoder<'b>,
    remaining: u64,
}

/// Iterate the elements of the array `d` points at.  Each item yielded is a
/// decoder positioned at one element.
pub fn array_children<'b>(d: &Decoder<'b>) -> Option<Children<'b>> {
    let mut d = d.clone();
    let remaining = d.array().ok()??;
    Some(Children { d, remaining })
}

impl<'b> Iterator for Children<'b> {
    type Item = Decoder<'b>;

    fn next(&mut self) -> Option<Decoder<'b>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let child = self.d.clone();
        self.d.skip().ok()?;
        Some(child)
    }
}
