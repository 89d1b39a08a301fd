// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Digest types and the `CONCAT_LINES` hashing scheme used to summarize segments and
//! tree nodes (§3 of the data model).

use sha1::{Digest as _, Sha1};

/// A SHA-1 digest, 20 bytes.
pub type Hash = [u8; 20];

/// `SHA-1(&[])`, the empty-content digest produced by a node with no children or an
/// empty segment.
#[must_use]
pub fn empty_hash() -> Hash {
    sha1_bytes(&[])
}

fn sha1_bytes(bytes: &[u8]) -> Hash {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// `digest = SHA-1(value)`, the per-key digest stored in a `SegmentDatum`.
#[must_use]
pub fn value_digest(value: &[u8]) -> Hash {
    sha1_bytes(value)
}

/// Joins `lines` with `'\n'`, appending a trailing `'\n'` after the final element too,
/// then hashes the result. An empty iterator produces [`empty_hash`].
fn concat_lines_hash<I, S>(lines: I) -> Hash
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut buf = String::new();
    for line in lines {
        buf.push_str(line.as_ref());
        buf.push('\n');
    }
    sha1_bytes(buf.as_bytes())
}

/// Leaf hash: `SHA-1(CONCAT_LINES(hex(key) + "," + hex(digest)))` over the segment's
/// `(key, digest)` pairs, which callers must already have sorted by key.
#[must_use]
pub fn leaf_hash<'a, I>(sorted_entries: I) -> Hash
where
    I: IntoIterator<Item = (&'a [u8], &'a Hash)>,
{
    let lines = sorted_entries
        .into_iter()
        .map(|(key, digest)| format!("{},{}", hex::encode(key), hex::encode(digest)));
    concat_lines_hash(lines)
}

/// Internal node hash: `SHA-1(CONCAT_LINES(hex(childHash)))` over the children that
/// currently have a stored hash, in child-id order. Callers must already have ordered
/// and filtered `child_hashes` to only present children.
#[must_use]
pub fn internal_hash<'a, I>(child_hashes: I) -> Hash
where
    I: IntoIterator<Item = &'a Hash>,
{
    let lines = child_hashes.into_iter().map(hex::encode);
    concat_lines_hash(lines)
}
