//! Content hashing with blake3.

use std::{fs, io, path::Path};

/// Hex digest of `bytes`.
#[inline]
pub fn compute(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Hex digest of a file's contents.
pub fn file(path: &Path) -> io::Result<String> {
    Ok(compute(&fs::read(path)?))
}
