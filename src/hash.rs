//! Content digests for dependency tracking.

use crate::error::{BuildIoError, Result};
use md5::Digest as _;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, io, path::Path};

/// A hex encoded md5 digest.
///
/// Used as a non-cryptographic checksum for file contents, fact values and
/// whole dependency records. Collision resistance is not a goal; change
/// detection is.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Digest of a byte buffer.
    pub fn of_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = md5::Md5::new();
        hasher.update(bytes.as_ref());
        Self(hex::encode(hasher.finalize()))
    }

    /// Digest of a file's contents, streamed.
    ///
    /// Returns `Ok(None)` if the file does not exist; the absence itself is
    /// a recordable observation for sibling-source probing.
    pub fn of_file(path: &Path) -> Result<Option<Self>, BuildIoError> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(BuildIoError::new(err, path)),
        };
        let mut reader = io::BufReader::new(file);
        let mut hasher = md5::Md5::new();
        io::copy(&mut reader, &mut hasher).map_err(|err| BuildIoError::new(err, path))?;
        Ok(Some(Self(hex::encode(hasher.finalize()))))
    }

    /// Digest of a serde value via its canonical JSON encoding.
    ///
    /// `serde_json` objects iterate in key order, so the encoding (and the
    /// digest) is independent of insertion order.
    pub fn of_value(value: &serde_json::Value) -> Self {
        Self::of_bytes(value.to_string())
    }

    /// Digest over an ordered sequence of fields, length-delimited so that
    /// `["ab","c"]` and `["a","bc"]` hash differently.
    pub fn of_fields<I, T>(fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let mut hasher = md5::Md5::new();
        for field in fields {
            let field = field.as_ref();
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A short prefix suitable for directory names.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_digests_are_length_delimited() {
        let a = ContentHash::of_fields(["ab", "c"]);
        let b = ContentHash::of_fields(["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn value_digest_ignores_insertion_order() {
        let a: serde_json::Value = serde_json::json!({"x": 1, "y": [1, 2]});
        let b: serde_json::Value =
            serde_json::from_str(r#"{"y": [1, 2], "x": 1}"#).unwrap();
        assert_eq!(ContentHash::of_value(&a), ContentHash::of_value(&b));
    }

    #[test]
    fn missing_file_hashes_to_none() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nope.hpp");
        assert_eq!(ContentHash::of_file(&path).unwrap(), None);
        std::fs::write(&path, "x").unwrap();
        assert!(ContentHash::of_file(&path).unwrap().is_some());
    }
}
