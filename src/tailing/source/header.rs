// SPDX-License-Identifier: Apache-2.0

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Fingerprint of a file's leading bytes.
///
/// Headers read from disk keep the raw bytes. Headers restored from a
/// checkpoint only carry the length and the sha256 of those bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHeader {
    bytes: Option<Vec<u8>>,
    length: usize,
    sha256: String,
}

impl FileHeader {
    /// Read up to `max_len` bytes from the start of the file.
    pub fn read(path: &Path, max_len: usize) -> io::Result<Self> {
        let file = File::open(path)?;
        let mut buf = Vec::with_capacity(max_len);
        file.take(max_len as u64).read_to_end(&mut buf)?;
        Ok(Self::from_bytes(buf))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&bytes);
        Self {
            length: bytes.len(),
            bytes: Some(bytes),
            sha256,
        }
    }

    pub fn from_digest(length: usize, sha256: impl Into<String>) -> Self {
        Self {
            bytes: None,
            length,
            sha256: sha256.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Whether both headers agree on their common prefix.
    ///
    /// An empty header is compatible with anything. When one side only has a
    /// digest, the other side must hold at least as many bytes to compare.
    pub fn is_starting_same_as(&self, other: &FileHeader) -> bool {
        if self.length == 0 || other.length == 0 {
            return true;
        }
        match (&self.bytes, &other.bytes) {
            (Some(mine), Some(theirs)) => {
                let n = self.length.min(other.length);
                mine[..n] == theirs[..n]
            }
            (Some(mine), None) if other.length <= self.length => {
                sha256_hex(&mine[..other.length]) == other.sha256
            }
            (None, Some(theirs)) if self.length <= other.length => {
                sha256_hex(&theirs[..self.length]) == self.sha256
            }
            _ => false,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_limits_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();

        let header = FileHeader::read(&path, 4).unwrap();
        assert_eq!(header.len(), 4);
        assert_eq!(header.bytes(), Some(&b"0123"[..]));
        assert_eq!(header.sha256(), sha256_hex(b"0123"));

        let header = FileHeader::read(&path, 64).unwrap();
        assert_eq!(header.len(), 10);
    }

    #[test]
    fn test_prefix_comparison() {
        let short = FileHeader::from_bytes(b"hello".to_vec());
        let long = FileHeader::from_bytes(b"hello world".to_vec());
        let other = FileHeader::from_bytes(b"goodbye".to_vec());
        let empty = FileHeader::from_bytes(Vec::new());

        assert!(long.is_starting_same_as(&short));
        assert!(short.is_starting_same_as(&long));
        assert!(!long.is_starting_same_as(&other));
        assert!(empty.is_starting_same_as(&other));
        assert!(other.is_starting_same_as(&empty));
    }

    #[test]
    fn test_digest_comparison() {
        let restored = FileHeader::from_digest(5, sha256_hex(b"hello"));
        let live = FileHeader::from_bytes(b"hello world".to_vec());
        assert!(live.is_starting_same_as(&restored));
        assert!(restored.is_starting_same_as(&live));

        let truncated = FileHeader::from_bytes(b"hel".to_vec());
        assert!(!truncated.is_starting_same_as(&restored));

        let changed = FileHeader::from_bytes(b"jello world".to_vec());
        assert!(!changed.is_starting_same_as(&restored));

        let both_digests = FileHeader::from_digest(5, sha256_hex(b"hello"));
        assert!(!both_digests.is_starting_same_as(&restored));
    }
}
