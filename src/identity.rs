//! Content identity for cache keys.
//!
//! Local files are identified by the SHA-256 of their bytes, remote videos
//! by the id their host assigns. Either way the same content always maps
//! to the same [`CacheKey`](crate::cache::CacheKey) for a given cache
//! version.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use sha2::{Digest, Sha256};

use crate::cache::CacheKey;
use crate::error::CrowdscanError;

/// Cache prefix for remote video ids.
pub const REMOTE_PREFIX: &str = "yt";

/// Cache prefix for local content hashes.
pub const FILE_PREFIX: &str = "file";

const CHUNK_SIZE: usize = 4096;

/// Hex-encoded SHA-256 of everything readable from `reader`.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<String, CrowdscanError> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn content_hash<P: AsRef<Path>>(path: P) -> Result<String, CrowdscanError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|error| CrowdscanError::FileOpen {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })?;
    hash_reader(BufReader::new(file))
}

/// Identity of a video's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentId {
    /// SHA-256 of a local file.
    File(String),
    /// Id assigned by a remote host.
    Remote(String),
}

impl ContentId {
    /// Hash a local file.
    pub fn for_file<P: AsRef<Path>>(path: P) -> Result<Self, CrowdscanError> {
        let path = path.as_ref();
        let hash = content_hash(path)?;
        log::debug!("Content hash for {}: {hash}", path.display());
        Ok(ContentId::File(hash))
    }

    /// Cache prefix for this kind of id.
    pub fn prefix(&self) -> &'static str {
        match self {
            ContentId::File(_) => FILE_PREFIX,
            ContentId::Remote(_) => REMOTE_PREFIX,
        }
    }

    /// The raw identifier.
    pub fn identifier(&self) -> &str {
        match self {
            ContentId::File(hash) => hash,
            ContentId::Remote(id) => id,
        }
    }

    /// Cache key under the given format version.
    pub fn cache_key(&self, version: &str) -> CacheKey {
        CacheKey::new(version, self.prefix(), self.identifier())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn identical_bytes_hash_identically() {
        let mut first = tempfile::NamedTempFile::new().unwrap();
        let mut second = tempfile::NamedTempFile::new().unwrap();
        let payload = vec![7u8; CHUNK_SIZE * 3 + 17];
        first.write_all(&payload).unwrap();
        second.write_all(&payload).unwrap();

        assert_eq!(
            content_hash(first.path()).unwrap(),
            content_hash(second.path()).unwrap()
        );
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            hash_reader(&b"abc"[..]).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn missing_file_is_file_open_error() {
        let result = content_hash("/definitely/not/here.mp4");
        assert!(matches!(result, Err(CrowdscanError::FileOpen { .. })));
    }

    #[test]
    fn keys_use_prefix_and_version() {
        let remote = ContentId::Remote("dQw4w9WgXcQ".to_string());
        assert_eq!(remote.cache_key("v2").to_string(), "v2_yt_dQw4w9WgXcQ");

        let local = ContentId::File("abc123".to_string());
        assert_eq!(local.cache_key("v3").to_string(), "v3_file_abc123");
    }
}
