//! The metadata cache this crate treats as an external collaborator:
//! a content-addressed store, keyed by hex info-hash, that a caller can
//! plug in to skip the race coordinator entirely on repeat requests. Two
//! trivial implementations live here; anything more elaborate is the
//! caller's problem.

use crate::id::Id20;
use log::warn;
use std::fs;
use std::path::PathBuf;

pub trait MetadataCache: Send + Sync {
    /// Returns the raw `info` dict bytes for `info_hash`, if already known.
    fn get(&self, info_hash: &Id20) -> Option<Vec<u8>>;

    /// Stores the raw, already-verified `info` dict bytes for `info_hash`.
    fn put(&self, info_hash: &Id20, raw_info: &[u8]);
}

/// Always misses, never stores. The default when no cache is configured.
pub struct NullCache;

impl MetadataCache for NullCache {
    fn get(&self, _info_hash: &Id20) -> Option<Vec<u8>> {
        None
    }

    fn put(&self, _info_hash: &Id20, _raw_info: &[u8]) {}
}

/// One file per info-hash under `dir`, named by its hex encoding.
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<FileCache> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileCache { dir })
    }

    fn path_for(&self, info_hash: &Id20) -> PathBuf {
        self.dir.join(info_hash.to_hex())
    }
}

impl MetadataCache for FileCache {
    fn get(&self, info_hash: &Id20) -> Option<Vec<u8>> {
        match fs::read(self.path_for(info_hash)) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("metadata cache read failed for {info_hash}: {e}");
                None
            }
        }
    }

    fn put(&self, info_hash: &Id20, raw_info: &[u8]) {
        if let Err(e) = fs::write(self.path_for(info_hash), raw_info) {
            warn!("metadata cache write failed for {info_hash}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_cache_always_misses() {
        let cache = NullCache;
        let id = Id20::random();
        cache.put(&id, b"whatever");
        assert!(cache.get(&id).is_none());
    }

    #[test]
    fn file_cache_round_trips() {
        let dir = std::env::temp_dir().join(format!("m2t-cache-test-{}", std::process::id()));
        let cache = FileCache::new(&dir).unwrap();
        let id = Id20::random();

        assert!(cache.get(&id).is_none());
        cache.put(&id, b"raw info bytes");
        assert_eq!(cache.get(&id).as_deref(), Some(b"raw info bytes".as_slice()));

        let _ = fs::remove_dir_all(&dir);
    }
}
