//! The local on-disk cache: pack bytes, index blobs, and the last listing.
//!
//! Layout under the cache directory:
//!
//! ```text
//! blocks/<first-2-hex>/<rest-of-id>   cached pack blob bytes
//! indexes/<n-blob-id>                 cached index blobs (raw ciphertext)
//! list-cache                          last index listing + timestamp
//! ```
//!
//! Cache trouble is never fatal: a failed read or write logs and degrades to
//! a miss, and short or unreadable entries are evicted so the next read
//! re-fetches from the store.

use std::io::Write;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::BlobMeta;

const BLOCKS_DIR: &str = "blocks";
const INDEXES_DIR: &str = "indexes";
const LIST_CACHE: &str = "list-cache";

pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024 * 1024;

pub struct DiskCache {
    root: Utf8PathBuf,
    max_bytes: u64,
}

#[derive(Serialize, Deserialize)]
struct CachedListing {
    taken_at: i64,
    blobs: Vec<BlobMeta>,
}

impl DiskCache {
    pub fn open(root: impl AsRef<Utf8Path>, max_bytes: u64) -> Result<Self> {
        let root = root.as_ref().to_owned();
        std::fs::create_dir_all(root.join(BLOCKS_DIR))?;
        std::fs::create_dir_all(root.join(INDEXES_DIR))?;
        Ok(Self { root, max_bytes })
    }

    fn pack_path(&self, name: &str) -> Utf8PathBuf {
        // Shard by the first two hex characters so no single directory
        // collects every pack.
        let (bucket, rest) = if name.len() > 2 {
            name.split_at(2)
        } else {
            (name, name)
        };
        self.root.join(BLOCKS_DIR).join(bucket).join(rest)
    }

    fn index_path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(INDEXES_DIR).join(name)
    }

    /// Cached pack bytes, if present and at least `expected_len` long.
    /// Shorter entries are evicted as corrupt.
    pub fn get_pack(&self, name: &str, expected_len: u64) -> Option<Vec<u8>> {
        let path = self.pack_path(name);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("couldn't read cached pack {path}: {e}");
                return None;
            }
        };
        if (bytes.len() as u64) < expected_len {
            warn!(
                "cached pack {name} is {} bytes, expected at least {expected_len}; evicting",
                bytes.len()
            );
            let _ = std::fs::remove_file(&path);
            return None;
        }
        // Bump the mtime so eviction treats this as recently used.
        let _ = filetime::set_file_mtime(&path, filetime::FileTime::now());
        Some(bytes)
    }

    pub fn put_pack(&self, name: &str, bytes: &[u8]) {
        let path = self.pack_path(name);
        if let Err(e) = write_atomically(&path, bytes) {
            warn!("couldn't cache pack {name}: {e}");
            return;
        }
        self.evict_packs();
    }

    pub fn get_index(&self, name: &str) -> Option<Vec<u8>> {
        match std::fs::read(self.index_path(name)) {
            Ok(b) => Some(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("couldn't read cached index {name}: {e}");
                None
            }
        }
    }

    pub fn put_index(&self, name: &str, bytes: &[u8]) {
        let path = self.index_path(name);
        if let Err(e) = write_atomically(&path, bytes) {
            warn!("couldn't cache index {name}: {e}");
        }
    }

    /// The last stored listing, if it's younger than `ttl`.
    pub fn load_listing(&self, ttl: Duration) -> Option<Vec<BlobMeta>> {
        let bytes = std::fs::read(self.root.join(LIST_CACHE)).ok()?;
        let cached: CachedListing = serde_json::from_slice(&bytes).ok()?;
        let age = chrono::Utc::now().timestamp() - cached.taken_at;
        if age < 0 || age as u64 >= ttl.as_secs() {
            return None;
        }
        debug!("using {age}s-old cached listing ({} blobs)", cached.blobs.len());
        Some(cached.blobs)
    }

    pub fn store_listing(&self, blobs: &[BlobMeta]) {
        let cached = CachedListing {
            taken_at: chrono::Utc::now().timestamp(),
            blobs: blobs.to_vec(),
        };
        let bytes = serde_json::to_vec(&cached).expect("listing serializes");
        if let Err(e) = write_atomically(&self.root.join(LIST_CACHE), &bytes) {
            warn!("couldn't store list cache: {e}");
        }
    }

    /// Forget the cached listing so the next refresh really lists.
    pub fn drop_listing(&self) {
        let _ = std::fs::remove_file(self.root.join(LIST_CACHE));
    }

    /// Least-recently-used eviction over the pack area, down to `max_bytes`.
    fn evict_packs(&self) {
        let mut entries: Vec<(Utf8PathBuf, u64, std::time::SystemTime)> = Vec::new();
        let mut total: u64 = 0;
        for bucket in read_dir_paths(&self.root.join(BLOCKS_DIR)) {
            for file in read_dir_paths(&bucket) {
                let Ok(meta) = std::fs::metadata(&file) else {
                    continue;
                };
                total += meta.len();
                let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
                entries.push((file, meta.len(), mtime));
            }
        }
        if total <= self.max_bytes {
            return;
        }
        entries.sort_by_key(|(_, _, mtime)| *mtime);
        for (path, len, _) in entries {
            if total <= self.max_bytes {
                break;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("evicted {path} ({len} bytes)");
                    total -= len;
                }
                Err(e) => warn!("couldn't evict {path}: {e}"),
            }
        }
    }
}

fn read_dir_paths(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let Ok(entries) = dir.read_dir_utf8() else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_owned())
        .collect()
}

fn write_atomically(path: &Utf8Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().expect("cache paths have parents");
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new().prefix(".part-").tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_cache(max_bytes: u64) -> (tempfile::TempDir, DiskCache) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let cache = DiskCache::open(&root, max_bytes).unwrap();
        (dir, cache)
    }

    #[test]
    fn pack_round_trip_and_length_check() {
        let (_dir, cache) = temp_cache(DEFAULT_MAX_BYTES);
        assert!(cache.get_pack("pcafe01", 0).is_none());

        cache.put_pack("pcafe01", b"0123456789");
        assert_eq!(cache.get_pack("pcafe01", 10).unwrap(), b"0123456789");

        // Too short for the recorded extent: evicted, treated as a miss.
        assert!(cache.get_pack("pcafe01", 11).is_none());
        assert!(cache.get_pack("pcafe01", 10).is_none());
    }

    #[test]
    fn eviction_respects_the_bound() {
        let (_dir, cache) = temp_cache(25);
        cache.put_pack("paa01", &[1u8; 10]);
        cache.put_pack("pbb02", &[2u8; 10]);
        cache.put_pack("pcc03", &[3u8; 10]);

        let present = ["paa01", "pbb02", "pcc03"]
            .iter()
            .filter(|n| cache.get_pack(n, 10).is_some())
            .count();
        assert!(present <= 2, "expected eviction below 25 bytes");
    }

    #[test]
    fn index_round_trip() {
        let (_dir, cache) = temp_cache(DEFAULT_MAX_BYTES);
        assert!(cache.get_index("nabc").is_none());
        cache.put_index("nabc", b"ciphertext");
        assert_eq!(cache.get_index("nabc").unwrap(), b"ciphertext");
    }

    #[test]
    fn listing_honors_ttl() {
        let (_dir, cache) = temp_cache(DEFAULT_MAX_BYTES);
        assert!(cache.load_listing(Duration::from_secs(60)).is_none());

        let blobs = vec![BlobMeta {
            name: "n01".into(),
            length: 5,
            timestamp: 12345,
        }];
        cache.store_listing(&blobs);
        assert_eq!(cache.load_listing(Duration::from_secs(60)).unwrap(), blobs);
        assert!(cache.load_listing(Duration::from_secs(0)).is_none());

        cache.store_listing(&blobs);
        cache.drop_listing();
        assert!(cache.load_listing(Duration::from_secs(60)).is_none());
    }
}
