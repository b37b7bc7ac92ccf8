//! Label-indexed JSON manifests, stored through the block layer.
//!
//! Every entry is a small JSON document tagged with a label map. The whole
//! table is held in memory (loaded on first use) and persisted as a single
//! consolidated block in the `m` namespace; flushing tombstones the blocks
//! the new one supersedes, so manifest history dedups and compacts through
//! the same machinery as everything else.
//!
//! Concurrent writers may flush divergent manifest blocks; refresh merges
//! by union, with tombstones beating strictly-older additions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use data_encoding::HEXLOWER;
use rand::RngCore;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use crate::block::BlockManager;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::hashing::{BlockId, Prefix};
use crate::index::BlockKind;

const MANIFEST_VERSION: u32 = 1;

/// Id of one manifest entry: random, unique per put.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(HEXLOWER.encode(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Labels = BTreeMap<String, String>;

/// What [`ManifestManager::find`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub id: EntryId,
    pub labels: Labels,
    /// Seconds since the epoch.
    pub mod_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    id: EntryId,
    labels: Labels,
    mod_time: i64,
    #[serde(default)]
    deleted: bool,
    content: serde_json::Value,
}

impl StoredEntry {
    /// Union-merge rule: a tombstone beats strictly-older additions,
    /// otherwise the later modification wins.
    fn wins_over(&self, other: &StoredEntry) -> bool {
        (self.mod_time, self.deleted) > (other.mod_time, other.deleted)
    }
}

#[derive(Serialize, Deserialize)]
struct ManifestBlock {
    version: u32,
    entries: Vec<StoredEntry>,
}

#[derive(Default)]
struct State {
    loaded: bool,
    entries: FxHashMap<EntryId, StoredEntry>,
    /// Manifest blocks already folded into `entries`.
    blocks_seen: FxHashSet<BlockId>,
    dirty: bool,
}

pub struct ManifestManager {
    blocks: Arc<BlockManager>,
    state: Mutex<State>,
}

impl ManifestManager {
    pub fn new(blocks: Arc<BlockManager>) -> Self {
        Self {
            blocks,
            state: Mutex::new(State::default()),
        }
    }

    /// Add an entry. Labels must be non-empty; they're the only index.
    pub fn put(&self, ctx: &Context, labels: Labels, value: &impl serde::Serialize) -> Result<EntryId> {
        if labels.is_empty() {
            return Err(Error::invalid("labels", "at least one label is required"));
        }
        let content = serde_json::to_value(value)
            .map_err(|e| Error::invalid("manifest content", e.to_string()))?;
        self.load_if_needed(ctx)?;

        let id = EntryId::random();
        let entry = StoredEntry {
            id: id.clone(),
            labels,
            mod_time: chrono::Utc::now().timestamp(),
            deleted: false,
            content,
        };
        let mut state = self.state.lock().unwrap();
        state.entries.insert(id.clone(), entry);
        state.dirty = true;
        Ok(id)
    }

    pub fn get<T: DeserializeOwned>(&self, ctx: &Context, id: &EntryId) -> Result<T> {
        self.load_if_needed(ctx)?;
        let state = self.state.lock().unwrap();
        let entry = state
            .entries
            .get(id)
            .filter(|e| !e.deleted)
            .ok_or_else(|| Error::not_found(format!("manifest entry {id}")))?;
        serde_json::from_value(entry.content.clone())
            .map_err(|e| Error::corrupt(format!("manifest entry {id}: {e}")))
    }

    /// Every live entry whose labels are a superset of `query`,
    /// oldest modification first.
    pub fn find(&self, ctx: &Context, query: &Labels) -> Result<Vec<EntryMetadata>> {
        self.load_if_needed(ctx)?;
        let state = self.state.lock().unwrap();
        let mut found: Vec<EntryMetadata> = state
            .entries
            .values()
            .filter(|e| !e.deleted)
            .filter(|e| query.iter().all(|(k, v)| e.labels.get(k) == Some(v)))
            .map(|e| EntryMetadata {
                id: e.id.clone(),
                labels: e.labels.clone(),
                mod_time: e.mod_time,
            })
            .collect();
        found.sort_by(|a, b| (a.mod_time, &a.id).cmp(&(b.mod_time, &b.id)));
        Ok(found)
    }

    /// Tombstone an entry; a later flush persists the tombstone.
    pub fn delete(&self, ctx: &Context, id: &EntryId) -> Result<()> {
        self.load_if_needed(ctx)?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .get_mut(id)
            .filter(|e| !e.deleted)
            .ok_or_else(|| Error::not_found(format!("manifest entry {id}")))?;
        entry.deleted = true;
        entry.mod_time = chrono::Utc::now().timestamp();
        entry.content = serde_json::Value::Null;
        state.dirty = true;
        Ok(())
    }

    /// Write one consolidated manifest block holding the whole table,
    /// retire the blocks it supersedes, and flush the block layer.
    pub fn flush(&self, ctx: &Context) -> Result<()> {
        let (payload, superseded) = {
            let state = self.state.lock().unwrap();
            if !state.dirty {
                drop(state);
                return self.blocks.flush(ctx);
            }
            let mut entries: Vec<StoredEntry> = state.entries.values().cloned().collect();
            entries.sort_by(|a, b| a.id.cmp(&b.id));
            let block = ManifestBlock {
                version: MANIFEST_VERSION,
                entries,
            };
            let json = serde_json::to_vec(&block)
                .map_err(|e| Error::invalid("manifest block", e.to_string()))?;
            let superseded: Vec<BlockId> = state.blocks_seen.iter().copied().collect();
            (zstd::encode_all(json.as_slice(), 0)?, superseded)
        };

        let new_block = self.blocks.put(ctx, Prefix::Manifest, &payload)?;
        for old in &superseded {
            if *old != new_block {
                self.blocks.delete(ctx, old)?;
            }
        }
        debug!(
            "consolidated manifests into {} (supersedes {})",
            new_block.short_name(),
            superseded.len()
        );
        {
            let mut state = self.state.lock().unwrap();
            state.blocks_seen = std::iter::once(new_block).collect();
            state.dirty = false;
        }
        self.blocks.flush(ctx)
    }

    /// Fold in manifest blocks other writers have flushed.
    pub fn refresh(&self, ctx: &Context) -> Result<()> {
        self.blocks.refresh(ctx)?;
        let records = self
            .blocks
            .list_blocks(ctx, Some(Prefix::Manifest), BlockKind::All)?;

        let new_blocks: Vec<BlockId> = {
            let state = self.state.lock().unwrap();
            records
                .iter()
                .filter(|r| !r.deleted)
                .filter_map(|r| r.name.parse().ok())
                .filter(|id| !state.blocks_seen.contains(id))
                .collect()
        };
        if new_blocks.is_empty() {
            return Ok(());
        }
        debug!("loading {} manifest blocks", new_blocks.len());

        let loaded = new_blocks
            .par_iter()
            .map(|id| {
                let payload = self.blocks.get(ctx, id)?;
                let json = zstd::decode_all(payload.as_slice())?;
                let block: ManifestBlock = serde_json::from_slice(&json)
                    .map_err(|e| Error::corrupt(format!("manifest block {id}: {e}")))?;
                if block.version != MANIFEST_VERSION {
                    return Err(Error::FormatUnsupported(block.version));
                }
                Ok((*id, block.entries))
            })
            .collect::<Result<Vec<(BlockId, Vec<StoredEntry>)>>>()?;

        let mut state = self.state.lock().unwrap();
        for (id, entries) in loaded {
            state.blocks_seen.insert(id);
            for entry in entries {
                match state.entries.get(&entry.id) {
                    Some(current) if !entry.wins_over(current) => {}
                    _ => {
                        state.entries.insert(entry.id.clone(), entry);
                    }
                }
            }
        }
        Ok(())
    }

    fn load_if_needed(&self, ctx: &Context) -> Result<()> {
        if self.state.lock().unwrap().loaded {
            return Ok(());
        }
        self.refresh(ctx)?;
        self.state.lock().unwrap().loaded = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::block::BlockOptions;
    use crate::crypto::BlockCipher;
    use crate::hashing::IdHasher;
    use crate::store::memory::MemoryStore;

    fn init() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn manager_over(store: Arc<MemoryStore>) -> ManifestManager {
        ManifestManager::new(Arc::new(BlockManager::new(
            store,
            IdHasher::new(b"manifest tests"),
            BlockCipher::new(&[3u8; 32]),
            None,
            BlockOptions::default(),
        )))
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        host: String,
        files: u64,
    }

    #[test]
    fn put_get_find_round_trip() -> Result<()> {
        init();
        let ctx = Context::new();
        let mm = manager_over(Arc::new(MemoryStore::new()));

        let doc = Doc {
            host: "europa".into(),
            files: 42,
        };
        let id = mm.put(&ctx, labels(&[("type", "snapshot"), ("host", "europa")]), &doc)?;
        mm.put(
            &ctx,
            labels(&[("type", "snapshot"), ("host", "io")]),
            &Doc {
                host: "io".into(),
                files: 7,
            },
        )?;

        assert_eq!(mm.get::<Doc>(&ctx, &id)?, doc);

        // Superset query: all snapshots, then narrowed by host.
        assert_eq!(mm.find(&ctx, &labels(&[("type", "snapshot")]))?.len(), 2);
        let found = mm.find(&ctx, &labels(&[("host", "europa")]))?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
        assert!(mm.find(&ctx, &labels(&[("host", "ganymede")]))?.is_empty());

        // Labels are mandatory.
        assert!(mm.put(&ctx, Labels::new(), &doc).is_err());
        Ok(())
    }

    #[test]
    fn entries_survive_flush_and_reload() -> Result<()> {
        init();
        let ctx = Context::new();
        let store = Arc::new(MemoryStore::new());

        let mm = manager_over(store.clone());
        let id = mm.put(
            &ctx,
            labels(&[("type", "snapshot")]),
            &Doc {
                host: "europa".into(),
                files: 1,
            },
        )?;
        mm.flush(&ctx)?;

        let fresh = manager_over(store);
        assert_eq!(
            fresh.get::<Doc>(&ctx, &id)?,
            Doc {
                host: "europa".into(),
                files: 1
            }
        );
        Ok(())
    }

    #[test]
    fn delete_tombstones_an_entry() -> Result<()> {
        init();
        let ctx = Context::new();
        let store = Arc::new(MemoryStore::new());
        let mm = manager_over(store.clone());

        let id = mm.put(
            &ctx,
            labels(&[("type", "snapshot")]),
            &Doc {
                host: "europa".into(),
                files: 1,
            },
        )?;
        mm.flush(&ctx)?;
        mm.delete(&ctx, &id)?;
        assert!(matches!(mm.delete(&ctx, &id), Err(Error::NotFound(_))));
        mm.flush(&ctx)?;

        assert!(matches!(
            mm.get::<Doc>(&ctx, &id),
            Err(Error::NotFound(_))
        ));
        // The tombstone propagates to fresh readers too.
        let fresh = manager_over(store);
        assert!(matches!(
            fresh.get::<Doc>(&ctx, &id),
            Err(Error::NotFound(_))
        ));
        assert!(fresh.find(&ctx, &labels(&[("type", "snapshot")]))?.is_empty());
        Ok(())
    }

    #[test]
    fn consolidation_retires_old_blocks() -> Result<()> {
        init();
        let ctx = Context::new();
        let store = Arc::new(MemoryStore::new());
        let mm = manager_over(store.clone());

        mm.put(
            &ctx,
            labels(&[("type", "a")]),
            &Doc {
                host: "one".into(),
                files: 1,
            },
        )?;
        mm.flush(&ctx)?;
        mm.put(
            &ctx,
            labels(&[("type", "b")]),
            &Doc {
                host: "two".into(),
                files: 2,
            },
        )?;
        mm.flush(&ctx)?;

        // After the second flush exactly one manifest block is alive;
        // the first consolidated block is tombstoned.
        let fresh = manager_over(store);
        // The empty query is a superset match for everything.
        assert_eq!(fresh.find(&ctx, &Labels::new())?.len(), 2);
        assert_eq!(fresh.find(&ctx, &labels(&[("type", "a")]))?.len(), 1);
        assert_eq!(fresh.find(&ctx, &labels(&[("type", "b")]))?.len(), 1);

        let alive = fresh
            .blocks
            .list_blocks(&ctx, Some(Prefix::Manifest), BlockKind::All)?
            .into_iter()
            .filter(|r| !r.deleted)
            .count();
        assert_eq!(alive, 1);
        Ok(())
    }

    #[test]
    fn divergent_writers_merge_by_union() -> Result<()> {
        init();
        let ctx = Context::new();
        let store = Arc::new(MemoryStore::new());

        let a = manager_over(store.clone());
        let b = manager_over(store.clone());

        let from_a = a.put(
            &ctx,
            labels(&[("type", "snapshot"), ("host", "a")]),
            &Doc {
                host: "a".into(),
                files: 1,
            },
        )?;
        let from_b = b.put(
            &ctx,
            labels(&[("type", "snapshot"), ("host", "b")]),
            &Doc {
                host: "b".into(),
                files: 2,
            },
        )?;
        a.flush(&ctx)?;
        b.flush(&ctx)?;

        let reader = manager_over(store);
        let all = reader.find(&ctx, &labels(&[("type", "snapshot")]))?;
        assert_eq!(all.len(), 2);
        assert!(reader.get::<Doc>(&ctx, &from_a).is_ok());
        assert!(reader.get::<Doc>(&ctx, &from_b).is_ok());
        Ok(())
    }
}
