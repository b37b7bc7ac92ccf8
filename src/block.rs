//! The block manager: stages small encrypted blocks into packs, flushes
//! packs (and the index blobs describing them) to the store, and answers
//! reads from staging, the committed index, and the pack cache.
//!
//! Write path: a put seals the payload under its id-derived nonce and
//! appends it to the pending pack. When the pending pack reaches the size
//! target it is swapped for a fresh one and handed to a bounded pool of
//! flush workers over a channel; the foreground never does I/O while holding
//! the manager lock. A flush worker uploads the pack blob first and its
//! index blob second, so a crash can orphan a pack (harmless, unreferenced)
//! but can never commit an index that points at missing bytes.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use crate::cache::DiskCache;
use crate::crypto::BlockCipher;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::hashing::{BlockId, IdHasher, Prefix, content_hash_hex};
use crate::index::{
    self, BlockKind, BlockRecord, CommittedIndex, INDEX_BLOB_PREFIX, IndexBlob, IndexEntry,
    Location, PackId, name_matches_prefix,
};
use crate::store::BlobStore;

#[derive(Debug, Clone)]
pub struct BlockOptions {
    /// Seal the pending pack once it holds this many bytes of ciphertext.
    pub max_pack_size: u64,
    /// How long a cached store listing satisfies refreshes.
    pub list_cache_ttl: Duration,
    /// Background flush worker count.
    pub flush_workers: usize,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            max_pack_size: 20 * 1024 * 1024,
            list_cache_ttl: Duration::from_secs(30),
            flush_workers: 4,
        }
    }
}

pub struct BlockManager {
    shared: Arc<Shared>,
    job_tx: Mutex<Option<SyncSender<Arc<SealedPack>>>>,
    done_rx: Mutex<Receiver<Outcome>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    store: Arc<dyn BlobStore>,
    hasher: IdHasher,
    cipher: BlockCipher,
    cache: Option<DiskCache>,
    opts: BlockOptions,
    /// Drives worker I/O; cancelled when the manager shuts down.
    bg: Context,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pending: PendingPack,
    /// Sealed but not yet handed to a worker (or handed back after a failure).
    sealed: VecDeque<Arc<SealedPack>>,
    /// Handed to a worker; removed when its outcome is recorded.
    inflight: FxHashMap<PackId, Arc<SealedPack>>,
    committed: CommittedIndex,
    /// Index blobs already folded into `committed`.
    ingested: FxHashSet<String>,
}

/// The pack currently accepting writes: concatenated ciphertexts plus the
/// records that will become its index blob.
struct PendingPack {
    id: PackId,
    buf: Vec<u8>,
    entries: Vec<IndexEntry>,
    by_id: FxHashMap<BlockId, usize>,
}

impl Default for PendingPack {
    fn default() -> Self {
        Self {
            id: PackId::random(),
            buf: Vec::new(),
            entries: Vec::new(),
            by_id: FxHashMap::default(),
        }
    }
}

impl PendingPack {
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn append(&mut self, id: BlockId, timestamp: i64, ciphertext: &[u8]) {
        let entry = IndexEntry {
            id,
            timestamp,
            location: Location::Packed {
                pack: self.id,
                offset: self.buf.len() as u64,
                length: ciphertext.len() as u64,
            },
        };
        self.buf.extend_from_slice(ciphertext);
        self.push(entry);
    }

    fn append_standalone(&mut self, id: BlockId, timestamp: i64, length: u64) {
        self.push(IndexEntry {
            id,
            timestamp,
            location: Location::Standalone { length },
        });
    }

    fn append_tombstone(&mut self, id: BlockId, timestamp: i64) {
        self.push(IndexEntry {
            id,
            timestamp,
            location: Location::Deleted,
        });
    }

    fn push(&mut self, entry: IndexEntry) {
        self.by_id.insert(entry.id, self.entries.len());
        self.entries.push(entry);
    }
}

/// An immutable, flush-ready pack. Shared between the staging maps (for
/// reads) and the worker uploading it.
struct SealedPack {
    id: PackId,
    buf: Vec<u8>,
    entries: Vec<IndexEntry>,
    by_id: FxHashMap<BlockId, usize>,
}

struct Outcome {
    pack: Arc<SealedPack>,
    /// The index blob name on success.
    result: Result<String>,
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl BlockManager {
    pub fn new(
        store: Arc<dyn BlobStore>,
        hasher: IdHasher,
        cipher: BlockCipher,
        cache: Option<DiskCache>,
        opts: BlockOptions,
    ) -> Self {
        assert!(opts.max_pack_size > 0);
        assert!(opts.flush_workers > 0);

        let shared = Arc::new(Shared {
            store,
            hasher,
            cipher,
            cache,
            opts,
            bg: Context::new(),
            state: Mutex::new(State::default()),
        });

        let (job_tx, job_rx) = sync_channel::<Arc<SealedPack>>(shared.opts.flush_workers * 2);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let workers = (0..shared.opts.flush_workers)
            .map(|i| {
                let shared = shared.clone();
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                std::thread::Builder::new()
                    .name(format!("cairn-flush-{i}"))
                    .spawn(move || {
                        loop {
                            let job = job_rx.lock().unwrap().recv();
                            let Ok(pack) = job else { break };
                            let result = shared.upload_sealed(&pack);
                            if done_tx.send(Outcome { pack, result }).is_err() {
                                break;
                            }
                        }
                    })
                    .expect("couldn't spawn flush worker")
            })
            .collect();

        Self {
            shared,
            job_tx: Mutex::new(Some(job_tx)),
            done_rx: Mutex::new(done_rx),
            workers: Mutex::new(workers),
        }
    }

    /// Store a payload, returning its deterministic id.
    ///
    /// Idempotent: if the effective index or staging already shows the id
    /// alive, nothing is written.
    pub fn put(&self, ctx: &Context, prefix: Prefix, payload: &[u8]) -> Result<BlockId> {
        ctx.check()?;
        let id = self.shared.hasher.id(prefix, payload);

        if self.shared.state.lock().unwrap().is_alive(&id) {
            trace!("{} already present, skipping", id.short_name());
            return Ok(id);
        }

        let ciphertext = self.shared.cipher.seal_block(&id, payload)?;
        if ciphertext.len() as u64 > self.shared.opts.max_pack_size {
            return self.put_standalone(ctx, id, &ciphertext);
        }

        let now = unix_now();
        let overflowed = {
            let mut state = self.shared.state.lock().unwrap();
            // Somebody else may have staged it while we were encrypting.
            if state.is_alive(&id) {
                return Ok(id);
            }
            let timestamp = state.put_timestamp(&id, now);
            state.pending.append(id, timestamp, &ciphertext);
            trace!(
                "staged {} ({} bytes) in pack {}",
                id.short_name(),
                ciphertext.len(),
                state.pending.id,
            );
            if state.pending.buf.len() as u64 >= self.shared.opts.max_pack_size {
                state.seal_pending();
                true
            } else {
                false
            }
        };
        if overflowed {
            self.submit_sealed()?;
        }
        Ok(id)
    }

    /// A payload too large to share a pack becomes its own blob,
    /// named by its block id; only the index record waits for the next flush.
    fn put_standalone(&self, ctx: &Context, id: BlockId, ciphertext: &[u8]) -> Result<BlockId> {
        debug!(
            "block {} ({} bytes) exceeds the pack budget, storing standalone",
            id.short_name(),
            ciphertext.len()
        );
        self.shared.store.put(ctx, &id.to_string(), ciphertext)?;
        let now = unix_now();
        let mut state = self.shared.state.lock().unwrap();
        if !state.is_alive(&id) {
            let timestamp = state.put_timestamp(&id, now);
            state
                .pending
                .append_standalone(id, timestamp, ciphertext.len() as u64);
        }
        Ok(id)
    }

    /// Read a block back, verifying it on the way out.
    pub fn get(&self, ctx: &Context, id: &BlockId) -> Result<Vec<u8>> {
        ctx.check()?;

        enum Found {
            /// Ciphertext copied straight out of a staged pack buffer.
            Staged(Vec<u8>),
            /// Committed (or staged standalone): fetch by index entry.
            Fetch(IndexEntry),
        }

        let found = {
            let state = self.shared.state.lock().unwrap();
            match state.staged_ciphertext(id) {
                Some((entry, _)) if entry.is_deleted() => {
                    return Err(Error::not_found(format!("block {id}")));
                }
                Some((_, Some(ciphertext))) => Found::Staged(ciphertext),
                Some((entry, None)) => Found::Fetch(entry),
                None => match state.committed.get(id) {
                    Some(entry) if entry.is_deleted() => {
                        return Err(Error::not_found(format!("block {id}")));
                    }
                    Some(entry) => Found::Fetch(*entry),
                    None => return Err(Error::not_found(format!("block {id}"))),
                },
            }
        };

        let ciphertext = match found {
            Found::Staged(bytes) => bytes,
            Found::Fetch(entry) => self.shared.fetch_ciphertext(ctx, &entry)?,
        };
        let payload = self.shared.cipher.open_block(id, &ciphertext)?;
        self.shared.hasher.verify(id, &payload)?;
        Ok(payload)
    }

    /// Record a tombstone; subsequent gets return [`Error::NotFound`].
    ///
    /// The tombstone rides along with the next flush, like any other record.
    pub fn delete(&self, ctx: &Context, id: &BlockId) -> Result<()> {
        ctx.check()?;
        let now = unix_now();
        let mut state = self.shared.state.lock().unwrap();
        // At an equal timestamp the tombstone wins, so `max` suffices even
        // when the live record was written this very second.
        let timestamp = match state.visible(id) {
            Some(prev) => now.max(prev.timestamp),
            None => now,
        };
        state.pending.append_tombstone(*id, timestamp);
        debug!("tombstoned {}", id.short_name());
        Ok(())
    }

    /// Seal the pending pack and drive every sealed pack to durability.
    ///
    /// On failure the affected packs stay sealed in memory and the next
    /// flush retries them; nothing is ever silently dropped. With nothing
    /// staged this is a no-op that touches no storage.
    pub fn flush(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        self.shared.state.lock().unwrap().seal_pending();
        self.submit_sealed()?;

        let done_rx = self.done_rx.lock().unwrap();
        let mut first_error = None;
        loop {
            if self.shared.state.lock().unwrap().inflight.is_empty() {
                break;
            }
            // Give up waiting if cancelled; the workers keep going in the
            // background and a later flush gathers their outcomes.
            ctx.check()?;
            match done_rx.recv_timeout(Duration::from_millis(25)) {
                Ok(outcome) => self.record_outcome(outcome, &mut first_error),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::unavailable("flush workers exited"));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if !self.shared.state.lock().unwrap().sealed.is_empty() {
            // A concurrent flush recorded a failure and parked the pack.
            return Err(Error::unavailable("a sealed pack awaits retry"));
        }
        Ok(())
    }

    fn record_outcome(&self, outcome: Outcome, first_error: &mut Option<Error>) {
        let mut state = self.shared.state.lock().unwrap();
        state.inflight.remove(&outcome.pack.id);
        match outcome.result {
            Ok(index_name) => {
                debug!(
                    "pack {} committed under index blob {}",
                    outcome.pack.id, index_name
                );
                for entry in &outcome.pack.entries {
                    state.committed.apply(*entry);
                }
                state.ingested.insert(index_name);
                // The cached listing predates this commit; make the next
                // refresh (ours or a cache-sharing sibling's) really list.
                if let Some(cache) = &self.shared.cache {
                    cache.drop_listing();
                }
            }
            Err(e) => {
                warn!("flushing pack {} failed: {e}", outcome.pack.id);
                state.sealed.push_back(outcome.pack.clone());
                if first_error.is_none() {
                    *first_error = Some(e);
                }
            }
        }
    }

    /// Hand every sealed pack to the worker pool.
    fn submit_sealed(&self) -> Result<()> {
        loop {
            let pack = {
                let mut state = self.shared.state.lock().unwrap();
                let Some(pack) = state.sealed.pop_front() else {
                    return Ok(());
                };
                state.inflight.insert(pack.id, pack.clone());
                pack
            };
            let sent = {
                let tx = self.job_tx.lock().unwrap();
                match tx.as_ref() {
                    Some(tx) => tx.send(pack.clone()).is_ok(),
                    None => false,
                }
            };
            if !sent {
                let mut state = self.shared.state.lock().unwrap();
                state.inflight.remove(&pack.id);
                state.sealed.push_front(pack);
                return Err(Error::unavailable("block manager is shut down"));
            }
        }
    }

    /// Pull new index blobs from the store into the committed view.
    /// Returns whether anything changed.
    pub fn refresh(&self, ctx: &Context) -> Result<bool> {
        ctx.check()?;
        let listing = self.shared.list_index_blobs(ctx)?;
        let new_names: Vec<String> = {
            let state = self.shared.state.lock().unwrap();
            listing
                .iter()
                .filter(|meta| !state.ingested.contains(&meta.name))
                .map(|meta| meta.name.clone())
                .collect()
        };
        if new_names.is_empty() {
            return Ok(false);
        }
        debug!("refresh: ingesting {} new index blobs", new_names.len());

        let loaded = new_names
            .par_iter()
            .map(|name| Ok((name.clone(), self.shared.load_index_blob(ctx, name)?)))
            .collect::<Result<Vec<(String, IndexBlob)>>>()?;

        let mut changed = false;
        let mut state = self.shared.state.lock().unwrap();
        for (name, blob) in loaded {
            if !state.ingested.insert(name) {
                continue;
            }
            for entry in blob.entries {
                changed |= state.committed.apply(entry);
            }
        }
        Ok(changed)
    }

    /// Enumerate blocks by namespace prefix and kind.
    pub fn list_blocks(
        &self,
        ctx: &Context,
        prefix: Option<Prefix>,
        kind: BlockKind,
    ) -> Result<Vec<BlockRecord>> {
        ctx.check()?;
        let mut records = Vec::new();

        // Pack blobs aren't blocks; they only show up when no block-id
        // prefix narrows the listing.
        if prefix.is_none() && matches!(kind, BlockKind::Packs | BlockKind::All) {
            let state = self.shared.state.lock().unwrap();
            records.extend(state.committed.packs().map(|(pack, length)| BlockRecord {
                name: pack.to_name(),
                length: *length,
                timestamp: 0,
                deleted: false,
                pack: None,
            }));
        }

        if matches!(
            kind,
            BlockKind::Packed | BlockKind::Nonpacked | BlockKind::All
        ) {
            let state = self.shared.state.lock().unwrap();
            for entry in state.effective_entries().values() {
                let wanted = match (kind, entry.location) {
                    (BlockKind::Packed, Location::Packed { .. }) => true,
                    (BlockKind::Nonpacked, Location::Standalone { .. }) => true,
                    (BlockKind::All, _) => true,
                    _ => false,
                };
                if wanted && name_matches_prefix(&entry.id.to_string(), prefix) {
                    records.push(BlockRecord::from_entry(entry));
                }
            }
        }

        if matches!(kind, BlockKind::Physical | BlockKind::All) {
            let listed = self
                .shared
                .store
                .list(ctx, prefix.map(|p| p.as_str()).unwrap_or(""))?;
            records.extend(
                listed
                    .into_iter()
                    .filter(|meta| name_matches_prefix(&meta.name, prefix))
                    .map(|meta| BlockRecord {
                        name: meta.name,
                        length: meta.length,
                        timestamp: meta.timestamp,
                        deleted: false,
                        pack: None,
                    }),
            );
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        records.dedup_by(|a, b| a.name == b.name);
        Ok(records)
    }

    /// Flush, stop the workers, and close the store.
    ///
    /// If the context is already cancelled, surfaces the cancellation
    /// without flushing; staged state is simply dropped (the store never
    /// saw it, so invariants hold).
    pub fn close(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        self.flush(ctx)?;
        self.shutdown();
        self.shared.store.close()
    }

    fn shutdown(&self) {
        *self.job_tx.lock().unwrap() = None;
        self.shared.bg.cancel();
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for BlockManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Upload one sealed pack: the pack blob first, then the index blob
    /// describing it. An interruption between the two leaves an orphaned
    /// pack that nothing references; the reverse order could commit an
    /// index pointing at missing bytes, so it is never used.
    fn upload_sealed(&self, pack: &SealedPack) -> Result<String> {
        let ctx = &self.bg;
        if !pack.buf.is_empty() {
            self.store.put(ctx, &pack.id.to_name(), &pack.buf)?;
        }
        let blob = IndexBlob {
            pack: (!pack.buf.is_empty()).then_some(pack.id),
            entries: pack.entries.clone(),
        };
        let plain = index::encode(&blob);
        let compressed = zstd::encode_all(plain.as_slice(), 0)?;
        let sealed = self.cipher.seal(&compressed)?;
        let name = format!("{}{}", INDEX_BLOB_PREFIX, content_hash_hex(&sealed));
        self.store.put(ctx, &name, &sealed)?;
        if let Some(cache) = &self.cache {
            cache.put_index(&name, &sealed);
        }
        Ok(name)
    }

    /// Pull a committed (or standalone) block's ciphertext, going through
    /// the pack cache for packed blocks.
    fn fetch_ciphertext(&self, ctx: &Context, entry: &IndexEntry) -> Result<Vec<u8>> {
        match entry.location {
            Location::Packed {
                pack,
                offset,
                length,
            } => {
                let name = pack.to_name();
                let pack_len = {
                    let state = self.state.lock().unwrap();
                    state.committed.pack_len(&pack).unwrap_or(offset + length)
                };
                let bytes = match self
                    .cache
                    .as_ref()
                    .and_then(|cache| cache.get_pack(&name, pack_len))
                {
                    Some(bytes) => bytes,
                    None => {
                        let bytes = self.store.get(ctx, &name, 0, None)?;
                        if let Some(cache) = &self.cache {
                            cache.put_pack(&name, &bytes);
                        }
                        bytes
                    }
                };
                let (start, end) = (offset as usize, (offset + length) as usize);
                if bytes.len() < end {
                    return Err(Error::corrupt(format!(
                        "index entry for {} points outside pack {name} ({} < {end})",
                        entry.id,
                        bytes.len()
                    )));
                }
                Ok(bytes[start..end].to_vec())
            }
            Location::Standalone { length } => {
                let name = entry.id.to_string();
                let bytes = self.store.get(ctx, &name, 0, None)?;
                if bytes.len() as u64 != length {
                    return Err(Error::corrupt(format!(
                        "standalone blob {name} is {} bytes, index says {length}",
                        bytes.len()
                    )));
                }
                Ok(bytes)
            }
            Location::Deleted => Err(Error::not_found(format!("block {}", entry.id))),
        }
    }

    fn list_index_blobs(&self, ctx: &Context) -> Result<Vec<crate::store::BlobMeta>> {
        if let Some(cache) = &self.cache {
            if let Some(listing) = cache.load_listing(self.opts.list_cache_ttl) {
                return Ok(listing);
            }
        }
        let listing = self.store.list(ctx, INDEX_BLOB_PREFIX)?;
        if let Some(cache) = &self.cache {
            cache.store_listing(&listing);
        }
        Ok(listing)
    }

    fn load_index_blob(&self, ctx: &Context, name: &str) -> Result<IndexBlob> {
        let sealed = match self.cache.as_ref().and_then(|cache| cache.get_index(name)) {
            Some(bytes) => bytes,
            None => {
                let bytes = self.store.get(ctx, name, 0, None)?;
                if let Some(cache) = &self.cache {
                    cache.put_index(name, &bytes);
                }
                bytes
            }
        };
        let compressed = self.cipher.open(&sealed)?;
        let plain = zstd::decode_all(compressed.as_slice())?;
        index::decode(&plain)
    }
}

impl State {
    fn seal_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let full = std::mem::take(&mut self.pending);
        debug!(
            "sealed pack {} ({} bytes, {} entries)",
            full.id,
            full.buf.len(),
            full.entries.len()
        );
        self.sealed.push_back(Arc::new(SealedPack {
            id: full.id,
            buf: full.buf,
            entries: full.entries,
            by_id: full.by_id,
        }));
    }

    /// The staged record for `id`, if any, picking the winner when several
    /// staged packs mention it. The ciphertext comes along when the bytes
    /// are in a staged buffer (i.e., not a standalone or tombstone record).
    fn staged_ciphertext(&self, id: &BlockId) -> Option<(IndexEntry, Option<Vec<u8>>)> {
        fn consider<'a>(
            best: &mut Option<(IndexEntry, Option<&'a [u8]>)>,
            entry: &IndexEntry,
            buf: Option<&'a [u8]>,
        ) {
            if best.is_none() || entry.supersedes(&best.as_ref().unwrap().0) {
                *best = Some((*entry, buf));
            }
        }
        let mut best: Option<(IndexEntry, Option<&[u8]>)> = None;
        if let Some(&i) = self.pending.by_id.get(id) {
            consider(&mut best, &self.pending.entries[i], Some(&self.pending.buf));
        }
        for pack in self.sealed.iter().chain(self.inflight.values()) {
            if let Some(&i) = pack.by_id.get(id) {
                consider(&mut best, &pack.entries[i], Some(&pack.buf));
            }
        }
        let (entry, buf) = best?;
        let ciphertext = match entry.location {
            Location::Packed { offset, length, .. } => {
                buf.map(|b| b[offset as usize..(offset + length) as usize].to_vec())
            }
            _ => None,
        };
        Some((entry, ciphertext))
    }

    /// The record a reader in this process would see: staging wins over
    /// the committed view.
    fn visible(&self, id: &BlockId) -> Option<IndexEntry> {
        self.staged_ciphertext(id)
            .map(|(entry, _)| entry)
            .or_else(|| self.committed.get(id).copied())
    }

    fn is_alive(&self, id: &BlockId) -> bool {
        self.visible(id).is_some_and(|e| !e.is_deleted())
    }

    /// A re-add in the same second as a tombstone must outrank it.
    fn put_timestamp(&self, id: &BlockId, now: i64) -> i64 {
        match self.visible(id) {
            Some(prev) if prev.is_deleted() && prev.timestamp >= now => prev.timestamp + 1,
            _ => now,
        }
    }

    /// Committed entries overlaid with staging: what listing sees.
    fn effective_entries(&self) -> FxHashMap<BlockId, IndexEntry> {
        let mut view: FxHashMap<BlockId, IndexEntry> =
            self.committed.iter().map(|e| (e.id, *e)).collect();
        let staged = self
            .pending
            .entries
            .iter()
            .chain(self.sealed.iter().flat_map(|p| p.entries.iter()))
            .chain(self.inflight.values().flat_map(|p| p.entries.iter()));
        for entry in staged {
            match view.get(&entry.id) {
                Some(current) if !entry.supersedes(current) => {}
                _ => {
                    view.insert(entry.id, *entry);
                }
            }
        }
        view
    }
}
