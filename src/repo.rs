//! The repository handle: create, connect, use, close.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::info;

use crate::block::{BlockManager, BlockOptions};
use crate::cache::{self, DiskCache};
use crate::chunker::SplitterParams;
use crate::crypto::BlockCipher;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::format::{
    Envelope, FormatDocument, REPOSITORY_BLOB, RepoConfig, open_envelope, seal_envelope,
};
use crate::hashing::IdHasher;
use crate::manifest::ManifestManager;
use crate::object::ObjectManager;
use crate::store::{self, BlobStore, Retrying, Semaphored};

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub splitter: SplitterParams,
    pub max_pack_size: u64,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            splitter: SplitterParams::default(),
            max_pack_size: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Local cache directory; no disk cache when absent.
    pub cache_dir: Option<Utf8PathBuf>,
    pub max_cache_bytes: u64,
    pub list_cache_ttl: Duration,
    /// Permits on the store semaphore.
    pub store_concurrency: u32,
    pub flush_workers: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_cache_bytes: cache::DEFAULT_MAX_BYTES,
            list_cache_ttl: Duration::from_secs(30),
            store_concurrency: 50,
            flush_workers: 4,
        }
    }
}

/// A connected repository: the block, object, and manifest managers over
/// one store, sharing one format document.
pub struct Repository {
    unique_id: String,
    format: FormatDocument,
    blocks: Arc<BlockManager>,
    objects: ObjectManager,
    manifests: ManifestManager,
}

/// Initialize a repository on a store: generate keys, seal them under the
/// password, and write the bootstrap blob.
///
/// Fails with [`Error::AlreadyExists`] if the store already hosts one.
pub fn create(
    ctx: &Context,
    store: &dyn BlobStore,
    password: &str,
    opts: CreateOptions,
) -> Result<()> {
    match store.get(ctx, REPOSITORY_BLOB, 0, None) {
        Ok(_) => return Err(Error::AlreadyExists("a repository here".to_string())),
        Err(Error::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    let doc = FormatDocument::generate(opts.splitter, opts.max_pack_size);
    doc.validate()?;
    let envelope = seal_envelope(&doc, password)?;
    let json = serde_json::to_vec_pretty(&envelope).expect("envelope serializes");
    store.put(ctx, REPOSITORY_BLOB, &json)?;
    info!("created repository {}", envelope.unique_id);
    Ok(())
}

/// Connect to an existing repository.
pub fn connect(
    ctx: &Context,
    store: Arc<dyn BlobStore>,
    password: &str,
    opts: ConnectOptions,
) -> Result<Repository> {
    connect_inner(ctx, store, None, password, opts)
}

/// Connect from a saved config file: reopen the store it names and reuse
/// its cached envelope so only the password is needed.
pub fn connect_with_config(
    ctx: &Context,
    config: &RepoConfig,
    password: &str,
) -> Result<Repository> {
    let store = store::open(&config.store)?;
    let opts = ConnectOptions {
        cache_dir: config.cache_dir.clone(),
        max_cache_bytes: config.max_cache_bytes,
        ..ConnectOptions::default()
    };
    connect_inner(ctx, store, config.envelope.clone(), password, opts)
}

fn connect_inner(
    ctx: &Context,
    store: Arc<dyn BlobStore>,
    envelope: Option<Envelope>,
    password: &str,
    opts: ConnectOptions,
) -> Result<Repository> {
    let envelope = match envelope {
        Some(e) => e,
        None => {
            let bytes = store.get(ctx, REPOSITORY_BLOB, 0, None)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::corrupt(format!("bootstrap blob: {e}")))?
        }
    };
    let format = open_envelope(&envelope, password)?;
    info!("connected to repository {}", envelope.unique_id);

    // Every store round trip goes through the same discipline:
    // bounded concurrency inside, retries outside.
    let store: Arc<dyn BlobStore> = Arc::new(Retrying::new(Semaphored::new(
        store,
        opts.store_concurrency,
    )));

    let cache = opts
        .cache_dir
        .as_ref()
        // Per-repository subdirectory, so one cache dir serves many repos.
        .map(|dir| DiskCache::open(dir.join(&envelope.unique_id), opts.max_cache_bytes))
        .transpose()?;

    let blocks = Arc::new(BlockManager::new(
        store,
        IdHasher::new(&format.hmac_secret),
        BlockCipher::new(&format.encryption_key_array()?),
        cache,
        BlockOptions {
            max_pack_size: format.max_pack_size,
            list_cache_ttl: opts.list_cache_ttl,
            flush_workers: opts.flush_workers,
        },
    ));
    let objects = ObjectManager::new(blocks.clone(), format.splitter);
    let manifests = ManifestManager::new(blocks.clone());

    Ok(Repository {
        unique_id: envelope.unique_id,
        format,
        blocks,
        objects,
        manifests,
    })
}

impl Repository {
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn format(&self) -> &FormatDocument {
        &self.format
    }

    pub fn blocks(&self) -> &Arc<BlockManager> {
        &self.blocks
    }

    pub fn objects(&self) -> &ObjectManager {
        &self.objects
    }

    pub fn manifests(&self) -> &ManifestManager {
        &self.manifests
    }

    /// Persist everything staged: manifests first (they write blocks),
    /// then the block layer.
    pub fn flush(&self, ctx: &Context) -> Result<()> {
        self.manifests.flush(ctx)
    }

    /// Pull in other writers' commits.
    pub fn refresh(&self, ctx: &Context) -> Result<()> {
        self.manifests.refresh(ctx)
    }

    /// Flush and shut down. A cancelled context surfaces the cancellation
    /// instead of flushing.
    pub fn close(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        self.manifests.flush(ctx)?;
        self.blocks.close(ctx)
    }
}
