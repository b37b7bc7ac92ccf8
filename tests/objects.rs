//! Object-layer scenarios: large streams, content-defined splitting, seeks.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use cairn::block::{BlockManager, BlockOptions};
use cairn::chunker::{SplitterMode, SplitterParams};
use cairn::crypto::BlockCipher;
use cairn::hashing::IdHasher;
use cairn::object::{ObjectId, ObjectManager};
use cairn::store::BlobStore;
use cairn::store::memory::MemoryStore;
use cairn::{Context, Prefix, Result};

use rand::{RngCore, SeedableRng, rngs::StdRng};

fn object_manager(store: Arc<MemoryStore>, splitter: SplitterParams) -> ObjectManager {
    let blocks = Arc::new(BlockManager::new(
        store,
        IdHasher::new(b"object integration"),
        BlockCipher::new(&[2u8; 32]),
        None,
        BlockOptions::default(),
    ));
    ObjectManager::new(blocks, splitter)
}

fn pseudorandom(len: usize, seed: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut bytes);
    bytes
}

/// A multi-megabyte stream through the dynamic splitter reads back
/// byte-identical, including after seeks to arbitrary offsets.
#[test]
fn dynamic_streams_round_trip_with_seeks() -> Result<()> {
    let splitter = SplitterParams {
        mode: SplitterMode::Dynamic,
        min_size: 64 * 1024,
        avg_size: 256 * 1024,
        max_size: 1024 * 1024,
    };
    let ctx = Context::new();
    let om = object_manager(Arc::new(MemoryStore::new()), splitter);

    let data = pseudorandom(12 * 1024 * 1024, 11);
    let id = om.write(&ctx, data.as_slice())?;
    assert!(matches!(id, ObjectId::Indirect(_)));
    om.flush(&ctx)?;

    let mut reader = om.open(&ctx, id)?;
    assert_eq!(reader.len(), data.len() as u64);

    let mut out = Vec::with_capacity(data.len());
    reader.read_to_end(&mut out)?;
    assert_eq!(out, data);

    // Seek into the middle and spot-check a window.
    reader.seek(SeekFrom::Start(7_000_000))?;
    let mut window = [0u8; 1024];
    reader.read_exact(&mut window)?;
    assert_eq!(&window[..], &data[7_000_000..7_000_000 + 1024]);

    // And near the end via SeekFrom::End.
    reader.seek(SeekFrom::End(-100))?;
    let mut tail = Vec::new();
    reader.read_to_end(&mut tail)?;
    assert_eq!(tail, data[data.len() - 100..]);
    Ok(())
}

/// Writing the same stream twice produces the same object id and stores
/// each chunk once: dedup works through the object layer.
#[test]
fn identical_streams_dedup() -> Result<()> {
    let ctx = Context::new();
    let store = Arc::new(MemoryStore::new());
    let om = object_manager(store.clone(), SplitterParams::default());

    let data = pseudorandom(4 * 1024 * 1024, 12);
    let first = om.write(&ctx, data.as_slice())?;
    om.flush(&ctx)?;
    let writes = store.put_count();

    let second = om.write(&ctx, data.as_slice())?;
    om.flush(&ctx)?;
    assert_eq!(first, second);
    assert_eq!(store.put_count(), writes, "the rewrite stored nothing new");
    Ok(())
}

/// Appending to a stream only adds blocks near the tail: the shared
/// prefix re-chunks to the same blocks.
#[test]
fn appends_reuse_the_shared_prefix() -> Result<()> {
    let splitter = SplitterParams {
        mode: SplitterMode::Dynamic,
        min_size: 16 * 1024,
        avg_size: 64 * 1024,
        max_size: 256 * 1024,
    };
    let ctx = Context::new();
    let store = Arc::new(MemoryStore::new());
    let om = object_manager(store.clone(), splitter);

    let base = pseudorandom(6 * 1024 * 1024, 13);
    om.write(&ctx, base.as_slice())?;
    om.flush(&ctx)?;
    let baseline_packed = store
        .list(&ctx, "p")?
        .iter()
        .map(|b| b.length)
        .sum::<u64>();

    let mut appended = base.clone();
    appended.extend_from_slice(&pseudorandom(256 * 1024, 14));
    om.write(&ctx, appended.as_slice())?;
    om.flush(&ctx)?;
    let grown_packed = store
        .list(&ctx, "p")?
        .iter()
        .map(|b| b.length)
        .sum::<u64>();

    let growth = grown_packed - baseline_packed;
    assert!(
        growth < 2 * 1024 * 1024,
        "appending 256 KiB grew packs by {growth} bytes; prefix blocks were not reused"
    );
    Ok(())
}

/// Object ids survive the string form, so they can live in manifests.
#[test]
fn object_ids_round_trip_as_strings() -> Result<()> {
    let ctx = Context::new();
    let om = object_manager(Arc::new(MemoryStore::new()), SplitterParams::fixed(1024));

    let small = om.write(&ctx, &b"one block"[..])?;
    let big = om.write(&ctx, pseudorandom(64 * 1024, 15).as_slice())?;

    for id in [small, big] {
        let parsed: ObjectId = id.to_string().parse()?;
        assert_eq!(parsed, id);
        let mut reader = om.open(&ctx, parsed)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        assert_eq!(out.len() as u64, reader.len());
    }
    Ok(())
}

/// The object layer rides on block identity: a chunk shared between two
/// different streams is stored once.
#[test]
fn chunks_shared_across_objects_are_stored_once() -> Result<()> {
    let ctx = Context::new();
    let store = Arc::new(MemoryStore::new());
    let om = object_manager(store.clone(), SplitterParams::fixed(4096));

    let shared = pseudorandom(4096, 16);

    // Two objects, both a sequence of the same chunk.
    let mut first = Vec::new();
    for _ in 0..8 {
        first.extend_from_slice(&shared);
    }
    om.write(&ctx, first.as_slice())?;
    let mut second = Vec::new();
    for _ in 0..16 {
        second.extend_from_slice(&shared);
    }
    om.write(&ctx, second.as_slice())?;
    om.flush(&ctx)?;

    // One data chunk plus two listings: packs stay tiny.
    let packed: u64 = store.list(&ctx, "p")?.iter().map(|b| b.length).sum();
    assert!(
        packed < 3 * 4096,
        "expected one stored copy of the chunk, packs hold {packed} bytes"
    );
    Ok(())
}

/// Everything in the Data namespace: the staged blocks written through the
/// object layer are enumerable once flushed.
#[test]
fn written_objects_are_listable_blocks() -> Result<()> {
    let ctx = Context::new();
    let store = Arc::new(MemoryStore::new());
    let blocks = Arc::new(BlockManager::new(
        store,
        IdHasher::new(b"object integration"),
        BlockCipher::new(&[2u8; 32]),
        None,
        BlockOptions::default(),
    ));
    let om = ObjectManager::new(blocks.clone(), SplitterParams::fixed(1024));

    let id = om.write(&ctx, pseudorandom(10 * 1024, 17).as_slice())?;
    om.flush(&ctx)?;

    let listed = blocks.list_blocks(&ctx, Some(Prefix::Data), cairn::BlockKind::Packed)?;
    // Ten chunks and one indirection listing.
    assert_eq!(listed.len(), 11);
    assert!(listed.iter().any(|r| r.name == id.block().to_string()));
    Ok(())
}
