//! Objects: arbitrarily large streams laid over blocks.
//!
//! A stream that fits in one block *is* that block; its object id is the
//! block id. Anything larger gets an indirection block: a CBOR listing of
//! child object ids with their lengths, itself written through the block
//! layer, with the object id wrapped in a leading `I` so readers know to
//! recurse. Listings that outgrow a block are split and pointed to by a
//! higher listing, so the tree deepens implicitly with object size.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::block::BlockManager;
use crate::chunker::SplitterParams;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::hashing::{BlockId, Prefix};

const LISTING_VERSION: u8 = 1;

const DIRECT_TAG: u8 = 0;
const INDIRECT_TAG: u8 = 1;

/// Either a bare block or a block holding an indirection listing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectId {
    Direct(BlockId),
    Indirect(BlockId),
}

impl ObjectId {
    pub fn block(&self) -> &BlockId {
        match self {
            ObjectId::Direct(b) | ObjectId::Indirect(b) => b,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Direct(b) => write!(f, "{b}"),
            ObjectId::Indirect(b) => write!(f, "I{b}"),
        }
    }
}

impl std::str::FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.strip_prefix('I') {
            Some(rest) => Ok(ObjectId::Indirect(rest.parse()?)),
            None => Ok(ObjectId::Direct(s.parse()?)),
        }
    }
}

impl serde::Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let (tag, block) = match self {
            ObjectId::Direct(b) => (DIRECT_TAG, b),
            ObjectId::Indirect(b) => (INDIRECT_TAG, b),
        };
        let mut wire = Vec::with_capacity(1 + block.to_wire().len());
        wire.push(tag);
        wire.extend_from_slice(&block.to_wire());
        serializer.serialize_bytes(&wire)
    }
}

impl<'de> serde::Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<ObjectId, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        let (tag, rest) = bytes
            .split_first()
            .ok_or_else(|| serde::de::Error::custom("empty object id"))?;
        let block = BlockId::from_wire(rest).map_err(serde::de::Error::custom)?;
        match *tag {
            DIRECT_TAG => Ok(ObjectId::Direct(block)),
            INDIRECT_TAG => Ok(ObjectId::Indirect(block)),
            other => Err(serde::de::Error::custom(format!(
                "unknown object id tag {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
struct Listing {
    version: u8,
    entries: Vec<ListEntry>,
}

#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
struct ListEntry {
    id: ObjectId,
    length: u64,
}

fn serialize_listing(entries: &[ListEntry]) -> Result<Vec<u8>> {
    let listing = Listing {
        version: LISTING_VERSION,
        entries: entries.to_vec(),
    };
    let mut bytes = Vec::new();
    ciborium::into_writer(&listing, &mut bytes)
        .map_err(|e| Error::invalid("listing", e.to_string()))?;
    Ok(bytes)
}

fn deserialize_listing(bytes: &[u8]) -> Result<Vec<ListEntry>> {
    let listing: Listing = ciborium::from_reader(bytes)
        .map_err(|e| Error::corrupt(format!("CBOR decoding of listing failed: {e}")))?;
    if listing.version != LISTING_VERSION {
        return Err(Error::FormatUnsupported(listing.version as u32));
    }
    Ok(listing.entries)
}

/// Writes streams as objects and opens them back up.
pub struct ObjectManager {
    blocks: Arc<BlockManager>,
    splitter: SplitterParams,
}

impl ObjectManager {
    pub fn new(blocks: Arc<BlockManager>, splitter: SplitterParams) -> Self {
        Self { blocks, splitter }
    }

    /// Consume the stream, returning a stable object id.
    pub fn write(&self, ctx: &Context, reader: impl Read) -> Result<ObjectId> {
        let mut entries = Vec::new();
        for chunk in self.splitter.split(reader) {
            let chunk = chunk?;
            let id = self.blocks.put(ctx, Prefix::Data, &chunk)?;
            trace!("object chunk {} ({} bytes)", id.short_name(), chunk.len());
            entries.push(ListEntry {
                id: ObjectId::Direct(id),
                length: chunk.len() as u64,
            });
        }
        match entries.len() {
            // The empty stream is the (single) empty block.
            0 => Ok(ObjectId::Direct(self.blocks.put(ctx, Prefix::Data, b"")?)),
            1 => Ok(entries[0].id),
            n => {
                debug!("object spans {n} chunks, writing indirection");
                self.write_listing(ctx, entries)
            }
        }
    }

    fn write_listing(&self, ctx: &Context, entries: Vec<ListEntry>) -> Result<ObjectId> {
        let max = self.splitter.max_size as usize;
        let bytes = serialize_listing(&entries)?;
        if bytes.len() <= max || entries.len() <= 1 {
            let id = self.blocks.put(ctx, Prefix::Data, &bytes)?;
            return Ok(ObjectId::Indirect(id));
        }
        // The listing itself outgrew a block: split it into sub-listings
        // and point a higher listing at those.
        let groups = bytes.len().div_ceil(max) + 1;
        let per_group = entries.len().div_ceil(groups).max(1);
        let mut up = Vec::new();
        for group in entries.chunks(per_group) {
            let length = group.iter().map(|e| e.length).sum();
            let id = self.write_listing(ctx, group.to_vec())?;
            up.push(ListEntry { id, length });
        }
        self.write_listing(ctx, up)
    }

    /// Random-access read over the object's logical bytes.
    pub fn open(&self, ctx: &Context, id: ObjectId) -> Result<ObjectReader> {
        let source = match id {
            // Single-block object: just load it.
            ObjectId::Direct(block) => Source::Inline(self.blocks.get(ctx, &block)?),
            ObjectId::Indirect(_) => {
                let mut extents = Vec::new();
                let mut offset = 0;
                self.collect_extents(ctx, id, &mut extents, &mut offset)?;
                Source::Extents(extents)
            }
        };
        let len = match &source {
            Source::Inline(bytes) => bytes.len() as u64,
            Source::Extents(extents) => extents.last().map(|e| e.start + e.length).unwrap_or(0),
        };
        Ok(ObjectReader {
            blocks: self.blocks.clone(),
            ctx: ctx.clone(),
            source,
            len,
            pos: 0,
            cached: None,
        })
    }

    fn collect_extents(
        &self,
        ctx: &Context,
        id: ObjectId,
        out: &mut Vec<Extent>,
        offset: &mut u64,
    ) -> Result<()> {
        match id {
            ObjectId::Direct(block) => {
                // Leaf lengths come from the parent listing; a bare Direct
                // only reaches here below an Indirect.
                unreachable!("direct object {block} has no listing to collect");
            }
            ObjectId::Indirect(block) => {
                let bytes = self.blocks.get(ctx, &block)?;
                for entry in deserialize_listing(&bytes)? {
                    match entry.id {
                        ObjectId::Direct(child) => {
                            out.push(Extent {
                                start: *offset,
                                length: entry.length,
                                block: child,
                            });
                            *offset += entry.length;
                        }
                        nested @ ObjectId::Indirect(_) => {
                            self.collect_extents(ctx, nested, out, offset)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Forwarded to the block layer.
    pub fn flush(&self, ctx: &Context) -> Result<()> {
        self.blocks.flush(ctx)
    }

    pub fn close(&self, ctx: &Context) -> Result<()> {
        self.blocks.close(ctx)
    }
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    start: u64,
    length: u64,
    block: BlockId,
}

enum Source {
    Inline(Vec<u8>),
    Extents(Vec<Extent>),
}

/// A `Read + Seek` view of an object.
///
/// Seeks map an absolute offset to (extent, offset-within-extent) by binary
/// search; the most recently read block is kept around so sequential reads
/// fetch each block once.
pub struct ObjectReader {
    blocks: Arc<BlockManager>,
    ctx: Context,
    source: Source,
    len: u64,
    pos: u64,
    cached: Option<(usize, Vec<u8>)>,
}

impl ObjectReader {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }
        let (idx, extent) = match &self.source {
            Source::Inline(bytes) => {
                let start = self.pos as usize;
                let n = buf.len().min(bytes.len() - start);
                buf[..n].copy_from_slice(&bytes[start..start + n]);
                self.pos += n as u64;
                return Ok(n);
            }
            Source::Extents(extents) => {
                let idx = extents.partition_point(|e| e.start + e.length <= self.pos);
                debug_assert!(idx < extents.len());
                (idx, extents[idx])
            }
        };
        if self.cached.as_ref().map(|(i, _)| *i) != Some(idx) {
            let payload = self.blocks.get(&self.ctx, &extent.block)?;
            if payload.len() as u64 != extent.length {
                return Err(Error::corrupt(format!(
                    "block {} is {} bytes, listing says {}",
                    extent.block,
                    payload.len(),
                    extent.length
                ))
                .into());
            }
            self.cached = Some((idx, payload));
        }
        let payload = &self.cached.as_ref().unwrap().1;
        let within = (self.pos - extent.start) as usize;
        let n = buf.len().min(payload.len() - within);
        buf[..n].copy_from_slice(&payload[within..within + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for ObjectReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(delta) => self.len as i64 + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of object",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
