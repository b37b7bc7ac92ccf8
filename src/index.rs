//! The block index: per-flush record lists and their canonical merged view.
//!
//! Every flush writes one index blob describing at most one pack. The union
//! of all index blobs in the store is the canonical repository state; the
//! [`CommittedIndex`] is that union folded down to one effective record per
//! block (latest timestamp wins, tombstones win ties).

use std::fmt;

use data_encoding::HEXLOWER;
use rand::RngCore;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::hashing::{BlockId, DIGEST_LEN, Prefix};

pub const INDEX_BLOB_PREFIX: &str = "n";
pub const PACK_BLOB_PREFIX: &str = "p";

const FORMAT_VERSION: u8 = 1;

const PACK_ID_LEN: usize = 16;

// Header flags.
const HEADER_HAS_PACK: u8 = 1 << 0;
// Record flags.
const RECORD_DELETED: u8 = 1 << 0;
const RECORD_STANDALONE: u8 = 1 << 1;

/// Id of a pack blob: random, chosen at pack creation, write-once.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PackId([u8; PACK_ID_LEN]);

impl PackId {
    pub fn random() -> Self {
        let mut bytes = [0u8; PACK_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The blob name: `p` followed by hex.
    pub fn to_name(self) -> String {
        format!("{}{}", PACK_BLOB_PREFIX, HEXLOWER.encode(&self.0))
    }

    pub fn from_name(name: &str) -> Result<Self> {
        let hex = name
            .strip_prefix(PACK_BLOB_PREFIX)
            .ok_or_else(|| Error::invalid("pack id", format!("{name}: missing prefix")))?;
        let bytes = HEXLOWER
            .decode(hex.as_bytes())
            .map_err(|e| Error::invalid("pack id", format!("{name}: {e}")))?;
        if bytes.len() != PACK_ID_LEN {
            return Err(Error::invalid("pack id", format!("{name}: wrong length")));
        }
        let mut id = [0u8; PACK_ID_LEN];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_name())
    }
}

impl fmt::Debug for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackId({self})")
    }
}

/// Where a block's bytes live.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Location {
    /// The common case: inside a pack blob, at this extent.
    Packed {
        pack: PackId,
        offset: u64,
        length: u64,
    },
    /// A standalone blob named by the block id itself
    /// (payloads too large to share a pack).
    Standalone { length: u64 },
    /// A tombstone.
    Deleted,
}

/// One index record: the state of one block as of one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: BlockId,
    /// Seconds since the epoch, from the first write by the recording writer.
    pub timestamp: i64,
    pub location: Location,
}

impl IndexEntry {
    pub fn is_deleted(&self) -> bool {
        matches!(self.location, Location::Deleted)
    }

    pub fn length(&self) -> Option<u64> {
        match self.location {
            Location::Packed { length, .. } | Location::Standalone { length } => Some(length),
            Location::Deleted => None,
        }
    }

    /// The effective-record rule: later timestamps win,
    /// and at equal timestamps a tombstone beats a live record.
    pub fn supersedes(&self, other: &IndexEntry) -> bool {
        (self.timestamp, self.is_deleted()) > (other.timestamp, other.is_deleted())
    }
}

/// A decoded index blob: the records one flush wrote,
/// describing at most one pack.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBlob {
    pub pack: Option<PackId>,
    pub entries: Vec<IndexEntry>,
}

pub fn encode(blob: &IndexBlob) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + blob.entries.len() * (DIGEST_LEN + 16));
    out.push(FORMAT_VERSION);
    match blob.pack {
        Some(pack) => {
            out.push(HEADER_HAS_PACK);
            out.extend_from_slice(&pack.0);
        }
        None => out.push(0),
    }
    put_uvarint(&mut out, blob.entries.len() as u64);
    for entry in &blob.entries {
        out.extend_from_slice(&entry.id.to_wire());
        let (flags, offset, length) = match entry.location {
            Location::Packed { offset, length, .. } => (0, offset, length),
            Location::Standalone { length } => (RECORD_STANDALONE, 0, length),
            Location::Deleted => (RECORD_DELETED, 0, 0),
        };
        put_uvarint(&mut out, offset);
        put_uvarint(&mut out, length);
        put_uvarint(&mut out, entry.timestamp.max(0) as u64);
        out.push(flags);
    }
    out
}

pub fn decode(mut bytes: &[u8]) -> Result<IndexBlob> {
    let input = &mut bytes;
    let version = take(input, 1)?[0];
    if version != FORMAT_VERSION {
        return Err(Error::FormatUnsupported(version as u32));
    }
    let header_flags = take(input, 1)?[0];
    let pack = if header_flags & HEADER_HAS_PACK != 0 {
        let mut id = [0u8; PACK_ID_LEN];
        id.copy_from_slice(take(input, PACK_ID_LEN)?);
        Some(PackId(id))
    } else {
        None
    };
    let count = get_uvarint(input)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = BlockId::from_wire(take(input, DIGEST_LEN + 1)?)
            .map_err(|e| Error::corrupt(format!("index record: {e}")))?;
        let offset = get_uvarint(input)?;
        let length = get_uvarint(input)?;
        let timestamp = get_uvarint(input)? as i64;
        let flags = take(input, 1)?[0];
        let location = if flags & RECORD_DELETED != 0 {
            Location::Deleted
        } else if flags & RECORD_STANDALONE != 0 {
            Location::Standalone { length }
        } else {
            let pack = pack.ok_or_else(|| {
                Error::corrupt("packed index record in an index blob with no pack")
            })?;
            Location::Packed {
                pack,
                offset,
                length,
            }
        };
        entries.push(IndexEntry {
            id,
            timestamp,
            location,
        });
    }
    if !input.is_empty() {
        return Err(Error::corrupt("trailing bytes after index records"));
    }
    Ok(IndexBlob { pack, entries })
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        return Err(Error::corrupt("index blob truncated"));
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

fn put_uvarint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn get_uvarint(input: &mut &[u8]) -> Result<u64> {
    let mut v: u64 = 0;
    for shift in (0..64).step_by(7) {
        let byte = take(input, 1)?[0];
        v |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
    }
    Err(Error::corrupt("varint overflows 64 bits"))
}

/// The effective per-block view merged from every ingested index blob.
#[derive(Default)]
pub struct CommittedIndex {
    entries: FxHashMap<BlockId, IndexEntry>,
    /// Known byte length of each pack, from the largest extent indexed in it.
    packs: FxHashMap<PackId, u64>,
}

impl CommittedIndex {
    /// Fold one record in. Returns whether it changed the effective view.
    pub fn apply(&mut self, entry: IndexEntry) -> bool {
        if let Location::Packed {
            pack,
            offset,
            length,
        } = entry.location
        {
            let end = offset + length;
            let known = self.packs.entry(pack).or_insert(0);
            *known = (*known).max(end);
        }
        match self.entries.get(&entry.id) {
            Some(current) if !entry.supersedes(current) => false,
            _ => {
                self.entries.insert(entry.id, entry);
                true
            }
        }
    }

    /// The effective record, tombstones included.
    pub fn get(&self, id: &BlockId) -> Option<&IndexEntry> {
        self.entries.get(id)
    }

    /// The effective record, but only if the block is alive.
    pub fn get_live(&self, id: &BlockId) -> Option<&IndexEntry> {
        self.entries.get(id).filter(|e| !e.is_deleted())
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn packs(&self) -> impl Iterator<Item = (&PackId, &u64)> {
        self.packs.iter()
    }

    pub fn pack_len(&self, pack: &PackId) -> Option<u64> {
        self.packs.get(pack).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What to enumerate when listing blocks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockKind {
    /// Everything below.
    All,
    /// Blobs actually present in the store, per its listing.
    Physical,
    /// Index entries living inside a pack.
    Packed,
    /// Index entries stored as standalone blobs.
    Nonpacked,
    /// The pack blobs themselves.
    Packs,
}

/// One row of a block listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    /// Block id or blob name, depending on the kind.
    pub name: String,
    pub length: u64,
    pub timestamp: i64,
    pub deleted: bool,
    pub pack: Option<PackId>,
}

impl BlockRecord {
    pub(crate) fn from_entry(entry: &IndexEntry) -> Self {
        let pack = match entry.location {
            Location::Packed { pack, .. } => Some(pack),
            _ => None,
        };
        Self {
            name: entry.id.to_string(),
            length: entry.length().unwrap_or(0),
            timestamp: entry.timestamp,
            deleted: entry.is_deleted(),
            pack,
        }
    }
}

/// Does this blob name denote a block with the given prefix
/// (as opposed to a pack, an index blob, or a block in another namespace)?
pub(crate) fn name_matches_prefix(name: &str, prefix: Option<Prefix>) -> bool {
    let parsed: Result<BlockId> = name.parse();
    match (parsed, prefix) {
        (Ok(_), None) => true,
        (Ok(id), Some(p)) => id.prefix() == p,
        (Err(_), _) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::hashing::IdHasher;

    fn entry(payload: &[u8], timestamp: i64, location: Location) -> IndexEntry {
        IndexEntry {
            id: IdHasher::new(b"test").id(Prefix::Data, payload),
            timestamp,
            location,
        }
    }

    fn build_test_blob() -> IndexBlob {
        let pack = PackId::random();
        IndexBlob {
            pack: Some(pack),
            entries: vec![
                entry(
                    b"first",
                    1_700_000_000,
                    Location::Packed {
                        pack,
                        offset: 0,
                        length: 42,
                    },
                ),
                entry(
                    b"second",
                    1_700_000_001,
                    Location::Packed {
                        pack,
                        offset: 42,
                        length: 9001,
                    },
                ),
                entry(b"third", 1_700_000_002, Location::Standalone { length: 1 << 30 }),
                entry(b"fourth", 1_700_000_003, Location::Deleted),
            ],
        }
    }

    #[test]
    fn round_trip() -> Result<()> {
        let blob = build_test_blob();
        assert_eq!(decode(&encode(&blob))?, blob);

        let tombstones_only = IndexBlob {
            pack: None,
            entries: vec![entry(b"gone", 1_700_000_000, Location::Deleted)],
        };
        assert_eq!(decode(&encode(&tombstones_only))?, tombstones_only);
        Ok(())
    }

    #[test]
    fn rejects_unknown_versions_and_truncation() {
        let mut encoded = encode(&build_test_blob());
        encoded[0] = 99;
        assert!(matches!(
            decode(&encoded),
            Err(Error::FormatUnsupported(99))
        ));

        let encoded = encode(&build_test_blob());
        assert!(decode(&encoded[..encoded.len() - 3]).is_err());
    }

    #[test]
    fn varints() -> Result<()> {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, v);
            let mut slice = buf.as_slice();
            assert_eq!(get_uvarint(&mut slice)?, v);
            assert!(slice.is_empty());
        }
        // An 11-byte varint doesn't fit in 64 bits.
        let mut overlong = &[0xffu8; 11][..];
        assert!(get_uvarint(&mut overlong).is_err());
        Ok(())
    }

    #[test]
    fn later_records_supersede() {
        let pack = PackId::random();
        let live = |ts| {
            entry(
                b"x",
                ts,
                Location::Packed {
                    pack,
                    offset: 0,
                    length: 1,
                },
            )
        };
        let dead = |ts| entry(b"x", ts, Location::Deleted);

        assert!(live(2).supersedes(&live(1)));
        assert!(!live(1).supersedes(&live(2)));
        // Ties go to the tombstone.
        assert!(dead(1).supersedes(&live(1)));
        assert!(!live(1).supersedes(&dead(1)));
    }

    #[test]
    fn committed_index_merge() {
        let pack = PackId::random();
        let mut index = CommittedIndex::default();

        let first = entry(
            b"x",
            10,
            Location::Packed {
                pack,
                offset: 0,
                length: 100,
            },
        );
        assert!(index.apply(first));
        // Re-applying the same record changes nothing.
        assert!(!index.apply(first));
        assert!(index.get_live(&first.id).is_some());

        // An older record loses.
        assert!(!index.apply(entry(b"x", 5, Location::Deleted)));
        assert!(index.get_live(&first.id).is_some());

        // A newer tombstone wins.
        assert!(index.apply(entry(b"x", 11, Location::Deleted)));
        assert!(index.get_live(&first.id).is_none());
        assert!(index.get(&first.id).unwrap().is_deleted());

        // Pack length tracks the largest indexed extent.
        assert_eq!(index.pack_len(&pack), Some(100));
    }

    #[test]
    fn pack_names() -> Result<()> {
        let pack = PackId::random();
        let name = pack.to_name();
        assert!(name.starts_with('p'));
        assert_eq!(PackId::from_name(&name)?, pack);
        assert!(PackId::from_name("nope").is_err());
        Ok(())
    }
}
