//! Block identity: a namespace prefix plus a keyed HMAC of the payload.

use std::fmt;

use data_encoding::HEXLOWER;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const DIGEST_LEN: usize = 32;

/// Namespace prefixes partitioning the block id space.
///
/// Index blobs (`n`) and pack blobs (`p`) are storage-layer names,
/// not block ids; they never appear here.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Prefix {
    /// User data, including indirection listings.
    Data,
    /// Manifest entries.
    Manifest,
}

impl Prefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prefix::Data => "",
            Prefix::Manifest => "m",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Prefix::Data => 0,
            Prefix::Manifest => b'm',
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Prefix::Data),
            b'm' => Ok(Prefix::Manifest),
            other => Err(Error::invalid(
                "block id",
                format!("unknown prefix tag {other:#04x}"),
            )),
        }
    }
}

/// The id of a block: deterministic in (key, payload),
/// so identical payloads collapse to a single block (and a single write).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BlockId {
    prefix: Prefix,
    digest: [u8; DIGEST_LEN],
}

impl BlockId {
    pub fn new(prefix: Prefix, digest: [u8; DIGEST_LEN]) -> Self {
        Self { prefix, digest }
    }

    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Gets a git-like shortened version of the id that's unique enough
    /// for log lines.
    pub fn short_name(&self) -> String {
        let mut full = self.to_string();
        let _rest = full.split_off(8);
        full
    }

    /// Tag byte followed by the digest; the form used inside index records
    /// and CBOR listings.
    pub(crate) fn to_wire(self) -> [u8; DIGEST_LEN + 1] {
        let mut out = [0u8; DIGEST_LEN + 1];
        out[0] = self.prefix.tag();
        out[1..].copy_from_slice(&self.digest);
        out
    }

    pub(crate) fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != DIGEST_LEN + 1 {
            return Err(Error::invalid(
                "block id",
                format!("expected {} wire bytes, got {}", DIGEST_LEN + 1, bytes.len()),
            ));
        }
        let prefix = Prefix::from_tag(bytes[0])?;
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[1..]);
        Ok(Self { prefix, digest })
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix.as_str(), HEXLOWER.encode(&self.digest))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({self})")
    }
}

impl std::str::FromStr for BlockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, hex) = match s.strip_prefix('m') {
            Some(rest) => (Prefix::Manifest, rest),
            None => (Prefix::Data, s),
        };
        let bytes = HEXLOWER
            .decode(hex.as_bytes())
            .map_err(|e| Error::invalid("block id", format!("{s}: {e}")))?;
        if bytes.len() != DIGEST_LEN {
            return Err(Error::invalid(
                "block id",
                format!("{s}: expected {DIGEST_LEN}-byte digest"),
            ));
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes);
        Ok(Self { prefix, digest })
    }
}

impl serde::Serialize for BlockId {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_wire())
    }
}

impl<'de> serde::Deserialize<'de> for BlockId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<BlockId, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        BlockId::from_wire(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Derives block ids from payload bytes with the repository's HMAC secret.
#[derive(Clone)]
pub struct IdHasher {
    secret: Vec<u8>,
}

impl IdHasher {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    pub fn id(&self, prefix: Prefix, payload: &[u8]) -> BlockId {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload);
        BlockId::new(prefix, mac.finalize().into_bytes().into())
    }

    /// Constant-time check that `payload` hashes back to `id`.
    pub fn verify(&self, id: &BlockId, payload: &[u8]) -> Result<()> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload);
        mac.verify_slice(id.digest())
            .map_err(|_| Error::corrupt(format!("payload does not hash to {id}")))
    }
}

/// Plain (unkeyed) SHA-256 in hex; names index blobs by their contents
/// so duplicates collapse.
pub fn content_hash_hex(bytes: &[u8]) -> String {
    HEXLOWER.encode(&Sha256::digest(bytes))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::str::FromStr;

    // RFC 4231 test case 1.
    const KEY: &[u8] = &[0x0b; 20];
    const DATA: &[u8] = b"Hi There";
    const EXPECTED: [u8; DIGEST_LEN] =
        hex_literal::hex!("b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7");

    #[test]
    fn ids_match_rfc_vectors() {
        let hasher = IdHasher::new(KEY);
        let id = hasher.id(Prefix::Data, DATA);
        assert_eq!(id.digest(), &EXPECTED);
        assert!(hasher.verify(&id, DATA).is_ok());
        assert!(hasher.verify(&id, b"Hi Where").is_err());
    }

    #[test]
    fn determinism() {
        let hasher = IdHasher::new(b"some secret");
        assert_eq!(
            hasher.id(Prefix::Data, b"payload"),
            hasher.id(Prefix::Data, b"payload")
        );
        // Same payload, different namespace: different id.
        assert_ne!(
            hasher.id(Prefix::Data, b"payload").to_string(),
            hasher.id(Prefix::Manifest, b"payload").to_string()
        );
    }

    #[test]
    fn string_round_trip() {
        let hasher = IdHasher::new(KEY);
        for prefix in [Prefix::Data, Prefix::Manifest] {
            let id = hasher.id(prefix, DATA);
            let parsed = BlockId::from_str(&id.to_string()).unwrap();
            assert_eq!(id, parsed);
        }
        let id = hasher.id(Prefix::Manifest, DATA);
        assert!(id.to_string().starts_with('m'));
    }

    #[test]
    fn wire_round_trip() {
        let id = IdHasher::new(KEY).id(Prefix::Manifest, DATA);
        assert_eq!(id, BlockId::from_wire(&id.to_wire()).unwrap());
        assert!(BlockId::from_wire(&[1, 2, 3]).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(BlockId::from_str("not hex").is_err());
        assert!(BlockId::from_str("abcd").is_err());
    }
}
