//! Repository bootstrap: the format document, its encrypted envelope,
//! and the local connection config.
//!
//! The bootstrap blob is a cleartext JSON envelope carrying the key
//! derivation parameters and an encrypted format document. The format
//! document holds everything a connected repository needs - key material,
//! splitter parameters, the pack budget - and never changes after creation.

use std::io::Write;

use camino::Utf8Path;
use data_encoding::HEXLOWER;
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

use crate::cache;
use crate::chunker::SplitterParams;
use crate::crypto::{BlockCipher, KEY_LEN, random_key};
use crate::error::{Error, Result};
use crate::store::ConnectionInfo;

/// The bootstrap blob's name in the store.
pub const REPOSITORY_BLOB: &str = "cairn.repository";

pub const FORMAT_VERSION: u32 = 1;

const KDF_ALGORITHM: &str = "argon2id";
const SALT_LEN: usize = 16;

mod hex_bytes {
    use data_encoding::HEXLOWER;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&HEXLOWER.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        HEXLOWER
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Everything a connected repository runs on. Encrypted at rest inside the
/// bootstrap envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatDocument {
    pub format_version: u32,
    #[serde(with = "hex_bytes")]
    pub hmac_secret: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub encryption_key: Vec<u8>,
    pub splitter: SplitterParams,
    pub max_pack_size: u64,
}

impl FormatDocument {
    /// Fresh key material and the given parameters.
    pub fn generate(splitter: SplitterParams, max_pack_size: u64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            hmac_secret: random_key().to_vec(),
            encryption_key: random_key().to_vec(),
            splitter,
            max_pack_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(Error::FormatUnsupported(self.format_version));
        }
        if self.encryption_key.len() != KEY_LEN || self.hmac_secret.is_empty() {
            return Err(Error::invalid("format document", "bad key material"));
        }
        if self.max_pack_size == 0 {
            return Err(Error::invalid("format document", "max_pack_size is zero"));
        }
        self.splitter.validate()
    }

    pub fn encryption_key_array(&self) -> Result<[u8; KEY_LEN]> {
        self.encryption_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::invalid("format document", "bad encryption key length"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDerivation {
    pub algorithm: String,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
}

/// The cleartext bootstrap blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub format_version: u32,
    /// Random, fixed at creation; identifies this repository in logs and
    /// cache directories.
    pub unique_id: String,
    pub key_derivation: KeyDerivation,
    #[serde(with = "hex_bytes")]
    pub encrypted_format: Vec<u8>,
}

pub fn seal_envelope(doc: &FormatDocument, password: &str) -> Result<Envelope> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let kek = derive_kek(password, &salt)?;

    let json =
        serde_json::to_vec(doc).map_err(|e| Error::invalid("format document", e.to_string()))?;
    let encrypted_format = BlockCipher::new(&kek).seal(&json)?;

    let mut unique_id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut unique_id);

    Ok(Envelope {
        format_version: doc.format_version,
        unique_id: HEXLOWER.encode(&unique_id),
        key_derivation: KeyDerivation {
            algorithm: KDF_ALGORITHM.to_string(),
            salt,
        },
        encrypted_format,
    })
}

pub fn open_envelope(envelope: &Envelope, password: &str) -> Result<FormatDocument> {
    if envelope.format_version != FORMAT_VERSION {
        return Err(Error::FormatUnsupported(envelope.format_version));
    }
    if envelope.key_derivation.algorithm != KDF_ALGORITHM {
        return Err(Error::invalid(
            "key derivation",
            format!("unknown algorithm {}", envelope.key_derivation.algorithm),
        ));
    }
    let kek = derive_kek(password, &envelope.key_derivation.salt)?;
    let json = BlockCipher::new(&kek)
        .open(&envelope.encrypted_format)
        .map_err(|_| Error::invalid("password", "wrong password (or a corrupt envelope)"))?;
    let doc: FormatDocument = serde_json::from_slice(&json)
        .map_err(|e| Error::corrupt(format!("format document: {e}")))?;
    doc.validate()?;
    Ok(doc)
}

fn derive_kek(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let mut kek = [0u8; KEY_LEN];
    argon2::Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut kek)
        .map_err(|e| Error::invalid("password", e.to_string()))?;
    Ok(kek)
}

/// The local configuration file: how to reach the store, where to cache,
/// and (optionally) the bootstrap envelope so reconnecting needs only the
/// password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub store: ConnectionInfo,
    pub cache_dir: Option<camino::Utf8PathBuf>,
    #[serde(default = "default_cache_bytes")]
    pub max_cache_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
}

fn default_cache_bytes() -> u64 {
    cache::DEFAULT_MAX_BYTES
}

impl RepoConfig {
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        serde_json::from_str(&s).map_err(|e| Error::invalid("config", format!("{path}: {e}")))
    }

    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).expect("config serializes");
        let dir = path.parent().ok_or_else(|| {
            Error::invalid("config", format!("{path} has no parent directory"))
        })?;
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new().prefix(".config-").tempfile_in(dir)?;
        tmp.write_all(&json)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_round_trip() -> Result<()> {
        let doc = FormatDocument::generate(SplitterParams::default(), 20 * 1024 * 1024);
        let envelope = seal_envelope(&doc, "hunter2")?;

        let opened = open_envelope(&envelope, "hunter2")?;
        assert_eq!(opened.hmac_secret, doc.hmac_secret);
        assert_eq!(opened.encryption_key, doc.encryption_key);
        assert_eq!(opened.splitter, doc.splitter);
        assert_eq!(opened.max_pack_size, doc.max_pack_size);
        Ok(())
    }

    #[test]
    fn wrong_password_is_rejected() -> Result<()> {
        let doc = FormatDocument::generate(SplitterParams::default(), 20 * 1024 * 1024);
        let envelope = seal_envelope(&doc, "hunter2")?;
        assert!(matches!(
            open_envelope(&envelope, "*******"),
            Err(Error::Invalid { what: "password", .. })
        ));
        Ok(())
    }

    #[test]
    fn unknown_versions_are_refused() -> Result<()> {
        let doc = FormatDocument::generate(SplitterParams::default(), 20 * 1024 * 1024);
        let mut envelope = seal_envelope(&doc, "pw")?;
        envelope.format_version = 99;
        assert!(matches!(
            open_envelope(&envelope, "pw"),
            Err(Error::FormatUnsupported(99))
        ));
        Ok(())
    }

    #[test]
    fn envelope_survives_json() -> Result<()> {
        let doc = FormatDocument::generate(SplitterParams::default(), 1024);
        let envelope = seal_envelope(&doc, "pw")?;
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.unique_id, envelope.unique_id);
        assert!(open_envelope(&parsed, "pw").is_ok());
        Ok(())
    }

    #[test]
    fn config_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = Utf8Path::from_path(dir.path()).unwrap().join("repo.config");

        let config = RepoConfig {
            store: ConnectionInfo::Memory,
            cache_dir: None,
            max_cache_bytes: 123,
            envelope: None,
        };
        config.save(&path)?;
        let loaded = RepoConfig::load(&path)?;
        assert_eq!(loaded.store, config.store);
        assert_eq!(loaded.max_cache_bytes, 123);
        assert!(loaded.envelope.is_none());
        Ok(())
    }
}
