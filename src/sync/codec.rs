//! Cold object encoding
//!
//! Layout of every record, tombstone and snapshot object:
//!
//! ```text
//! +------+-------+--------------------------------------------+
//! | MRG1 | flags | gzip(json)  or  nonce ‖ AES-GCM(gzip(json)) |
//! +------+-------+--------------------------------------------+
//!   4 B     1 B
//! ```
//!
//! Flag bit 0 marks an encrypted body. Anything that fails to parse is
//! reported as `Error::Corrupt` so restore can skip it.

use crate::config::SyncConfig;
use crate::crypto::{self, KEY_SIZE};
use crate::error::{Error, Result};
use crate::memory::{MemoryRecord, Tombstone};
use bytes::Bytes;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use zeroize::Zeroizing;

const MAGIC: &[u8; 4] = b"MRG1";
const FLAG_ENCRYPTED: u8 = 0x01;
const HEADER_LEN: usize = MAGIC.len() + 1;

/// What a `memories/` or `documents/` key holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColdObject {
    Record { record: MemoryRecord },
    Tombstone { tombstone: Tombstone },
}

impl ColdObject {
    pub fn id(&self) -> uuid::Uuid {
        match self {
            ColdObject::Record { record } => record.id,
            ColdObject::Tombstone { tombstone } => tombstone.id,
        }
    }
}

/// Serializes, compresses and optionally encrypts cold objects
pub struct ObjectCodec {
    key: Option<Zeroizing<[u8; KEY_SIZE]>>,
}

impl ObjectCodec {
    /// Codec that writes unencrypted objects
    pub fn plain() -> Self {
        Self { key: None }
    }

    /// Codec keyed for `partition`
    pub fn encrypted(master: &[u8; KEY_SIZE], partition: &str) -> Result<Self> {
        Ok(Self {
            key: Some(crypto::derive_partition_key(master, partition)?),
        })
    }

    pub fn from_config(config: &SyncConfig, partition: &str) -> Result<Self> {
        match config.master_key()? {
            Some(master) => Self::encrypted(&master, partition),
            None => Ok(Self::plain()),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        let json = serde_json::to_vec(value)?;
        let mut gz = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
        gz.write_all(&json)?;
        let compressed = gz.finish()?;

        let (flags, body) = match &self.key {
            Some(key) => (FLAG_ENCRYPTED, crypto::encrypt(key, &compressed)?),
            None => (0, compressed),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(MAGIC);
        out.push(flags);
        out.extend_from_slice(&body);
        Ok(Bytes::from(out))
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::Corrupt("missing object header".to_string()));
        }
        let flags = bytes[MAGIC.len()];
        let body = &bytes[HEADER_LEN..];

        let compressed = if flags & FLAG_ENCRYPTED != 0 {
            let key = self.key.as_ref().ok_or_else(|| {
                Error::Corrupt("object is encrypted but no key is configured".to_string())
            })?;
            crypto::decrypt(key, body).map_err(|e| Error::Corrupt(e.to_string()))?
        } else {
            body.to_vec()
        };

        let mut json = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut json)
            .map_err(|e| Error::Corrupt(format!("gzip: {}", e)))?;
        serde_json::from_slice(&json).map_err(|e| Error::Corrupt(format!("json: {}", e)))
    }
}

/// Content digest used to skip rewriting an unchanged object
pub fn digest<T: Serialize>(value: &T) -> Result<[u8; 32]> {
    let json = serde_json::to_vec(value)?;
    Ok(Sha256::digest(&json).into())
}
