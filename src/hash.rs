//! Chunk content hashing
//!
//! Each chunk descriptor stores a hex digest of the raw (uncompressed) chunk
//! bytes. The algorithm is an archive-scoped setting recorded in the
//! `Options` file, so readers always hash with whatever the archive was
//! created with.

use crate::error::{PhatError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Supported content hash algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HashType {
    /// 128-bit MD5 (default)
    #[default]
    Md5,
    /// 32-bit CRC, fast but weak
    Crc32,
    /// SHA-256
    Sha256,
}

impl HashType {
    /// Name used in the `Options` file and on the command line
    pub fn name(self) -> &'static str {
        match self {
            HashType::Md5 => "MD5",
            HashType::Crc32 => "CRC32",
            HashType::Sha256 => "SHA256",
        }
    }

    /// Hash `data` and return the lowercase hex digest
    pub fn digest(self, data: &[u8]) -> String {
        match self {
            HashType::Md5 => hex::encode(md5::compute(data).0),
            HashType::Crc32 => format!("{:08x}", crc32fast::hash(data)),
            HashType::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }

    /// Length of a hex digest produced by this algorithm
    pub fn hex_len(self) -> usize {
        match self {
            HashType::Md5 => 32,
            HashType::Crc32 => 8,
            HashType::Sha256 => 64,
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashType {
    type Err = PhatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MD5" => Ok(HashType::Md5),
            "CRC32" => Ok(HashType::Crc32),
            "SHA256" => Ok(HashType::Sha256),
            other => Err(PhatError::InvalidConfiguration(format!(
                "unknown hash type '{other}'"
            ))),
        }
    }
}
