//! Single-file store images.
//!
//! Layout: magic, format version, body length, MessagePack body, CRC32 of
//! the body. Images are written to a temporary file and renamed into place.

use crate::error::{LixError, Result};
use crate::storage::database::Database;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

/// Magic bytes for store images.
const IMAGE_MAGIC: &[u8; 4] = b"LIX\0";

/// Current image format version.
const IMAGE_VERSION: u8 = 1;

/// Serialize a database to image bytes.
pub fn encode_image(db: &Database) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(db)?;
    let mut out = Vec::with_capacity(body.len() + 17);
    out.extend_from_slice(IMAGE_MAGIC);
    out.push(IMAGE_VERSION);
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(out)
}

/// Parse image bytes back into a database.
pub fn decode_image(bytes: &[u8]) -> Result<Database> {
    if bytes.len() < 17 || &bytes[0..4] != IMAGE_MAGIC {
        return Err(LixError::InvalidFormat("Invalid image magic".into()));
    }
    if bytes[4] != IMAGE_VERSION {
        return Err(LixError::InvalidFormat(format!(
            "Unsupported image version: {}",
            bytes[4]
        )));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[5..13]);
    let body_len = u64::from_le_bytes(len_bytes) as usize;
    if bytes.len() != 13 + body_len + 4 {
        return Err(LixError::InvalidFormat("Truncated image".into()));
    }

    let body = &bytes[13..13 + body_len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&bytes[13 + body_len..]);
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(LixError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    Ok(rmp_serde::from_slice(body)?)
}

/// Write an image atomically.
pub fn save_image(path: &Path, db: &Database) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = encode_image(db)?;
    let temp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read an image from disk.
pub fn load_image(path: &Path) -> Result<Database> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    decode_image(&bytes)
}
