//! SHA-256 helpers shared by the packer, the uploaders, and the catalog.
//!
//! Two encodings coexist on purpose: hex for anything compared against
//! `sha256sum` output (local integrity), base64 for anything compared
//! against the object store (its checksum headers are base64).  The
//! multipart whole-object digest is SHA-256 over the *concatenated raw
//! per-part digests*, base64-encoded — the "checksum of checksums" the
//! store computes for multipart uploads with the SHA-256 algorithm.

use std::fs::File;
use std::io;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::chunk::PartReadSeeker;
use crate::error::{Error, Result};

pub const DIGEST_LEN: usize = 32;

pub fn to_hex(digest: &[u8]) -> String {
    hex::encode(digest)
}

pub fn to_base64(digest: &[u8]) -> String {
    BASE64.encode(digest)
}

pub fn decode_base64(s: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(s)
        .map_err(|e| Error::UserInput(format!("invalid base64 digest '{s}': {e}")))
}

pub fn hash_bytes(buf: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(buf).into()
}

/// Streaming SHA-256 of a whole file.
pub fn hash_file(path: impl AsRef<Path>) -> Result<[u8; DIGEST_LEN]> {
    let mut f = File::open(path.as_ref())?;
    let mut h = Sha256::new();
    io::copy(&mut f, &mut h)?;
    Ok(h.finalize().into())
}

/// SHA-256 of each consecutive `part_size` window of the file; the last
/// window is short.  An empty file yields no parts.
pub fn hash_parts(path: impl AsRef<Path>, part_size: u64) -> Result<Vec<[u8; DIGEST_LEN]>> {
    let f = File::open(path.as_ref())?;
    let total = f.metadata()?.len();

    let mut parts = Vec::new();
    let mut curr = 0u64;
    while curr < total {
        let len = part_size.min(total - curr);
        let mut window = PartReadSeeker::new(&f, curr, curr + len);
        let mut h = Sha256::new();
        io::copy(&mut window, &mut h)?;
        parts.push(h.finalize().into());
        curr += len;
    }
    Ok(parts)
}

/// base64(SHA-256(d1 || d2 || … || dn)) over raw per-part digests.
pub fn concat_base64(parts: &[[u8; DIGEST_LEN]]) -> String {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    to_base64(&h.finalize())
}
