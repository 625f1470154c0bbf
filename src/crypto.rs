//! Streaming encryption layer.
//!
//! Wire layout of every encrypted object:
//!
//! ```text
//! salt (16 B) || AES-256-CTR(plaintext, key = Argon2id(passphrase, salt), iv = salt)
//! ```
//!
//! The salt doubles as the CTR IV and is prefixed to the ciphertext so a
//! receiver holding only the passphrase can re-derive the key.  Digest
//! discipline: the salt is part of the ciphertext digest but never part of
//! the plaintext digest.

use std::io::{self, Read, Seek, SeekFrom, Write};

use aes::Aes256;
use argon2::{Algorithm, Argon2, Params, Version};
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Salt length; equals the AES block size because the salt is also the IV.
pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

// ── Key derivation ───────────────────────────────────────────────────────────

/// Argon2id(passphrase, salt) → 32-byte AES key.  t=1, m=64 MiB, p=4.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let params = Params::new(64 * 1024, 1, 4, Some(KEY_LEN))
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Fresh random 16-byte salt.
pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// First 16 bytes of a hex-encoded content hash, reused as a deterministic
/// salt so re-encrypting identical content yields identical ciphertext.
pub fn salt_from_hex_hash(hex_hash: &str) -> Result<[u8; SALT_LEN]> {
    let decoded = hex::decode(hex_hash)
        .map_err(|e| Error::UserInput(format!("invalid hex hash '{hex_hash}': {e}")))?;
    if decoded.len() < SALT_LEN {
        return Err(Error::mismatch("hash length", SALT_LEN, decoded.len()));
    }
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&decoded[..SALT_LEN]);
    Ok(salt)
}

// ── EncryptingReader ─────────────────────────────────────────────────────────

/// Seekable byte source yielding `salt || ciphertext` (or bare ciphertext
/// when constructed without header), with running SHA-256 digests over both
/// the plaintext consumed and the ciphertext emitted.
///
/// Seeks are fully supported: the CTR keystream is re-seeded to the target
/// plaintext offset.  A seek that moves the cursor backwards discards
/// digest progress — `hash_plain`/`hash_cipher` are unspecified afterwards.
pub struct EncryptingReader<R: Read + Seek> {
    inner:       R,
    cipher:      Aes256Ctr,
    salt:        [u8; SALT_LEN],
    with_header: bool,
    /// Position in the emitted stream (header included when present).
    pos:         u64,
    plain_len:   u64,
    hash_plain:  Sha256,
    hash_cipher: Sha256,
}

impl<R: Read + Seek> EncryptingReader<R> {
    /// `inner` is measured and rewound to its origin; the keystream starts
    /// at counter zero there.
    pub fn new(
        mut inner: R,
        key: &[u8; KEY_LEN],
        salt: &[u8; SALT_LEN],
        with_header: bool,
    ) -> Result<Self> {
        let plain_len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;

        Ok(EncryptingReader {
            inner,
            cipher: Aes256Ctr::new(key.into(), salt.into()),
            salt: *salt,
            with_header,
            pos: 0,
            plain_len,
            hash_plain: Sha256::new(),
            hash_cipher: Sha256::new(),
        })
    }

    fn header_len(&self) -> u64 {
        if self.with_header { SALT_LEN as u64 } else { 0 }
    }

    /// Total emitted size: plaintext length plus the salt header.
    pub fn size(&self) -> u64 {
        self.plain_len + self.header_len()
    }

    /// Running SHA-256 of the plaintext consumed so far.
    pub fn hash_plain(&self) -> [u8; 32] {
        self.hash_plain.clone().finalize().into()
    }

    /// Running SHA-256 of the bytes emitted so far (salt included).
    pub fn hash_cipher(&self) -> [u8; 32] {
        self.hash_cipher.clone().finalize().into()
    }
}

impl<R: Read + Seek> Read for EncryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Inside the salt region: emit salt bytes only, stop at the
        // boundary so the next call resumes from the plaintext origin.
        let header = self.header_len();
        if self.pos < header {
            let off = self.pos as usize;
            let n = (SALT_LEN - off).min(buf.len());
            buf[..n].copy_from_slice(&self.salt[off..off + n]);
            self.hash_cipher.update(&buf[..n]);
            self.pos += n as u64;
            return Ok(n);
        }

        let n = self.inner.read(buf)?;
        if n == 0 {
            return Ok(0);
        }
        self.hash_plain.update(&buf[..n]);
        self.cipher.apply_keystream(&mut buf[..n]);
        self.hash_cipher.update(&buf[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for EncryptingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.size() as i64;
        let target = match pos {
            SeekFrom::Start(o)   => o.min(i64::MAX as u64) as i64,
            SeekFrom::Current(o) => self.pos as i64 + o,
            SeekFrom::End(o)     => size + o,
        };
        let target = target.clamp(0, size) as u64;

        let plain_off = target.saturating_sub(self.header_len());
        self.inner.seek(SeekFrom::Start(plain_off))?;
        self.cipher
            .try_seek(plain_off)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.pos = target;
        Ok(target)
    }
}

// ── DecryptingWriter ─────────────────────────────────────────────────────────

/// Sink applying the CTR stream inverse to written bytes, forwarding
/// plaintext to the inner writer.  The caller strips the salt header.
pub struct DecryptingWriter<W: Write> {
    inner:  W,
    cipher: Aes256Ctr,
}

impl<W: Write> DecryptingWriter<W> {
    pub fn new(inner: W, key: &[u8; KEY_LEN], iv: &[u8; SALT_LEN]) -> Self {
        DecryptingWriter { inner, cipher: Aes256Ctr::new(key.into(), iv.into()) }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for DecryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut plain = buf.to_vec();
        self.cipher.apply_keystream(&mut plain);
        self.inner.write_all(&plain)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ── MasterDecryptingWriter ───────────────────────────────────────────────────

enum MasterState<W: Write> {
    /// Key not derived yet; waiting for the salt header.
    Pending { passphrase: String, inner: W },
    Streaming(DecryptingWriter<W>),
    // transient during the Pending → Streaming swap
    Poisoned,
}

/// [`DecryptingWriter`] that derives its key lazily from
/// `(passphrase, first 16 bytes of the stream)`.  The first write must
/// carry at least the full salt header.
pub struct MasterDecryptingWriter<W: Write> {
    state: MasterState<W>,
}

impl<W: Write> MasterDecryptingWriter<W> {
    pub fn new(inner: W, passphrase: &str) -> Self {
        MasterDecryptingWriter {
            state: MasterState::Pending { passphrase: passphrase.to_string(), inner },
        }
    }
}

impl<W: Write> Write for MasterDecryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            MasterState::Streaming(w) => w.write(buf),
            MasterState::Pending { .. } => {
                if buf.len() < SALT_LEN {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, Error::ShortHeader));
                }
                let (passphrase, inner) =
                    match std::mem::replace(&mut self.state, MasterState::Poisoned) {
                        MasterState::Pending { passphrase, inner } => (passphrase, inner),
                        _ => unreachable!(),
                    };

                let mut salt = [0u8; SALT_LEN];
                salt.copy_from_slice(&buf[..SALT_LEN]);
                let key = derive_key(&passphrase, &salt)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

                let mut w = DecryptingWriter::new(inner, &key, &salt);
                w.write_all(&buf[SALT_LEN..])?;
                self.state = MasterState::Streaming(w);
                Ok(buf.len())
            }
            MasterState::Poisoned => {
                Err(io::Error::new(io::ErrorKind::Other, "writer poisoned by earlier failure"))
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            MasterState::Streaming(w) => w.flush(),
            _ => Ok(()),
        }
    }
}

// ── File helpers ─────────────────────────────────────────────────────────────

/// Encrypt `src` into `dst` with a fresh random salt; returns
/// `(salt, plaintext digest, ciphertext digest)`.
pub fn encrypt_file(
    src: impl Read + Seek,
    mut dst: impl Write,
    passphrase: &str,
) -> Result<([u8; SALT_LEN], [u8; 32], [u8; 32])> {
    let salt = random_salt();
    let key = derive_key(passphrase, &salt)?;
    let mut enc = EncryptingReader::new(src, &key, &salt, true)?;
    io::copy(&mut enc, &mut dst)?;
    Ok((salt, enc.hash_plain(), enc.hash_cipher()))
}

/// Decrypt a `salt || ciphertext` stream into `dst`.
pub fn decrypt_file(mut src: impl Read, dst: impl Write, passphrase: &str) -> Result<()> {
    let mut w = MasterDecryptingWriter::new(dst, passphrase);
    let mut header = [0u8; SALT_LEN];
    src.read_exact(&mut header)
        .map_err(|_| Error::ShortHeader)?;
    w.write_all(&header)?;
    io::copy(&mut src, &mut w)?;
    w.flush()?;
    Ok(())
}
