//! # lomob — two-stage cold-storage backup
//!
//! Pipeline guarantees (the contract the tests pin down):
//! - Every cloud-bound byte is encrypted locally; the wire layout is
//!   `salt(16B) || AES-256-CTR(plaintext, key = Argon2id(pass, salt))`
//! - `hash_local` is always hex SHA-256 of plaintext, `hash_remote` always
//!   base64 SHA-256 of exactly the transmitted bytes
//! - An ISO row and its files' `iso_id` assignments commit in one
//!   transaction; `iso_id` never returns to 0 once assigned
//! - Multipart state is persisted per `(iso, part_no)`; any interrupted
//!   upload resumes from the parts still missing, with an identical final
//!   completion digest
//! - Catalog writes retry on lock contention; lookup misses are `None`,
//!   never errors

pub mod catalog;
pub mod chunk;
pub mod clients;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod isowriter;
pub mod packer;
pub mod scanner;
pub mod smallfile;
pub mod types;
pub mod uploader;

// Flat re-exports for the most common types.
pub use catalog::Catalog;
pub use chunk::PartReadSeeker;
pub use crypto::{derive_key, DecryptingWriter, EncryptingReader, MasterDecryptingWriter, SALT_LEN};
pub use error::{Error, Result};
pub use isowriter::{IsoWriter, MkisofsWriter};
pub use types::{DirInfo, FileInfo, IsoInfo, IsoStatus, PartInfo, PartStatus, ISO_ID_CLOUD};
pub use uploader::UploadOptions;
