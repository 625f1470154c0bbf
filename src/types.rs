//! Catalog record types and status enums.

use chrono::{DateTime, Utc};
use std::fmt;

/// `iso_id` sentinel: the file went to the document store, not into an ISO.
pub const ISO_ID_CLOUD: i64 = -1;

/// `scan_root_dir_id` of top-level scan roots in the dirs table.
pub const SUPER_SCAN_ROOT_DIR_ID: i64 = 0;

/// Remote app-property carrying the hex SHA-256 of the plaintext.
pub const META_KEY_HASH_ORIG: &str = "hash_orig";
/// Remote app-property carrying the hex SHA-256 of the ciphertext.
pub const META_KEY_HASH_ENCRYPT: &str = "hash_enc";

// ── Statuses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum IsoStatus {
    Creating  = 0,
    Created   = 1,
    Uploading = 2,
    Uploaded  = 3,
}

impl IsoStatus {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(IsoStatus::Creating),
            1 => Some(IsoStatus::Created),
            2 => Some(IsoStatus::Uploading),
            3 => Some(IsoStatus::Uploaded),
            _ => None,
        }
    }
}

impl fmt::Display for IsoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IsoStatus::Creating  => "Creating",
            IsoStatus::Created   => "Created, not uploaded",
            IsoStatus::Uploading => "Uploading",
            IsoStatus::Uploaded  => "Uploaded",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum PartStatus {
    Uploading    = 0,
    Uploaded     = 1,
    UploadFailed = 2,
}

impl PartStatus {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(PartStatus::Uploading),
            1 => Some(PartStatus::Uploaded),
            2 => Some(PartStatus::UploadFailed),
            _ => None,
        }
    }
}

impl fmt::Display for PartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartStatus::Uploading    => "Uploading",
            PartStatus::Uploaded     => "Uploaded",
            PartStatus::UploadFailed => "UploadFailed",
        })
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct DirInfo {
    pub id:               i64,
    pub scan_root_dir_id: i64,
    pub path:             String,
    pub mod_time:         Option<DateTime<Utc>>,
    pub create_time:      Option<DateTime<Utc>>,
    // aggregates filled by Catalog::list_dirs
    pub file_count:       i64,
    pub child_dir_count:  i64,
    pub total_file_size:  i64,
}

#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub id:       i64,
    pub dir_id:   i64,
    pub iso_id:   i64,
    /// ID assigned by the document store once uploaded there.
    pub ref_id:   String,
    /// Path relative to the scan root while listing; bare name on insert.
    pub name:     String,
    /// Hex SHA-256 of the plaintext, comparable with `sha256sum` output.
    pub hash_local:  String,
    /// Base64 SHA-256 of the bytes actually sent to the cloud.
    pub hash_remote: String,
    pub size:     i64,
    pub mod_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct IsoInfo {
    pub id:          i64,
    pub name:        String,
    pub region:      String,
    pub bucket:      String,
    pub upload_key:  String,
    pub upload_id:   String,
    pub hash_local:  String,
    pub hash_remote: String,
    pub size:        i64,
    pub status:      Option<IsoStatus>,
    pub create_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PartInfo {
    pub iso_id:      i64,
    pub part_no:     i64,
    pub size:        i64,
    pub status:      PartStatus,
    pub etag:        String,
    pub hash_local:  String,
    pub hash_remote: String,
    pub create_time: Option<DateTime<Utc>>,
}

impl PartInfo {
    pub fn new(iso_id: i64, part_no: i64, size: i64) -> Self {
        PartInfo {
            iso_id,
            part_no,
            size,
            status: PartStatus::Uploading,
            etag: String::new(),
            hash_local: String::new(),
            hash_remote: String::new(),
            create_time: None,
        }
    }
}
