//! Cloud collaborators behind traits.
//!
//! The data plane only ever talks to [`ObjectStore`] (bulk ISO volumes,
//! multipart) and [`DocStore`] (individual files mirrored into a folder
//! tree).  The shipped implementations are S3-compatible REST
//! ([`s3::S3Client`]) and Google Drive v3 ([`gdrive::DriveClient`]); tests
//! substitute in-memory fakes.

pub mod gdrive;
pub mod s3;

use std::io::Read;

use chrono::{DateTime, Utc};

use crate::error::Result;

pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

// ── Object store (multipart-capable) ─────────────────────────────────────────

/// Coordinates of one in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub bucket:    String,
    pub key:       String,
    pub upload_id: String,
}

/// What a HEAD probe reveals about an existing remote object.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub size: i64,
    /// Base64 SHA-256; multipart objects carry a `-<parts>` suffix.
    pub checksum_sha256: String,
}

#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_no:  i64,
    pub etag:     String,
    /// Base64 SHA-256 of the bytes this part carried.
    pub checksum: String,
}

#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub key:       String,
    pub upload_id: String,
    pub initiated: Option<DateTime<Utc>>,
}

/// The object-store contract (§ external interfaces).  Checksum algorithm
/// is SHA-256 throughout; digests cross this boundary base64-encoded.
pub trait ObjectStore {
    fn head(&self, bucket: &str, key: &str) -> Result<Option<RemoteObject>>;

    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        checksum: &str,
        content_type: &str,
        storage_class: &str,
    ) -> Result<()>;

    fn get(&self, bucket: &str, key: &str) -> Result<Box<dyn Read>>;

    fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        storage_class: &str,
    ) -> Result<UploadRequest>;

    /// Upload one part; returns the etag the store assigned.
    fn upload_part(
        &self,
        request: &UploadRequest,
        part_no: i64,
        body: &[u8],
        checksum: &str,
    ) -> Result<String>;

    fn complete(
        &self,
        request: &UploadRequest,
        parts: &[CompletedPart],
        checksum: &str,
    ) -> Result<()>;

    fn abort(&self, request: &UploadRequest) -> Result<()>;

    fn list_multipart(&self, bucket: &str) -> Result<Vec<MultipartUpload>>;
}

// ── Document store ───────────────────────────────────────────────────────────

/// What gets created remotely: a folder, or a file with a streamed body.
/// An explicit variant instead of an optional reader, so "folder" cannot be
/// confused with "empty file".
pub enum Upload {
    Folder,
    File(Box<dyn Read + Send>),
}

/// One entry of a remote folder listing.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub id:        String,
    pub name:      String,
    pub is_folder: bool,
    pub size:      i64,
    pub mod_time:  Option<DateTime<Utc>>,
}

/// The document-store contract.  Ids are opaque strings; `parent = None`
/// means "anywhere" for lookups and "root" for creation.
pub trait DocStore {
    /// `(file id, parent id)` when the name exists under `parent`.
    fn get_file_id(&mut self, name: &str, parent: Option<&str>)
        -> Result<Option<(String, String)>>;

    /// `(already_existed, folder id)`.
    fn get_or_create_folder(
        &mut self,
        name: &str,
        parent: Option<&str>,
        mod_time: Option<DateTime<Utc>>,
    ) -> Result<(bool, String)>;

    /// Create a file with a streamed body; returns the new file id.
    fn create_file(
        &mut self,
        name: &str,
        parent: Option<&str>,
        body: Box<dyn Read + Send>,
        mod_time: Option<DateTime<Utc>>,
    ) -> Result<String>;

    fn download(&mut self, id: &str) -> Result<Box<dyn Read>>;

    /// Attach application key/value metadata to a remote object.
    fn update_app_properties(&mut self, id: &str, props: &[(&str, &str)]) -> Result<()>;

    /// `(folders, files)` directly under `folder_id`.
    fn list(&mut self, folder_id: &str) -> Result<(Vec<RemoteEntry>, Vec<RemoteEntry>)>;
}
