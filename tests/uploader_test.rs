use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use tempfile::TempDir;

use lomob::clients::{CompletedPart, MultipartUpload, ObjectStore, RemoteObject, UploadRequest};
use lomob::types::{IsoInfo, IsoStatus, PartStatus};
use lomob::uploader::{self, UploadOptions};
use lomob::{hash, Catalog, Error, MasterDecryptingWriter, Result, SALT_LEN};

const PART_SIZE: u64 = 5 * 1024 * 1024;

// ── In-memory object store ───────────────────────────────────────────────────

#[derive(Default)]
struct FakeState {
    /// key → (bytes, checksum header value)
    objects:    HashMap<String, (Vec<u8>, String)>,
    /// upload_id → part_no → (body, checksum, etag)
    uploads:    HashMap<String, HashMap<i64, (Vec<u8>, String, String)>>,
    upload_key: HashMap<String, String>,
    /// part numbers that fail exactly once
    fail_once:  HashSet<i64>,
    next_id:    u64,
    part_calls: u64,
}

#[derive(Default)]
struct FakeStore {
    state: Mutex<FakeState>,
}

impl FakeStore {
    fn failing(parts: &[i64]) -> Self {
        let store = FakeStore::default();
        store.state.lock().unwrap().fail_once = parts.iter().copied().collect();
        store
    }

    fn object(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    fn part_calls(&self) -> u64 {
        self.state.lock().unwrap().part_calls
    }
}

impl ObjectStore for FakeStore {
    fn head(&self, _bucket: &str, key: &str) -> Result<Option<RemoteObject>> {
        Ok(self.state.lock().unwrap().objects.get(key).map(|(bytes, checksum)| RemoteObject {
            size:            bytes.len() as i64,
            checksum_sha256: checksum.clone(),
        }))
    }

    fn put(
        &self,
        _bucket: &str,
        key: &str,
        body: &[u8],
        checksum: &str,
        _content_type: &str,
        _storage_class: &str,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), (body.to_vec(), checksum.to_string()));
        Ok(())
    }

    fn get(&self, _bucket: &str, key: &str) -> Result<Box<dyn Read>> {
        let (bytes, _) = self
            .object(key)
            .ok_or_else(|| Error::NotFound(format!("object {key}")))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
        _storage_class: &str,
    ) -> Result<UploadRequest> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let upload_id = format!("upload-{}", state.next_id);
        state.uploads.insert(upload_id.clone(), HashMap::new());
        state.upload_key.insert(upload_id.clone(), key.to_string());
        Ok(UploadRequest { bucket: bucket.to_string(), key: key.to_string(), upload_id })
    }

    fn upload_part(
        &self,
        request: &UploadRequest,
        part_no: i64,
        body: &[u8],
        checksum: &str,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.part_calls += 1;
        if state.fail_once.remove(&part_no) {
            return Err(Error::RemoteRejected { status: 500, body: "injected".into() });
        }
        // the store recomputes and verifies the digest it was promised
        let actual = hash::to_base64(&hash::hash_bytes(body));
        if actual != checksum {
            return Err(Error::RemoteRejected { status: 400, body: "checksum mismatch".into() });
        }
        let etag = format!("etag-{part_no}");
        state
            .uploads
            .get_mut(&request.upload_id)
            .ok_or_else(|| Error::NotFound(format!("upload {}", request.upload_id)))?
            .insert(part_no, (body.to_vec(), checksum.to_string(), etag.clone()));
        Ok(etag)
    }

    fn complete(
        &self,
        request: &UploadRequest,
        parts: &[CompletedPart],
        checksum: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let uploaded = state
            .uploads
            .remove(&request.upload_id)
            .ok_or_else(|| Error::NotFound(format!("upload {}", request.upload_id)))?;

        let mut bytes = Vec::new();
        let mut digests = Vec::new();
        for p in parts {
            let (body, part_checksum, etag) = uploaded
                .get(&p.part_no)
                .ok_or_else(|| Error::State(format!("part {} never uploaded", p.part_no)))?;
            if etag != &p.etag || part_checksum != &p.checksum {
                return Err(Error::RemoteRejected { status: 400, body: "bad part".into() });
            }
            bytes.extend_from_slice(body);
            let digest: [u8; 32] = hash::decode_base64(part_checksum)?.try_into().unwrap();
            digests.push(digest);
        }
        if hash::concat_base64(&digests) != checksum {
            return Err(Error::RemoteRejected { status: 400, body: "bad whole checksum".into() });
        }

        let stored_checksum = format!("{checksum}-{}", parts.len());
        state.upload_key.remove(&request.upload_id);
        state.objects.insert(request.key.clone(), (bytes, stored_checksum));
        Ok(())
    }

    fn abort(&self, request: &UploadRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.uploads.remove(&request.upload_id);
        state.upload_key.remove(&request.upload_id);
        Ok(())
    }

    fn list_multipart(&self, _bucket: &str) -> Result<Vec<MultipartUpload>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .upload_key
            .iter()
            .map(|(id, key)| MultipartUpload {
                key:       key.clone(),
                upload_id: id.clone(),
                initiated: None,
            })
            .collect())
    }
}

// ── Fixture ──────────────────────────────────────────────────────────────────

struct Fixture {
    _tmp:     TempDir,
    db_path:  std::path::PathBuf,
    iso_path: String,
}

/// A catalogued 10 MiB ISO (two 5 MiB parts) on disk.
fn fixture(len: usize) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("lomob.db");
    let iso_path = tmp.path().join("2024-01-01--2024-02-01.iso");

    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let mut f = fs::File::create(&iso_path).unwrap();
    f.write_all(&data).unwrap();

    let mut catalog = Catalog::open(&db_path).unwrap();
    let iso_path = iso_path.to_string_lossy().to_string();
    catalog
        .create_iso_with_file_ids(
            &IsoInfo {
                name:       iso_path.clone(),
                size:       len as i64,
                hash_local: hash::to_hex(&hash::hash_file(&iso_path).unwrap()),
                ..IsoInfo::default()
            },
            &[],
        )
        .unwrap();

    Fixture { _tmp: tmp, db_path, iso_path }
}

fn options(master_key: Option<&str>) -> UploadOptions {
    UploadOptions {
        region:        "us-east-1".into(),
        bucket:        "bkt".into(),
        storage_class: "STANDARD_IA".into(),
        part_size:     PART_SIZE,
        master_key:    master_key.map(|s| s.to_string()),
        save_parts:    false,
        force:         false,
        threads:       1,
    }
}

fn object_key(iso_path: &str) -> String {
    std::path::Path::new(iso_path)
        .file_name()
        .unwrap()
        .to_string_lossy()
        .to_string()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn plaintext_upload_end_to_end() {
    let fx = fixture(10 * 1024 * 1024);
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let store = FakeStore::default();
    let cancel = AtomicBool::new(false);

    uploader::upload_iso(&mut catalog, &store, &options(None), &fx.iso_path, &cancel).unwrap();

    let iso = catalog.get_iso_by_name(&fx.iso_path).unwrap().unwrap();
    assert_eq!(iso.status, Some(IsoStatus::Uploaded));

    let (bytes, checksum) = store.object(&object_key(&fx.iso_path)).unwrap();
    assert_eq!(bytes, fs::read(&fx.iso_path).unwrap());
    assert_eq!(checksum, format!("{}-2", iso.hash_remote));

    // sidecar went up as well
    assert!(store.object(&format!("{}.meta.txt", object_key(&fx.iso_path))).is_some());
}

#[test]
fn failed_part_resumes_on_rerun() {
    let fx = fixture(10 * 1024 * 1024);
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let store = FakeStore::failing(&[2]);
    let cancel = AtomicBool::new(false);

    let err = uploader::upload_iso(&mut catalog, &store, &options(None), &fx.iso_path, &cancel)
        .unwrap_err();
    assert!(err.to_string().contains("failed to upload"));

    let iso_id = catalog.get_iso_by_name(&fx.iso_path).unwrap().unwrap().id;
    let parts = catalog.get_parts_by_iso_id(iso_id).unwrap();
    assert_eq!(parts[0].status, PartStatus::Uploaded);
    assert_eq!(parts[1].status, PartStatus::UploadFailed);
    let calls_after_first = store.part_calls();

    // second run retries only part 2 and completes with both etags
    uploader::upload_iso(&mut catalog, &store, &options(None), &fx.iso_path, &cancel).unwrap();
    assert_eq!(store.part_calls(), calls_after_first + 1);

    let iso = catalog.get_iso_by_name(&fx.iso_path).unwrap().unwrap();
    assert_eq!(iso.status, Some(IsoStatus::Uploaded));
    let (bytes, _) = store.object(&object_key(&fx.iso_path)).unwrap();
    assert_eq!(bytes, fs::read(&fx.iso_path).unwrap());
}

#[test]
fn uploaded_iso_is_a_noop() {
    let fx = fixture(10 * 1024 * 1024);
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let store = FakeStore::default();
    let cancel = AtomicBool::new(false);

    let iso = catalog.get_iso_by_name(&fx.iso_path).unwrap().unwrap();
    catalog.update_iso_status(iso.id, IsoStatus::Uploaded).unwrap();

    uploader::upload_iso(&mut catalog, &store, &options(None), &fx.iso_path, &cancel).unwrap();
    assert_eq!(store.part_calls(), 0);
    assert!(store.object(&object_key(&fx.iso_path)).is_none());
}

#[test]
fn encrypted_upload_places_salt_in_part_one() {
    let fx = fixture(10 * 1024 * 1024);
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let store = FakeStore::default();
    let cancel = AtomicBool::new(false);

    uploader::upload_iso(&mut catalog, &store, &options(Some("pw")), &fx.iso_path, &cancel)
        .unwrap();

    let iso = catalog.get_iso_by_name(&fx.iso_path).unwrap().unwrap();
    assert_eq!(iso.status, Some(IsoStatus::Uploaded));

    let parts = catalog.get_parts_by_iso_id(iso.id).unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].size as u64, PART_SIZE + SALT_LEN as u64);
    assert_eq!(parts[1].size as u64, PART_SIZE);

    // remote object: 16-byte salt prefix taken from the plaintext hash
    let (bytes, _) = store.object(&object_key(&fx.iso_path)).unwrap();
    assert_eq!(bytes.len(), 10 * 1024 * 1024 + SALT_LEN);
    let salt = hex::decode(&iso.hash_local).unwrap()[..SALT_LEN].to_vec();
    assert_eq!(&bytes[..SALT_LEN], &salt[..]);

    // and the whole thing decrypts byte-for-byte
    let mut plain = Vec::new();
    let mut dec = MasterDecryptingWriter::new(&mut plain, "pw");
    dec.write_all(&bytes).unwrap();
    dec.flush().unwrap();
    assert_eq!(plain, fs::read(&fx.iso_path).unwrap());
}

#[test]
fn encrypted_rerun_is_deterministic_noop() {
    let fx = fixture(10 * 1024 * 1024);
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let store = FakeStore::default();
    let cancel = AtomicBool::new(false);

    let opts = options(Some("pw"));
    uploader::upload_iso(&mut catalog, &store, &opts, &fx.iso_path, &cancel).unwrap();
    let calls = store.part_calls();
    let (bytes_before, _) = store.object(&object_key(&fx.iso_path)).unwrap();

    // force makes it re-encrypt from scratch; hash-derived salt keeps the
    // ciphertext identical
    let forced = UploadOptions { force: true, ..options(Some("pw")) };
    uploader::upload_iso(&mut catalog, &store, &forced, &fx.iso_path, &cancel).unwrap();
    assert_eq!(store.part_calls(), calls + 2);
    let (bytes_after, _) = store.object(&object_key(&fx.iso_path)).unwrap();
    assert_eq!(bytes_before, bytes_after);
}

#[test]
fn part_size_constraints_are_enforced() {
    let fx = fixture(1024);
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let store = FakeStore::default();
    let cancel = AtomicBool::new(false);

    let small = UploadOptions { part_size: 1024, ..options(None) };
    assert!(matches!(
        uploader::upload_iso(&mut catalog, &store, &small, &fx.iso_path, &cancel),
        Err(Error::UserInput(_))
    ));

    let unaligned = UploadOptions { part_size: PART_SIZE + 7, ..options(None) };
    assert!(matches!(
        uploader::upload_iso(&mut catalog, &store, &unaligned, &fx.iso_path, &cancel),
        Err(Error::UserInput(_))
    ));
}

#[test]
fn abort_all_for_key_is_idempotent() {
    let store = FakeStore::default();
    let req1 = store.create_multipart("bkt", "x.iso", "application/octet-stream", "").unwrap();
    let _req2 = store.create_multipart("bkt", "y.iso", "application/octet-stream", "").unwrap();

    uploader::abort_upload(&store, "bkt", "x.iso", None).unwrap();
    let left = uploader::list_inprogress_uploads(&store, "bkt").unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].key, "y.iso");

    // aborting again finds nothing for the key and still succeeds
    uploader::abort_upload(&store, "bkt", "x.iso", None).unwrap();
    uploader::abort_upload(&store, "bkt", "y.iso", Some(&left[0].upload_id)).unwrap();
    assert!(uploader::list_inprogress_uploads(&store, "bkt").unwrap().is_empty());
    let _ = req1;
}

#[test]
fn parallel_plaintext_upload_matches_serial() {
    let fx = fixture(15 * 1024 * 1024);
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let store = FakeStore::default();
    let cancel = AtomicBool::new(false);

    let opts = UploadOptions { threads: 3, ..options(None) };
    uploader::upload_iso(&mut catalog, &store, &opts, &fx.iso_path, &cancel).unwrap();

    let (bytes, _) = store.object(&object_key(&fx.iso_path)).unwrap();
    assert_eq!(bytes, fs::read(&fx.iso_path).unwrap());
    assert_eq!(
        catalog.get_iso_by_name(&fx.iso_path).unwrap().unwrap().status,
        Some(IsoStatus::Uploaded)
    );
}
