//! Resumable multipart upload of ISO volumes.
//!
//! The engine is a state machine over `(iso, part_no)` persisted in the
//! catalog: parts are materialised on the first attempt, marked `Uploaded`
//! only after the store accepted them, and completion runs only when every
//! part made it.  Interrupt the process at any point and a re-run picks up
//! exactly the parts still missing, reusing the recorded
//! `(region, bucket, upload_key, upload_id)`.
//!
//! Encrypted uploads derive the salt from the first 16 bytes of the ISO's
//! plaintext hash, so re-encrypting the same volume yields byte-identical
//! ciphertext and the remote checksum stays comparable across runs.  The
//! salt prefix travels in part 1, whose size is `part_size + 16`; the
//! whole-object size is `plaintext + 16`.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::bounded;

use crate::catalog::Catalog;
use crate::chunk::PartReadSeeker;
use crate::clients::{
    CompletedPart, MultipartUpload, ObjectStore, UploadRequest, CONTENT_TYPE_BINARY,
    CONTENT_TYPE_TEXT,
};
use crate::crypto::{self, EncryptingReader, SALT_LEN};
use crate::error::{Error, Result};
use crate::hash;
use crate::packer;
use crate::types::{IsoInfo, IsoStatus, PartInfo, PartStatus};

pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

pub struct UploadOptions {
    pub region:        String,
    pub bucket:        String,
    pub storage_class: String,
    pub part_size:     u64,
    /// `None` uploads plaintext; `Some` encrypts with this passphrase.
    pub master_key:    Option<String>,
    pub save_parts:    bool,
    pub force:         bool,
    /// Plaintext part fan-out; encrypted uploads are keystream-ordered and
    /// always run serially.
    pub threads:       usize,
}

/// Upload one catalogued ISO, resuming any previous attempt.
pub fn upload_iso(
    catalog: &mut Catalog,
    store: &(dyn ObjectStore + Sync),
    opts: &UploadOptions,
    iso_filename: &str,
    cancel: &AtomicBool,
) -> Result<()> {
    validate_part_size(opts.part_size)?;

    let iso = catalog
        .get_iso_by_name(iso_filename)?
        .ok_or_else(|| Error::NotFound(format!("ISO {iso_filename}")))?;
    if iso.status == Some(IsoStatus::Uploaded) && !opts.force {
        println!("{iso_filename} is already uploaded, nothing to do");
        return Ok(());
    }

    upload_iso_metafile(catalog, store, opts, iso_filename)?;

    if opts.force {
        catalog.reset_iso_upload(iso_filename)?;
    }

    match &opts.master_key {
        None => upload_plain_parts(catalog, store, opts, iso_filename, cancel),
        Some(passphrase) => {
            upload_encrypted_parts(catalog, store, opts, iso_filename, passphrase, cancel)
        }
    }
}

fn validate_part_size(part_size: u64) -> Result<()> {
    if part_size < MIN_PART_SIZE {
        return Err(Error::UserInput(format!(
            "part size must be at least {MIN_PART_SIZE} bytes"
        )));
    }
    if part_size % SALT_LEN as u64 != 0 {
        return Err(Error::UserInput(format!(
            "part size must be a multiple of the cipher block size {SALT_LEN}"
        )));
    }
    Ok(())
}

// ── Preconditions ────────────────────────────────────────────────────────────

/// Open the ISO and verify size and plaintext hash against the catalog row.
fn validate_iso(catalog: &mut Catalog, iso_filename: &str) -> Result<(File, IsoInfo)> {
    let file = File::open(iso_filename)?;
    let disk_size = file.metadata()?.len() as i64;

    let iso = catalog
        .get_iso_by_name(iso_filename)?
        .ok_or_else(|| Error::NotFound(format!("ISO {iso_filename}")))?;

    if disk_size != iso.size {
        return Err(Error::mismatch("size in catalog", iso.size, disk_size));
    }
    let digest_hex = hash::to_hex(&hash::hash_file(iso_filename)?);
    if digest_hex != iso.hash_local {
        return Err(Error::mismatch("hash in catalog", &iso.hash_local, &digest_hex));
    }
    Ok((file, iso))
}

/// Load the ISO's parts, materialising them on the first attempt.
///
/// Plaintext mode (`cal_hash`) computes per-part digests and the
/// whole-object concat digest up front; encrypted mode records only
/// `{part_no, size}` because ciphertext digests exist only once the
/// keystream runs.  Encrypted sizes are on-wire sizes: part 1 carries the
/// 16-byte salt prefix.
fn prepare_upload_parts(
    catalog: &mut Catalog,
    iso_filename: &str,
    part_size: u64,
    cal_hash: bool,
) -> Result<(File, IsoInfo, Vec<PartInfo>)> {
    let (file, mut iso) = validate_iso(catalog, iso_filename)?;

    let parts = catalog.get_parts_by_iso_id(iso.id)?;
    if !parts.is_empty() {
        return Ok((file, iso, parts));
    }

    let mut parts = Vec::new();
    if cal_hash {
        let checksums = hash::hash_parts(iso_filename, part_size)?;
        let mut remaining = iso.size as u64;
        for (i, digest) in checksums.iter().enumerate() {
            let len = remaining.min(part_size);
            let mut p = PartInfo::new(iso.id, i as i64 + 1, len as i64);
            p.hash_local = hash::to_hex(digest);
            p.hash_remote = hash::to_base64(digest);
            parts.push(p);
            remaining -= len;
        }
        catalog.insert_parts(iso.id, &parts)?;

        iso.hash_remote = hash::concat_base64(&checksums);
        catalog.update_iso_remote_hash(iso.id, &iso.hash_remote)?;
    } else {
        let plain = iso.size as u64;
        let num = plain.div_ceil(part_size).max(1);
        for i in 0..num {
            let mut len = part_size.min(plain - i * part_size);
            if i == 0 {
                len += SALT_LEN as u64;
            }
            parts.push(PartInfo::new(iso.id, i as i64 + 1, len as i64));
        }
        catalog.insert_parts(iso.id, &parts)?;
    }
    Ok((file, iso, parts))
}

/// Probe the destination and decide between "already complete", "resume
/// the recorded upload", and "create a fresh one".  `None` means nothing
/// left to upload.
fn prepare_upload_request(
    catalog: &mut Catalog,
    store: &(dyn ObjectStore + Sync),
    opts: &UploadOptions,
    iso: &mut IsoInfo,
    force: bool,
) -> Result<Option<UploadRequest>> {
    let key = object_key(&iso.name);

    let remote = store.head(&opts.bucket, &key)?;
    if !force {
        if let Some(remote) = remote {
            if remote.size != iso.size {
                return Err(Error::mismatch(
                    format!("{key} exists in cloud, size"),
                    iso.size,
                    remote.size,
                ));
            }
            if !iso.hash_remote.is_empty() {
                let remote_hash = remote.checksum_sha256.split('-').next().unwrap_or_default();
                if remote_hash != iso.hash_remote {
                    return Err(Error::mismatch(
                        format!("{key} exists in cloud, checksum"),
                        &iso.hash_remote,
                        remote_hash,
                    ));
                }
            }
            // present and intact, nothing to upload
            return Ok(None);
        }
    }

    // unfinished upload from a previous run, same destination
    if iso.region == opts.region
        && iso.bucket == opts.bucket
        && !iso.upload_id.is_empty()
        && !iso.upload_key.is_empty()
    {
        return Ok(Some(UploadRequest {
            bucket:    iso.bucket.clone(),
            key:       iso.upload_key.clone(),
            upload_id: iso.upload_id.clone(),
        }));
    }

    let request =
        store.create_multipart(&opts.bucket, &key, CONTENT_TYPE_BINARY, &opts.storage_class)?;

    iso.region = opts.region.clone();
    iso.bucket = request.bucket.clone();
    iso.upload_key = request.key.clone();
    iso.upload_id = request.upload_id.clone();
    catalog.update_iso_upload_info(iso)?;

    Ok(Some(request))
}

fn object_key(iso_name: &str) -> String {
    Path::new(iso_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| iso_name.to_string())
}

// ── Plaintext part loop ──────────────────────────────────────────────────────

fn upload_plain_parts(
    catalog: &mut Catalog,
    store: &(dyn ObjectStore + Sync),
    opts: &UploadOptions,
    iso_filename: &str,
    cancel: &AtomicBool,
) -> Result<()> {
    let (file, mut iso, mut parts) =
        prepare_upload_parts(catalog, iso_filename, opts.part_size, true)?;

    let Some(request) = prepare_upload_request(catalog, store, opts, &mut iso, opts.force)?
    else {
        println!(
            "{iso_filename} is already in region {}, bucket {}, no need upload again!",
            opts.region, opts.bucket
        );
        return Ok(());
    };
    catalog.update_iso_status(iso.id, IsoStatus::Uploading)?;

    let failed = if opts.threads > 1 {
        upload_pending_parallel(catalog, store, opts, iso_filename, &request, &mut parts, cancel)?
    } else {
        upload_pending_serial(catalog, store, opts, iso_filename, &file, &request, &mut parts, cancel)?
    };

    if !failed.is_empty() {
        return Err(Error::State(format!("parts {failed:?} failed to upload")));
    }

    finish_upload(store, opts, &iso, &request, &parts, &iso.hash_remote)?;
    catalog.update_iso_status(iso.id, IsoStatus::Uploaded)?;
    Ok(())
}

fn part_window(parts: &[PartInfo], idx: usize) -> (u64, u64) {
    let start: i64 = parts[..idx].iter().map(|p| p.size).sum();
    (start as u64, (start + parts[idx].size) as u64)
}

#[allow(clippy::too_many_arguments)]
fn upload_pending_serial(
    catalog: &mut Catalog,
    store: &(dyn ObjectStore + Sync),
    opts: &UploadOptions,
    iso_filename: &str,
    file: &File,
    request: &UploadRequest,
    parts: &mut [PartInfo],
    cancel: &AtomicBool,
) -> Result<Vec<i64>> {
    let mut failed = Vec::new();
    let mut window = PartReadSeeker::new(file, 0, 0);

    for idx in 0..parts.len() {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::State("upload cancelled".into()));
        }
        let (start, end) = part_window(parts, idx);
        let p = &mut parts[idx];
        if p.status == PartStatus::Uploaded {
            log::info!("{iso_filename}'s part {} was uploaded, skipping", p.part_no);
            continue;
        }
        log::info!("uploading {iso_filename}'s part {} [{start}, {end}]", p.part_no);

        window.set_start_end(start, end);
        let mut body = Vec::with_capacity((end - start) as usize);
        window.read_to_end(&mut body)?;
        save_part(opts, iso_filename, p.part_no, &body)?;

        match store.upload_part(request, p.part_no, &body, &p.hash_remote) {
            Ok(etag) => {
                p.etag = etag.clone();
                p.status = PartStatus::Uploaded;
                catalog.update_part_etag_status(p.iso_id, p.part_no, &etag, PartStatus::Uploaded)?;
                log::info!("uploading {iso_filename}'s part {} is done", p.part_no);
            }
            Err(e) => {
                log::warn!("upload {iso_filename}'s part {}: {e}", p.part_no);
                failed.push(p.part_no);
                catalog.update_part_status(p.iso_id, p.part_no, PartStatus::UploadFailed)?;
            }
        }
    }
    Ok(failed)
}

/// Fan pending parts over `opts.threads` workers, each with its own file
/// handle.  Catalog writes stay on this thread.
#[allow(clippy::too_many_arguments)]
fn upload_pending_parallel(
    catalog: &mut Catalog,
    store: &(dyn ObjectStore + Sync),
    opts: &UploadOptions,
    iso_filename: &str,
    request: &UploadRequest,
    parts: &mut [PartInfo],
    cancel: &AtomicBool,
) -> Result<Vec<i64>> {
    struct Job {
        part_no:  i64,
        start:    u64,
        end:      u64,
        checksum: String,
    }

    let jobs: Vec<Job> = (0..parts.len())
        .filter(|&i| parts[i].status != PartStatus::Uploaded)
        .map(|i| {
            let (start, end) = part_window(parts, i);
            Job { part_no: parts[i].part_no, start, end, checksum: parts[i].hash_remote.clone() }
        })
        .collect();
    let pending = jobs.len();

    let (job_tx, job_rx) = bounded::<Job>(opts.threads);
    let (res_tx, res_rx) = bounded::<(i64, Result<String>)>(opts.threads);

    let mut failed = Vec::new();
    thread::scope(|s| -> Result<()> {
        for _ in 0..opts.threads {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            s.spawn(move || {
                let file = match File::open(iso_filename) {
                    Ok(f) => f,
                    Err(e) => {
                        for job in job_rx {
                            let _ = res_tx.send((job.part_no, Err(Error::Io(
                                std::io::Error::new(e.kind(), e.to_string()),
                            ))));
                        }
                        return;
                    }
                };
                for job in job_rx {
                    let mut body = Vec::with_capacity((job.end - job.start) as usize);
                    let outcome = PartReadSeeker::new(&file, job.start, job.end)
                        .read_to_end(&mut body)
                        .map_err(Error::from)
                        .and_then(|_| {
                            save_part(opts, iso_filename, job.part_no, &body)?;
                            store.upload_part(request, job.part_no, &body, &job.checksum)
                        });
                    if res_tx.send((job.part_no, outcome)).is_err() {
                        return;
                    }
                }
            });
        }
        drop(job_rx);
        drop(res_tx);

        let feeder = s.spawn(move || {
            for job in jobs {
                if cancel.load(Ordering::Relaxed) || job_tx.send(job).is_err() {
                    return;
                }
            }
        });

        for (part_no, outcome) in res_rx.iter().take(pending) {
            let idx = parts.iter().position(|p| p.part_no == part_no);
            let Some(idx) = idx else { continue };
            match outcome {
                Ok(etag) => {
                    parts[idx].etag = etag.clone();
                    parts[idx].status = PartStatus::Uploaded;
                    catalog.update_part_etag_status(
                        parts[idx].iso_id,
                        part_no,
                        &etag,
                        PartStatus::Uploaded,
                    )?;
                }
                Err(e) => {
                    log::warn!("upload {iso_filename}'s part {part_no}: {e}");
                    failed.push(part_no);
                    catalog.update_part_status(parts[idx].iso_id, part_no, PartStatus::UploadFailed)?;
                }
            }
        }
        let _ = feeder.join();
        Ok(())
    })?;

    if cancel.load(Ordering::Relaxed) {
        return Err(Error::State("upload cancelled".into()));
    }
    // parts the feeder never handed out count as failed-to-attempt
    for p in parts.iter() {
        if p.status != PartStatus::Uploaded && !failed.contains(&p.part_no) {
            failed.push(p.part_no);
        }
    }
    Ok(failed)
}

// ── Encrypted part loop ──────────────────────────────────────────────────────

fn upload_encrypted_parts(
    catalog: &mut Catalog,
    store: &(dyn ObjectStore + Sync),
    opts: &UploadOptions,
    iso_filename: &str,
    passphrase: &str,
    cancel: &AtomicBool,
) -> Result<()> {
    let (file, mut iso, mut parts) =
        prepare_upload_parts(catalog, iso_filename, opts.part_size, false)?;

    // The salt comes from the plaintext hash: identical volume, identical
    // ciphertext, comparable remote checksum.
    let salt = crypto::salt_from_hex_hash(&iso.hash_local)?;
    let key = crypto::derive_key(passphrase, &salt)?;

    // compare against the on-wire size from here on
    iso.size += SALT_LEN as i64;
    iso.hash_remote = String::new();

    let Some(request) = prepare_upload_request(catalog, store, opts, &mut iso, opts.force)?
    else {
        println!(
            "{iso_filename} is already in region {}, bucket {}, no need upload again!",
            opts.region, opts.bucket
        );
        return Ok(());
    };
    catalog.update_iso_status(iso.id, IsoStatus::Uploading)?;

    let mut encryptor = EncryptingReader::new(&file, &key, &salt, true)?;
    let mut parts_hash: Vec<[u8; 32]> = Vec::with_capacity(parts.len());
    let mut failed = Vec::new();

    for idx in 0..parts.len() {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::State("upload cancelled".into()));
        }
        let (start, end) = part_window(&parts, idx);
        let p = &mut parts[idx];

        if p.status == PartStatus::Uploaded {
            log::info!("{iso_filename}'s part {} was uploaded, skipping", p.part_no);
            let digest: [u8; 32] = hash::decode_base64(&p.hash_remote)?
                .try_into()
                .map_err(|_| Error::mismatch("part digest length", 32, p.hash_remote.len()))?;
            parts_hash.push(digest);
            continue;
        }
        log::info!("uploading {iso_filename}'s part {} [{start}, {end}]", p.part_no);

        // jump the keystream to this part's ciphertext offset (skipped
        // parts leave the cursor behind)
        encryptor.seek(SeekFrom::Start(start))?;
        let mut body = vec![0u8; (end - start) as usize];
        encryptor.read_exact(&mut body)?;
        save_part(opts, iso_filename, p.part_no, &body)?;

        let digest = hash::hash_bytes(&body);
        p.hash_remote = hash::to_base64(&digest);

        match store.upload_part(&request, p.part_no, &body, &p.hash_remote) {
            Ok(etag) => {
                p.etag = etag.clone();
                p.status = PartStatus::Uploaded;
                parts_hash.push(digest);
                catalog.update_part_etag_status_hash(
                    p.iso_id,
                    p.part_no,
                    &etag,
                    &p.hash_local,
                    &p.hash_remote,
                    PartStatus::Uploaded,
                )?;
                log::info!("uploading {iso_filename}'s part {} is done", p.part_no);
            }
            Err(e) => {
                log::warn!("upload {iso_filename}'s part {}: {e}", p.part_no);
                failed.push(p.part_no);
                catalog.update_part_status(p.iso_id, p.part_no, PartStatus::UploadFailed)?;
            }
        }
    }

    if !failed.is_empty() {
        return Err(Error::State(format!("parts {failed:?} failed to upload")));
    }

    let whole = hash::concat_base64(&parts_hash);
    finish_upload(store, opts, &iso, &request, &parts, &whole)?;
    catalog.update_iso_status_remote_hash(iso.id, IsoStatus::Uploaded, &whole)?;
    Ok(())
}

fn finish_upload(
    store: &(dyn ObjectStore + Sync),
    opts: &UploadOptions,
    iso: &IsoInfo,
    request: &UploadRequest,
    parts: &[PartInfo],
    whole_checksum: &str,
) -> Result<()> {
    let completed: Vec<CompletedPart> = parts
        .iter()
        .map(|p| CompletedPart {
            part_no:  p.part_no,
            etag:     p.etag.clone(),
            checksum: p.hash_remote.clone(),
        })
        .collect();

    store.complete(request, &completed, whole_checksum)?;
    println!(
        "{} is uploaded to region {}, bucket {} successfully!",
        iso.name, opts.region, opts.bucket
    );
    Ok(())
}

fn save_part(opts: &UploadOptions, iso_filename: &str, part_no: i64, body: &[u8]) -> Result<()> {
    if opts.save_parts {
        fs::write(format!("{iso_filename}.part{part_no}"), body)?;
    }
    Ok(())
}

// ── Metadata sidecar ─────────────────────────────────────────────────────────

pub fn metafile_name(iso_filename: &str) -> String {
    format!("{iso_filename}.meta.txt")
}

/// Generate the tree listing of the ISO's contents from the catalog.
pub fn gen_tree_in_iso(catalog: &mut Catalog, iso_filename: &str) -> Result<String> {
    let iso = catalog
        .get_iso_by_name(iso_filename)?
        .ok_or_else(|| Error::NotFound(format!("ISO {iso_filename}")))?;
    let files = catalog.list_files_by_iso_id(iso.id)?;
    let roots = catalog.list_scan_root_dirs()?;
    Ok(packer::tree_listing(&roots, &files))
}

/// Ensure the local `.meta.txt` matches the catalog-derived listing,
/// recreating it when missing or different.
fn validate_iso_metafile(meta_filename: &str, tree: &[u8]) -> Result<()> {
    match fs::read(meta_filename) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::write(meta_filename, tree)?;
        }
        Err(e) => return Err(e.into()),
        Ok(existing) if existing == tree => {}
        Ok(_) => {
            log::warn!("existing meta file {meta_filename} has different content, recreating");
            fs::write(meta_filename, tree)?;
        }
    }
    Ok(())
}

/// Upload the sidecar, encrypted iff the ISO upload is, skipping when the
/// remote checksum already matches.
fn upload_iso_metafile(
    catalog: &mut Catalog,
    store: &(dyn ObjectStore + Sync),
    opts: &UploadOptions,
    iso_filename: &str,
) -> Result<()> {
    let tree = gen_tree_in_iso(catalog, iso_filename)?.into_bytes();
    let meta_filename = metafile_name(iso_filename);
    validate_iso_metafile(&meta_filename, &tree)?;

    let key = object_key(&meta_filename);
    let (body, checksum) = match &opts.master_key {
        None => {
            let checksum = hash::to_base64(&hash::hash_bytes(&tree));
            (tree, checksum)
        }
        Some(passphrase) => {
            // deterministic salt from the plaintext hash keeps the remote
            // checksum stable across runs
            let salt = crypto::salt_from_hex_hash(&hash::to_hex(&hash::hash_bytes(&tree)))?;
            let cipher_key = crypto::derive_key(passphrase, &salt)?;
            let mut enc = EncryptingReader::new(std::io::Cursor::new(&tree), &cipher_key, &salt, true)?;
            let mut body = Vec::with_capacity(tree.len() + SALT_LEN);
            enc.read_to_end(&mut body)?;
            let checksum = hash::to_base64(&enc.hash_cipher());
            (body, checksum)
        }
    };

    if let Some(remote) = store.head(&opts.bucket, &key)? {
        let remote_hash = remote.checksum_sha256.split('-').next().unwrap_or_default();
        if remote_hash == checksum {
            log::debug!("metadata file {key} already up to date remotely");
            return Ok(());
        }
        log::warn!("metadata file {key} differs remotely, re-uploading");
    }

    println!(
        "Uploading {} metadata file {meta_filename}",
        if opts.master_key.is_some() { "encrypted" } else { "un-encrypted" }
    );
    store.put(&opts.bucket, &key, &body, &checksum, CONTENT_TYPE_TEXT, &opts.storage_class)
}

// ── Abort ────────────────────────────────────────────────────────────────────

/// Abort one upload by `(key, upload_id)`, or every in-progress upload for
/// `key` when no id is given.  Idempotent.
pub fn abort_upload(
    store: &(dyn ObjectStore + Sync),
    bucket: &str,
    upload_key: &str,
    upload_id: Option<&str>,
) -> Result<()> {
    if let Some(id) = upload_id {
        store.abort(&UploadRequest {
            bucket:    bucket.to_string(),
            key:       upload_key.to_string(),
            upload_id: id.to_string(),
        })?;
        println!("abort upload success");
        return Ok(());
    }

    let requests = store.list_multipart(bucket)?;
    if requests.is_empty() {
        println!("no in progress multipart upload to abort");
        return Ok(());
    }
    for r in requests.iter().filter(|r| r.key == upload_key) {
        let outcome = store.abort(&UploadRequest {
            bucket:    bucket.to_string(),
            key:       r.key.clone(),
            upload_id: r.upload_id.clone(),
        });
        match outcome {
            Ok(()) => println!("abort upload ID {} success!", r.upload_id),
            Err(e) => println!("abort upload ID {}: {e}", r.upload_id),
        }
    }
    Ok(())
}

pub fn list_inprogress_uploads(
    store: &(dyn ObjectStore + Sync),
    bucket: &str,
) -> Result<Vec<MultipartUpload>> {
    store.list_multipart(bucket)
}
