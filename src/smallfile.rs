//! Mirror un-packed files into the document store, one at a time.
//!
//! Each scan root becomes a single remote folder (separators flattened to
//! `_`) under the configured root folder; the local hierarchy below it is
//! recreated level by level, memoised in-process so every folder is checked
//! at most once per run.  Serial on purpose: the memo map and the
//! document-store API both dislike concurrent creation.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::catalog::Catalog;
use crate::clients::DocStore;
use crate::crypto::{self, EncryptingReader};
use crate::error::{Error, Result};
use crate::hash;
use crate::packer::flatten_root;
use crate::types::{META_KEY_HASH_ENCRYPT, META_KEY_HASH_ORIG, ISO_ID_CLOUD};

struct CloudDir {
    folder_id: String,
}

/// Upload every file with `iso_id = 0` into the document store under
/// `root_folder`, encrypting when a passphrase is given.  On success the
/// file is marked with the cloud sentinel and its remote ciphertext digest.
pub fn upload_files(
    catalog: &mut Catalog,
    doc: &mut dyn DocStore,
    root_folder: &str,
    master_key: Option<&str>,
    cancel: &AtomicBool,
) -> Result<()> {
    let (existed, root_id) = doc.get_or_create_folder(root_folder, None, Some(Utc::now()))?;
    if !existed {
        log::info!("root folder '{root_folder}' does not exist, created");
    }

    let scan_roots = catalog.list_scan_root_dirs()?;
    let files = catalog.list_files_not_in_iso_and_cloud()?;

    let mut cloud_dirs: HashMap<String, CloudDir> = HashMap::new();
    cloud_dirs.insert(String::new(), CloudDir { folder_id: root_id });

    for f in &files {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::State("upload cancelled".into()));
        }

        let scan_root = scan_roots
            .get(&f.dir_id)
            .ok_or_else(|| Error::NotFound(format!("scan root directory {}", f.dir_id)))?;

        let parent_id = ensure_remote_dirs(doc, &mut cloud_dirs, scan_root, &f.name)?;

        let full_path = Path::new(scan_root).join(&f.name);
        let reader = File::open(&full_path)?;
        let mod_time: Option<DateTime<Utc>> =
            reader.metadata()?.modified().ok().map(DateTime::from);
        let filename = Path::new(&f.name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| f.name.clone());

        log::info!("uploading {} into {parent_id}:{filename}", full_path.display());

        let (ref_id, hash_remote, hash_enc_hex) = match master_key {
            Some(passphrase) => {
                // Encrypt into a spooled temp file first so both digests are
                // known before the body streams out.
                let salt = crypto::random_salt();
                let key = crypto::derive_key(passphrase, &salt)?;
                let mut enc = EncryptingReader::new(reader, &key, &salt, true)?;
                let mut spool = tempfile::tempfile()?;
                io::copy(&mut enc, &mut spool)?;

                let plain_hex = hash::to_hex(&enc.hash_plain());
                if plain_hex != f.hash_local {
                    log::warn!(
                        "{} changed since scan (catalog {}, disk {plain_hex})",
                        full_path.display(),
                        f.hash_local
                    );
                }
                let cipher = enc.hash_cipher();
                spool.seek(SeekFrom::Start(0))?;

                let id = doc.create_file(&filename, Some(&parent_id), Box::new(spool), mod_time)?;
                (id, hash::to_base64(&cipher), Some(hash::to_hex(&cipher)))
            }
            None => {
                let id =
                    doc.create_file(&filename, Some(&parent_id), Box::new(reader), mod_time)?;
                let digest = hex::decode(&f.hash_local)
                    .map_err(|e| Error::State(format!("bad catalog hash for {filename}: {e}")))?;
                (id, hash::to_base64(&digest), None)
            }
        };

        // make the remote object self-describing
        let mut props: Vec<(&str, &str)> = vec![(META_KEY_HASH_ORIG, f.hash_local.as_str())];
        if let Some(enc_hex) = &hash_enc_hex {
            props.push((META_KEY_HASH_ENCRYPT, enc_hex.as_str()));
        }
        doc.update_app_properties(&ref_id, &props)?;

        catalog.update_file_iso_id_and_remote_hash(ISO_ID_CLOUD, f.id, &hash_remote, &ref_id)?;
        log::info!("uploading {} succeeded", full_path.display());
    }
    Ok(())
}

/// Create (or find) the remote folder chain for one file, returning the id
/// of its direct parent.  `rel_name` is the root-relative file path.
fn ensure_remote_dirs(
    doc: &mut dyn DocStore,
    cloud_dirs: &mut HashMap<String, CloudDir>,
    scan_root: &str,
    rel_name: &str,
) -> Result<String> {
    let flat = flatten_root(scan_root);

    let mut folder_key = flat.clone();
    let mut orig = Path::new(scan_root).to_path_buf();
    let mut parent_id = match cloud_dirs.get(&folder_key) {
        Some(d) => d.folder_id.clone(),
        None => {
            let mod_time = orig.metadata()?.modified().ok().map(DateTime::from);
            let root_id = cloud_dirs
                .get("")
                .map(|d| d.folder_id.clone())
                .ok_or_else(|| Error::State("remote root folder not resolved".into()))?;
            let (existed, id) = doc.get_or_create_folder(&flat, Some(&root_id), mod_time)?;
            if !existed {
                log::info!("folder '{flat}' does not exist, created");
            }
            cloud_dirs.insert(folder_key.clone(), CloudDir { folder_id: id.clone() });
            id
        }
    };

    let Some(rel_dir) = Path::new(rel_name).parent() else {
        return Ok(parent_id);
    };
    for comp in rel_dir.components() {
        let name = comp.as_os_str().to_string_lossy().to_string();
        orig.push(&name);
        folder_key.push('/');
        folder_key.push_str(&name);

        parent_id = match cloud_dirs.get(&folder_key) {
            Some(d) => d.folder_id.clone(),
            None => {
                let mod_time = orig.metadata()?.modified().ok().map(DateTime::from);
                let (existed, id) = doc.get_or_create_folder(&name, Some(&parent_id), mod_time)?;
                if !existed {
                    log::info!("folder '{folder_key}' does not exist, created with ID '{id}'");
                }
                cloud_dirs.insert(folder_key.clone(), CloudDir { folder_id: id.clone() });
                id
            }
        };
    }
    Ok(parent_id)
}
