//! Parallel tree walk feeding the catalog.
//!
//! One walker enumerates the tree and hands candidate files to a bounded
//! worker pool; each worker probes the catalog through its own connection
//! and hashes only files not yet recorded.  A single writer task owns the
//! dir-path→id cache and performs every catalog write, so directory
//! creation has exactly one owner.  Busy contention between the
//! connections is absorbed by the catalog's retry loop.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use walkdir::WalkDir;

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::hash;
use crate::types::{FileInfo, SUPER_SCAN_ROOT_DIR_ID};

pub struct ScanOptions {
    pub workers:      usize,
    pub ignore_files: HashSet<String>,
    pub ignore_dirs:  HashSet<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            workers:      20,
            ignore_files: [".DS_Store", "._.DS_Store", "Thumbs.db"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore_dirs:  [".", "..", ".thumbnails"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanSummary {
    pub files_added:   u64,
    pub files_skipped: u64,
    pub errors:        u64,
}

struct Candidate {
    abs_path: PathBuf,
    rel_dir:  String,
    name:     String,
    size:     i64,
    mod_time: Option<DateTime<Utc>>,
}

enum Record {
    Dir {
        rel_path: String,
        mod_time: Option<DateTime<Utc>>,
    },
    File {
        rel_dir:  String,
        name:     String,
        size:     i64,
        mod_time: Option<DateTime<Utc>>,
        hash_hex: String,
    },
}

/// Walk `root`, inserting unseen directories and files into the catalog at
/// `db_path`.  Re-scans are idempotent: files already recorded under their
/// `(name, dir)` are skipped without re-hashing.  Symlinks are never
/// followed; unreadable subtrees are logged and skipped.
pub fn scan_directory(
    db_path: &Path,
    root: &Path,
    opts: &ScanOptions,
    cancel: &AtomicBool,
) -> Result<ScanSummary> {
    let root = root
        .canonicalize()
        .map_err(|e| Error::UserInput(format!("scan root {}: {e}", root.display())))?;
    let root_str = root.to_string_lossy().to_string();

    let mut writer_catalog = Catalog::open(db_path)?;
    let root_mod = mod_time_of(&root);
    let root_id =
        writer_catalog.get_or_insert_dir(&root_str, SUPER_SCAN_ROOT_DIR_ID, root_mod)?;

    let (work_tx, work_rx) = bounded::<Candidate>(opts.workers);
    let (rec_tx, rec_rx) = bounded::<Record>(opts.workers);

    thread::scope(|s| -> Result<ScanSummary> {
        // Writer: owns the dir cache and every catalog write.
        let writer = s.spawn(move || -> Result<u64> {
            let mut catalog = writer_catalog;
            let mut added = 0u64;
            // rel dir path → (id, mod_time already recorded)
            let mut dirs: HashMap<String, (i64, bool)> = HashMap::new();

            for rec in rec_rx {
                match rec {
                    Record::Dir { rel_path, mod_time } => {
                        resolve_dir(&mut catalog, &mut dirs, root_id, &rel_path, mod_time)?;
                    }
                    Record::File { rel_dir, name, size, mod_time, hash_hex } => {
                        let dir_id =
                            resolve_dir(&mut catalog, &mut dirs, root_id, &rel_dir, None)?;
                        catalog.insert_file(&FileInfo {
                            dir_id,
                            name,
                            size,
                            mod_time,
                            hash_local: hash_hex,
                            ..FileInfo::default()
                        })?;
                        added += 1;
                    }
                }
            }
            Ok(added)
        });

        // Workers: existence probe through their own connection, then hash.
        let mut workers = Vec::new();
        for _ in 0..opts.workers.max(1) {
            let work_rx = work_rx.clone();
            let rec_tx = rec_tx.clone();
            let db_path = db_path.to_path_buf();
            workers.push(s.spawn(move || -> (u64, u64) {
                let mut catalog = match Catalog::open(&db_path) {
                    Ok(c) => c,
                    Err(e) => {
                        log::warn!("scan worker cannot open catalog: {e}");
                        return (0, 1);
                    }
                };
                let (mut skipped, mut errors) = (0u64, 0u64);
                for item in work_rx {
                    match catalog.get_file_id_by_name_and_dir_path(
                        &item.name,
                        &item.rel_dir,
                        root_id,
                    ) {
                        Ok(Some(_)) => {
                            log::debug!("already catalogued: {}", item.abs_path.display());
                            skipped += 1;
                            continue;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("probe {}: {e}", item.abs_path.display());
                            errors += 1;
                            continue;
                        }
                    }
                    let digest = match hash::hash_file(&item.abs_path) {
                        Ok(d) => d,
                        Err(e) => {
                            log::warn!("hash {}: {e}", item.abs_path.display());
                            errors += 1;
                            continue;
                        }
                    };
                    let sent = rec_tx.send(Record::File {
                        rel_dir:  item.rel_dir,
                        name:     item.name,
                        size:     item.size,
                        mod_time: item.mod_time,
                        hash_hex: hash::to_hex(&digest),
                    });
                    if sent.is_err() {
                        break;
                    }
                }
                (skipped, errors)
            }));
        }
        drop(work_rx);

        // Walker: runs on the scope thread, feeding both channels.
        let mut walk_errors = 0u64;
        let walker = WalkDir::new(&root).follow_links(false).into_iter();
        let mut it = walker.filter_entry(|e| {
            !(e.file_type().is_dir()
                && opts.ignore_dirs.contains(&e.file_name().to_string_lossy().to_string()))
        });
        loop {
            if cancel.load(Ordering::Relaxed) {
                log::warn!("scan cancelled");
                break;
            }
            let entry = match it.next() {
                None => break,
                Some(Ok(e)) => e,
                Some(Err(e)) => {
                    // permission denied on a subtree is a skip, not a failure
                    log::warn!("walk: {e}");
                    walk_errors += 1;
                    continue;
                }
            };
            if entry.file_type().is_symlink() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&root) {
                Ok(r) => r.to_string_lossy().to_string(),
                Err(_) => continue,
            };
            if rel.is_empty() {
                continue; // the root itself is already recorded
            }
            let mod_time = entry.metadata().ok().and_then(|m| m.modified().ok()).map(DateTime::from);

            if entry.file_type().is_dir() {
                if rec_tx.send(Record::Dir { rel_path: rel, mod_time }).is_err() {
                    break;
                }
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if opts.ignore_files.contains(&name) {
                continue;
            }
            let rel_dir = Path::new(&rel)
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            let size = entry.metadata().map(|m| m.len() as i64).unwrap_or(0);
            let sent = work_tx.send(Candidate {
                abs_path: entry.path().to_path_buf(),
                rel_dir,
                name,
                size,
                mod_time,
            });
            if sent.is_err() {
                break;
            }
        }
        drop(work_tx);
        drop(rec_tx);

        let mut summary = ScanSummary { errors: walk_errors, ..ScanSummary::default() };
        for w in workers {
            if let Ok((skipped, errors)) = w.join() {
                summary.files_skipped += skipped;
                summary.errors += errors;
            }
        }
        summary.files_added =
            writer.join().map_err(|_| Error::State("scan writer panicked".into()))??;
        Ok(summary)
    })
}

fn resolve_dir(
    catalog: &mut Catalog,
    dirs: &mut HashMap<String, (i64, bool)>,
    root_id: i64,
    rel: &str,
    mod_time: Option<DateTime<Utc>>,
) -> Result<i64> {
    if let Some((id, has_mod)) = dirs.get(rel).copied() {
        if !has_mod {
            if let Some(t) = mod_time {
                catalog.update_dir_mod_time(id, t)?;
                dirs.insert(rel.to_string(), (id, true));
            }
        }
        return Ok(id);
    }
    let id = catalog.get_or_insert_dir(rel, root_id, mod_time)?;
    dirs.insert(rel.to_string(), (id, mod_time.is_some()));
    Ok(id)
}

fn mod_time_of(path: &Path) -> Option<DateTime<Utc>> {
    path.metadata().ok().and_then(|m| m.modified().ok()).map(DateTime::from)
}
