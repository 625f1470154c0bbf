//! ISO packing: select catalogued files up to a target size, stage them
//! with their timestamps intact, emit an ISO 9660 image, and record the
//! volume atomically.
//!
//! Staging layout: each scan root becomes one top-level directory named by
//! the root path with separators flattened to `_`, so every local root maps
//! to exactly one directory inside the volume.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use walkdir::WalkDir;

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::hash;
use crate::isowriter::IsoWriter;
use crate::types::{FileInfo, IsoInfo};

/// Volume identifier prefix of every emitted image.
pub const VOLUME_PREFIX: &str = "lomorage: ";

/// Replace path separators so a root path becomes a single path component.
pub fn flatten_root(root: &str) -> String {
    root.trim_matches(MAIN_SEPARATOR).replace(MAIN_SEPARATOR, "_")
}

/// Pack files with `iso_id = 0` into ISO volumes of at least `iso_size`
/// plaintext bytes each, looping until the remainder falls below the
/// target.  A caller-supplied `filename` makes it one-shot.
pub fn mk_iso(
    catalog: &mut Catalog,
    writer: &dyn IsoWriter,
    iso_size: u64,
    filename: Option<String>,
) -> Result<()> {
    if let Some(name) = &filename {
        refuse_existing(catalog, name)?;
    }

    let roots = catalog.list_scan_root_dirs()?;
    let mut files = catalog.list_files_not_in_iso_and_cloud()?;

    loop {
        let total = catalog.total_file_size_not_in_iso()?;
        if total < iso_size {
            println!(
                "Total size of un-backedup files is {}, less than {}, skip",
                ByteSize(total),
                ByteSize(iso_size)
            );
            return Ok(());
        }

        let staged = stage_window(&roots, &files, iso_size)?;
        if !staged.missing_ids.is_empty() {
            let deleted = catalog.delete_files(&staged.missing_ids)?;
            log::info!("dropped {deleted} vanished files from the catalog");
        }
        if staged.size < iso_size {
            // too many files vanished to reach the target this round
            log::warn!(
                "only {} of staged data available, below target {}",
                ByteSize(staged.size),
                ByteSize(iso_size)
            );
            return Ok(());
        }

        let name = match &filename {
            Some(n) => n.clone(),
            None => {
                let n = date_range_name(staged.earliest, staged.latest);
                refuse_existing(catalog, &n)?;
                n
            }
        };
        let volume_id = format!("{VOLUME_PREFIX}{}", name.trim_end_matches(".iso"));

        writer.write_image(&volume_id, Path::new(&name), staged.dir.path())?;

        let iso_bytes = fs::metadata(&name)?.len() as i64;
        let digest = hash::hash_file(&name)?;
        let iso = IsoInfo {
            name:       name.clone(),
            size:       iso_bytes,
            hash_local: hash::to_hex(&digest),
            ..IsoInfo::default()
        };
        let (iso_id, updated) = catalog.create_iso_with_file_ids(&iso, &staged.file_ids)?;
        if updated != staged.file_ids.len() {
            log::warn!(
                "expected to update {} files for ISO {iso_id}, updated {updated}",
                staged.file_ids.len()
            );
        }
        log::info!(
            "{} files ({}) are added into {name}",
            staged.file_ids.len(),
            ByteSize(staged.size)
        );

        files.drain(..staged.consumed);
        if filename.is_some() {
            if !files.is_empty() {
                println!("Please supply another filename");
            }
            return Ok(());
        }
        if files.is_empty() {
            return Ok(());
        }
    }
}

fn refuse_existing(catalog: &mut Catalog, name: &str) -> Result<()> {
    if let Some(iso) = catalog.get_iso_by_name(name)? {
        return Err(Error::UserInput(format!(
            "{name} was created at {}, and its size is {}",
            iso.create_time.map(|t| t.to_string()).unwrap_or_default(),
            ByteSize(iso.size as u64)
        )));
    }
    Ok(())
}

struct StagedWindow {
    dir:         tempfile::TempDir,
    file_ids:    Vec<i64>,
    missing_ids: Vec<i64>,
    /// Candidates consumed from the input slice, staged or skipped.
    consumed:    usize,
    size:        u64,
    earliest:    Option<DateTime<Utc>>,
    latest:      Option<DateTime<Utc>>,
}

/// Copy candidate files into a fresh staging dir until their cumulative
/// plaintext size reaches `target`, preserving access/modification times on
/// files and (afterwards, deepest first) directories.
fn stage_window(
    roots: &HashMap<i64, String>,
    files: &[FileInfo],
    target: u64,
) -> Result<StagedWindow> {
    let staging = tempfile::tempdir()?;
    let mut out = StagedWindow {
        dir:         staging,
        file_ids:    Vec::new(),
        missing_ids: Vec::new(),
        consumed:    0,
        size:        0,
        earliest:    None,
        latest:      None,
    };

    for f in files {
        out.consumed += 1;

        let Some(root_path) = roots.get(&f.dir_id) else {
            log::warn!("{}: scan root {} not found", f.name, f.dir_id);
            continue;
        };
        let src = Path::new(root_path).join(&f.name);
        if !src.exists() {
            log::warn!("{} no longer exists, skipping", src.display());
            out.missing_ids.push(f.id);
            continue;
        }

        let dst = out.dir.path().join(flatten_root(root_path)).join(&f.name);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&src, &dst)?;
        copy_times(&src, &dst)?;

        out.file_ids.push(f.id);
        out.size += f.size as u64;
        out.earliest = min_time(out.earliest, f.mod_time);
        out.latest = max_time(out.latest, f.mod_time);

        if out.size >= target {
            break;
        }
    }

    copy_dir_times(out.dir.path(), roots)?;
    Ok(out)
}

fn copy_times(src: &Path, dst: &Path) -> Result<()> {
    let meta = src.metadata()?;
    filetime::set_file_times(
        dst,
        FileTime::from_last_access_time(&meta),
        FileTime::from_last_modification_time(&meta),
    )?;
    Ok(())
}

/// Stamp staged directories with their source times, deepest first so
/// parent updates are not clobbered by child writes.
fn copy_dir_times(staging: &Path, roots: &HashMap<i64, String>) -> Result<()> {
    let by_flat: HashMap<String, &String> =
        roots.values().map(|p| (flatten_root(p), p)).collect();

    let mut dirs: Vec<PathBuf> = WalkDir::new(staging)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && e.path() != staging)
        .map(|e| e.path().to_path_buf())
        .collect();
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));

    for dir in dirs {
        let rel = match dir.strip_prefix(staging) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let mut comps = rel.components();
        let Some(flat) = comps.next().map(|c| c.as_os_str().to_string_lossy().to_string())
        else {
            continue;
        };
        let Some(root_path) = by_flat.get(&flat) else { continue };
        let src = Path::new(root_path.as_str()).join(comps.as_path());
        if src.is_dir() {
            copy_times(&src, &dir)?;
        }
    }
    Ok(())
}

fn min_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

fn max_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

fn date_range_name(earliest: Option<DateTime<Utc>>, latest: Option<DateTime<Utc>>) -> String {
    let fmt = |t: Option<DateTime<Utc>>| {
        t.unwrap_or_else(Utc::now).format("%Y-%m-%d").to_string()
    };
    format!("{}--{}.iso", fmt(earliest), fmt(latest))
}

// ── Volume listings ──────────────────────────────────────────────────────────

/// Human-readable tree of an ISO's contents, one scan root per section.
/// Also the canonical content of the `.meta.txt` sidecar.
pub fn tree_listing(roots: &HashMap<i64, String>, files: &[FileInfo]) -> String {
    let mut by_root: BTreeMap<i64, Vec<&FileInfo>> = BTreeMap::new();
    for f in files {
        by_root.entry(f.dir_id).or_default().push(f);
    }

    let mut out = String::new();
    for (root_id, mut group) in by_root {
        let flat = roots
            .get(&root_id)
            .map(|p| flatten_root(p))
            .unwrap_or_else(|| format!("root-{root_id}"));
        out.push_str(&flat);
        out.push('\n');

        group.sort_by(|a, b| a.name.cmp(&b.name));
        let mut seen_dirs: BTreeSet<String> = BTreeSet::new();
        for f in group {
            let path = Path::new(&f.name);
            let mut prefix = PathBuf::new();
            let mut depth = 1;
            if let Some(parent) = path.parent() {
                for comp in parent.components() {
                    prefix.push(comp);
                    let key = prefix.to_string_lossy().to_string();
                    if !key.is_empty() && seen_dirs.insert(key) {
                        out.push_str(&"  ".repeat(depth));
                        out.push_str(&comp.as_os_str().to_string_lossy());
                        out.push_str("/\n");
                    }
                    depth += 1;
                }
            }
            let fname = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            let when = f
                .mod_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            out.push_str(&"  ".repeat(depth));
            out.push_str(&format!("{fname} ({} bytes, {when})\n", f.size));
        }
    }
    out
}
