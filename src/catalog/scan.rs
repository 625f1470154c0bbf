//! Catalog operations backing the scanner and the listing commands.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{placeholders, Catalog};
use crate::error::Result;
use crate::types::{DirInfo, FileInfo, SUPER_SCAN_ROOT_DIR_ID};

impl Catalog {
    // ── Dirs ─────────────────────────────────────────────────────────────────

    pub fn get_dir_id(&mut self, path: &str, scan_root_dir_id: i64) -> Result<Option<i64>> {
        self.with_tx(&format!("get dir id {scan_root_dir_id}/{path}"), |tx| {
            tx.query_row(
                "SELECT id FROM dirs WHERE path = ? AND scan_root_dir_id = ?",
                params![path, scan_root_dir_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn insert_dir(
        &mut self,
        path: &str,
        scan_root_dir_id: i64,
        mod_time: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        self.with_tx(&format!("insert dir {scan_root_dir_id}/{path}"), |tx| {
            tx.execute(
                "INSERT INTO dirs (path, scan_root_dir_id, mod_time, create_time) VALUES (?, ?, ?, ?)",
                params![path, scan_root_dir_id, mod_time, Utc::now()],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Existing id for `(path, scan_root_dir_id)`, inserting when absent.
    pub fn get_or_insert_dir(
        &mut self,
        path: &str,
        scan_root_dir_id: i64,
        mod_time: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        if let Some(id) = self.get_dir_id(path, scan_root_dir_id)? {
            return Ok(id);
        }
        self.insert_dir(path, scan_root_dir_id, mod_time)
    }

    pub fn update_dir_mod_time(&mut self, dir_id: i64, mod_time: DateTime<Utc>) -> Result<()> {
        self.with_tx(&format!("update dir {dir_id} mod time"), |tx| {
            tx.execute("UPDATE dirs SET mod_time = ? WHERE id = ?", params![mod_time, dir_id])?;
            Ok(())
        })
    }

    /// Scan roots: `id → path` for every dir with `scan_root_dir_id = 0`.
    pub fn list_scan_root_dirs(&mut self) -> Result<HashMap<i64, String>> {
        self.with_tx("list scan root dirs", |tx| {
            let mut stmt =
                tx.prepare("SELECT id, path FROM dirs WHERE scan_root_dir_id = ?")?;
            let rows = stmt.query_map([SUPER_SCAN_ROOT_DIR_ID], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect()
        })
    }

    /// Every directory with per-dir file aggregates; `child_dir_count` is
    /// derived from path prefixes within the same scan root.
    pub fn list_dirs(&mut self) -> Result<Vec<DirInfo>> {
        let mut dirs = self.with_tx("list dirs", |tx| {
            let mut stmt = tx.prepare(
                "SELECT d.id, d.path, d.scan_root_dir_id, d.mod_time, d.create_time,
                        COUNT(f.id), COALESCE(SUM(f.size), 0)
                 FROM dirs AS d LEFT JOIN files AS f ON f.dir_id = d.id
                 GROUP BY d.id ORDER BY d.scan_root_dir_id, d.path",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(DirInfo {
                    id:               row.get(0)?,
                    path:             row.get(1)?,
                    scan_root_dir_id: row.get(2)?,
                    mod_time:         row.get(3)?,
                    create_time:      row.get(4)?,
                    file_count:       row.get(5)?,
                    total_file_size:  row.get(6)?,
                    child_dir_count:  0,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let counts: Vec<i64> = dirs
            .iter()
            .map(|dir| {
                dirs.iter()
                    .filter(|d| {
                        if d.id == dir.id {
                            return false;
                        }
                        if dir.scan_root_dir_id == SUPER_SCAN_ROOT_DIR_ID {
                            // children of a scan root carry its id
                            d.scan_root_dir_id == dir.id && !d.path.contains('/')
                        } else {
                            d.scan_root_dir_id == dir.scan_root_dir_id
                                && Path::new(&d.path).parent() == Some(Path::new(&dir.path))
                        }
                    })
                    .count() as i64
            })
            .collect();
        for (dir, n) in dirs.iter_mut().zip(counts) {
            dir.child_dir_count = n;
        }
        Ok(dirs)
    }

    // ── Files ────────────────────────────────────────────────────────────────

    pub fn get_file_by_name_and_dir(
        &mut self,
        name: &str,
        dir_id: i64,
    ) -> Result<Option<FileInfo>> {
        self.with_tx(&format!("get file {dir_id}/{name}"), |tx| {
            tx.query_row(
                "SELECT id, iso_id, size, hash_local, hash_remote, ref_id, mod_time FROM files
                 WHERE name = ? AND dir_id = ?",
                params![name, dir_id],
                |row| {
                    Ok(FileInfo {
                        id:          row.get(0)?,
                        dir_id,
                        iso_id:      row.get(1)?,
                        size:        row.get(2)?,
                        hash_local:  row.get(3)?,
                        hash_remote: row.get(4)?,
                        ref_id:      row.get(5)?,
                        mod_time:    row.get(6)?,
                        name:        name.to_string(),
                    })
                },
            )
            .optional()
        })
    }

    /// Fast existence probe used by scanner workers before hashing: resolves
    /// the dir by `(path, scan_root)` instead of needing a dir id.
    pub fn get_file_id_by_name_and_dir_path(
        &mut self,
        name: &str,
        dir_path: &str,
        scan_root_dir_id: i64,
    ) -> Result<Option<i64>> {
        self.with_tx(&format!("probe file {dir_path}/{name}"), |tx| {
            tx.query_row(
                "SELECT f.id FROM files AS f INNER JOIN dirs AS d ON f.dir_id = d.id
                 WHERE f.name = ? AND d.path = ? AND d.scan_root_dir_id = ?",
                params![name, dir_path, scan_root_dir_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn insert_file(&mut self, f: &FileInfo) -> Result<i64> {
        let ext = Path::new(&f.name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.with_tx(&format!("insert file {}/{}", f.dir_id, f.name), |tx| {
            tx.execute(
                "INSERT OR IGNORE INTO files
                   (dir_id, name, ext, size, hash_local, mod_time, create_time)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![f.dir_id, f.name, ext, f.size, f.hash_local, f.mod_time, Utc::now()],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Files at least `min_size` bytes, largest first.  `name` is the path
    /// relative to the scan root; `dir_id` carries the scan root id.
    pub fn list_files_by_min_size(&mut self, min_size: i64) -> Result<Vec<FileInfo>> {
        self.with_tx("list files by size", |tx| {
            let mut stmt = tx.prepare(
                "SELECT d.scan_root_dir_id, d.path, f.name, f.id, f.size FROM files AS f
                 INNER JOIN dirs AS d ON f.dir_id = d.id
                 WHERE f.size >= ? ORDER BY f.size DESC",
            )?;
            let rows = stmt.query_map([min_size], |row| {
                let root: i64 = row.get(0)?;
                let path: String = row.get(1)?;
                let name: String = row.get(2)?;
                Ok(FileInfo {
                    id:     row.get(3)?,
                    dir_id: root,
                    size:   row.get(4)?,
                    name:   join_rel(&path, &name),
                    ..FileInfo::default()
                })
            })?;
            rows.collect()
        })
    }

    /// Delete catalog entries for files that vanished on disk, one batch.
    pub fn delete_files(&mut self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM files WHERE id IN ({})", placeholders(ids.len()));
        self.with_tx("delete files", |tx| {
            tx.execute(&sql, rusqlite::params_from_iter(ids.iter()))
        })
    }
}

/// Join a dir path (relative to scan root, may be empty) and a file name.
pub(crate) fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}
