//! Catalog operations backing the ISO packer and the multipart uploader.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::scan::join_rel;
use super::{iso_status_from, part_status_from, placeholders, Catalog};
use crate::error::Result;
use crate::types::{FileInfo, IsoInfo, IsoStatus, PartInfo, PartStatus, ISO_ID_CLOUD};

impl Catalog {
    // ── File selection ───────────────────────────────────────────────────────

    /// Candidates for ISO packing: `iso_id = 0`, deterministic
    /// `(dir_id, file_id)` order.  `name` is the root-relative path and
    /// `dir_id` carries the scan root id, ready for the packer's root map.
    pub fn list_files_not_in_iso_and_cloud(&mut self) -> Result<Vec<FileInfo>> {
        self.list_candidates("SELECT d.scan_root_dir_id, d.path, f.name, f.id, f.iso_id, f.size, f.hash_local, f.mod_time
             FROM files AS f INNER JOIN dirs AS d ON f.dir_id = d.id
             WHERE f.iso_id = 0 ORDER BY f.dir_id, f.id")
    }

    /// Candidates for the document store: not packed (`iso_id = 0`) or
    /// already mirrored (`iso_id = -1`), same shape as above.
    pub fn list_files_not_in_iso_or_cloud(&mut self) -> Result<Vec<FileInfo>> {
        self.list_candidates(&format!(
            "SELECT d.scan_root_dir_id, d.path, f.name, f.id, f.iso_id, f.size, f.hash_local, f.mod_time
             FROM files AS f INNER JOIN dirs AS d ON f.dir_id = d.id
             WHERE f.iso_id = 0 OR f.iso_id = {ISO_ID_CLOUD} ORDER BY f.dir_id, f.id"
        ))
    }

    /// Contents of one ISO, root-relative paths, for tree listings.
    pub fn list_files_by_iso_id(&mut self, iso_id: i64) -> Result<Vec<FileInfo>> {
        self.list_candidates(&format!(
            "SELECT d.scan_root_dir_id, d.path, f.name, f.id, f.iso_id, f.size, f.hash_local, f.mod_time
             FROM files AS f INNER JOIN dirs AS d ON f.dir_id = d.id
             WHERE f.iso_id = {iso_id} ORDER BY f.dir_id, f.id"
        ))
    }

    fn list_candidates(&mut self, sql: &str) -> Result<Vec<FileInfo>> {
        self.with_tx("list candidate files", |tx| {
            let mut stmt = tx.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                let root: i64 = row.get(0)?;
                let path: String = row.get(1)?;
                let name: String = row.get(2)?;
                Ok(FileInfo {
                    id:         row.get(3)?,
                    dir_id:     root,
                    iso_id:     row.get(4)?,
                    size:       row.get(5)?,
                    hash_local: row.get(6)?,
                    mod_time:   row.get(7)?,
                    name:       join_rel(&path, &name),
                    ..FileInfo::default()
                })
            })?;
            rows.collect()
        })
    }

    pub fn total_file_size_not_in_iso(&mut self) -> Result<u64> {
        self.with_tx("total file size not in ISO", |tx| {
            tx.query_row(
                "SELECT COALESCE(SUM(size), 0) FROM files WHERE iso_id = 0",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v as u64)
        })
    }

    pub fn total_files_in_iso(&mut self, iso_id: i64) -> Result<(u64, u64)> {
        self.with_tx(&format!("total files in ISO {iso_id}"), |tx| {
            tx.query_row(
                "SELECT COALESCE(SUM(size), 0), COUNT(*) FROM files WHERE iso_id = ?",
                [iso_id],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
            )
        })
    }

    pub fn update_file_iso_id_and_remote_hash(
        &mut self,
        iso_id: i64,
        file_id: i64,
        hash_remote: &str,
        ref_id: &str,
    ) -> Result<()> {
        self.with_tx(&format!("file {file_id} iso id {iso_id}"), |tx| {
            tx.execute(
                "UPDATE files SET iso_id = ?, hash_remote = ?, ref_id = ? WHERE id = ?",
                params![iso_id, hash_remote, ref_id, file_id],
            )?;
            Ok(())
        })
    }

    // ── ISOs ─────────────────────────────────────────────────────────────────

    pub fn get_iso_by_name(&mut self, name: &str) -> Result<Option<IsoInfo>> {
        self.with_tx(&format!("get ISO {name}"), |tx| {
            tx.query_row(
                "SELECT id, size, status, hash_local, hash_remote, region, bucket,
                        upload_key, upload_id, create_time
                 FROM isos WHERE name = ?",
                [name],
                |row| {
                    Ok(IsoInfo {
                        id:          row.get(0)?,
                        name:        name.to_string(),
                        size:        row.get(1)?,
                        status:      Some(iso_status_from(row.get(2)?)?),
                        hash_local:  row.get(3)?,
                        hash_remote: row.get(4)?,
                        region:      row.get(5)?,
                        bucket:      row.get(6)?,
                        upload_key:  row.get(7)?,
                        upload_id:   row.get(8)?,
                        create_time: row.get(9)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn list_isos(&mut self) -> Result<Vec<IsoInfo>> {
        self.with_tx("list ISOs", |tx| {
            let mut stmt = tx.prepare(
                "SELECT id, name, size, status, region, bucket, hash_local, hash_remote, create_time
                 FROM isos ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(IsoInfo {
                    id:          row.get(0)?,
                    name:        row.get(1)?,
                    size:        row.get(2)?,
                    status:      Some(iso_status_from(row.get(3)?)?),
                    region:      row.get(4)?,
                    bucket:      row.get(5)?,
                    hash_local:  row.get(6)?,
                    hash_remote: row.get(7)?,
                    create_time: row.get(8)?,
                    ..IsoInfo::default()
                })
            })?;
            rows.collect()
        })
    }

    /// Insert the ISO row (`status = Created`) and stamp every listed file
    /// with its id, atomically.  Returns `(iso_id, files updated)`.
    pub fn create_iso_with_file_ids(
        &mut self,
        iso: &IsoInfo,
        file_ids: &[i64],
    ) -> Result<(i64, usize)> {
        let update_sql = format!(
            "UPDATE files SET iso_id = ? WHERE id IN ({})",
            placeholders(file_ids.len())
        );
        self.with_tx(&format!("insert iso {}", iso.name), |tx| {
            tx.execute(
                "INSERT INTO isos (name, size, status, hash_local, create_time) VALUES (?, ?, ?, ?, ?)",
                params![iso.name, iso.size, IsoStatus::Created as i64, iso.hash_local, Utc::now()],
            )?;
            let iso_id = tx.last_insert_rowid();
            if file_ids.is_empty() {
                return Ok((iso_id, 0));
            }

            let mut args: Vec<i64> = Vec::with_capacity(file_ids.len() + 1);
            args.push(iso_id);
            args.extend_from_slice(file_ids);
            let updated = tx.execute(&update_sql, rusqlite::params_from_iter(args.iter()))?;
            Ok((iso_id, updated))
        })
    }

    pub fn update_iso_status(&mut self, iso_id: i64, status: IsoStatus) -> Result<()> {
        self.with_tx(&format!("update iso {iso_id} status {status}"), |tx| {
            tx.execute("UPDATE isos SET status = ? WHERE id = ?", params![status as i64, iso_id])?;
            Ok(())
        })
    }

    pub fn update_iso_remote_hash(&mut self, iso_id: i64, hash_remote: &str) -> Result<()> {
        self.with_tx(&format!("update iso {iso_id} remote hash"), |tx| {
            tx.execute(
                "UPDATE isos SET hash_remote = ? WHERE id = ?",
                params![hash_remote, iso_id],
            )?;
            Ok(())
        })
    }

    pub fn update_iso_status_remote_hash(
        &mut self,
        iso_id: i64,
        status: IsoStatus,
        hash_remote: &str,
    ) -> Result<()> {
        self.with_tx(&format!("update iso {iso_id} status {status}"), |tx| {
            tx.execute(
                "UPDATE isos SET status = ?, hash_remote = ? WHERE id = ?",
                params![status as i64, hash_remote, iso_id],
            )?;
            Ok(())
        })
    }

    /// Persist the multipart upload coordinates so an interrupted upload can
    /// be resumed with the same `(region, bucket, key, id)`.
    pub fn update_iso_upload_info(&mut self, iso: &IsoInfo) -> Result<()> {
        self.with_tx(&format!("update iso {} upload info", iso.id), |tx| {
            tx.execute(
                "UPDATE isos SET region = ?, bucket = ?, upload_key = ?, upload_id = ? WHERE id = ?",
                params![iso.region, iso.bucket, iso.upload_key, iso.upload_id, iso.id],
            )?;
            Ok(())
        })
    }

    /// Forced restart: status back to `Uploading`, remote coordinates and
    /// digest cleared, all parts dropped.
    pub fn reset_iso_upload(&mut self, name: &str) -> Result<()> {
        self.with_tx(&format!("reset iso {name} upload info"), |tx| {
            tx.execute(
                "UPDATE isos SET status = ?, region = '', bucket = '', hash_remote = '' WHERE name = ?",
                params![IsoStatus::Uploading as i64, name],
            )?;
            tx.execute(
                "DELETE FROM parts WHERE iso_id = (SELECT id FROM isos WHERE name = ?)",
                [name],
            )?;
            Ok(())
        })
    }

    // ── Parts ────────────────────────────────────────────────────────────────

    pub fn insert_parts(&mut self, iso_id: i64, parts: &[PartInfo]) -> Result<()> {
        self.with_tx(&format!("insert iso {iso_id} parts"), |tx| {
            let now = Utc::now();
            for p in parts {
                tx.execute(
                    "INSERT INTO parts (iso_id, part_no, hash_local, hash_remote, size, status, create_time)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![iso_id, p.part_no, p.hash_local, p.hash_remote, p.size,
                            PartStatus::Uploading as i64, now],
                )?;
            }
            Ok(())
        })
    }

    pub fn get_parts_by_iso_id(&mut self, iso_id: i64) -> Result<Vec<PartInfo>> {
        self.with_tx(&format!("get parts of iso {iso_id}"), |tx| {
            let mut stmt = tx.prepare(
                "SELECT part_no, hash_local, hash_remote, size, status, etag, create_time
                 FROM parts WHERE iso_id = ? ORDER BY part_no",
            )?;
            let rows = stmt.query_map([iso_id], |row| {
                Ok(PartInfo {
                    iso_id,
                    part_no:     row.get(0)?,
                    hash_local:  row.get(1)?,
                    hash_remote: row.get(2)?,
                    size:        row.get(3)?,
                    status:      part_status_from(row.get(4)?)?,
                    etag:        row.get(5)?,
                    create_time: row.get(6)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn delete_parts_by_iso_id(&mut self, iso_id: i64) -> Result<()> {
        self.with_tx(&format!("delete iso {iso_id} parts"), |tx| {
            tx.execute("DELETE FROM parts WHERE iso_id = ?", [iso_id])?;
            Ok(())
        })
    }

    pub fn update_part_status(&mut self, iso_id: i64, part_no: i64, status: PartStatus) -> Result<()> {
        self.with_tx(&format!("update iso {iso_id} part {part_no} status {status}"), |tx| {
            tx.execute(
                "UPDATE parts SET status = ? WHERE iso_id = ? AND part_no = ?",
                params![status as i64, iso_id, part_no],
            )?;
            Ok(())
        })
    }

    pub fn update_part_etag_status(
        &mut self,
        iso_id: i64,
        part_no: i64,
        etag: &str,
        status: PartStatus,
    ) -> Result<()> {
        self.with_tx(&format!("update iso {iso_id} part {part_no} etag"), |tx| {
            tx.execute(
                "UPDATE parts SET etag = ?, status = ? WHERE iso_id = ? AND part_no = ?",
                params![etag, status as i64, iso_id, part_no],
            )?;
            Ok(())
        })
    }

    pub fn update_part_etag_status_hash(
        &mut self,
        iso_id: i64,
        part_no: i64,
        etag: &str,
        hash_local: &str,
        hash_remote: &str,
        status: PartStatus,
    ) -> Result<()> {
        self.with_tx(&format!("update iso {iso_id} part {part_no} etag+hash"), |tx| {
            tx.execute(
                "UPDATE parts SET etag = ?, status = ?, hash_local = ?, hash_remote = ?
                 WHERE iso_id = ? AND part_no = ?",
                params![etag, status as i64, hash_local, hash_remote, iso_id, part_no],
            )?;
            Ok(())
        })
    }
}
