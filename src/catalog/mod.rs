//! Embedded catalog: dirs, files, ISO volumes, and upload parts in one
//! SQLite file.
//!
//! Every mutating operation runs inside [`Catalog::with_tx`], which retries
//! the whole closure while SQLite reports the database as busy or locked.
//! Several connections (scanner workers open their own) contend on the same
//! file, so the retry loop is the concurrency strategy, not an edge case.
//!
//! Lookup misses are `Ok(None)`, never errors.

mod iso;
mod scan;

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, Transaction};

use crate::error::{Error, Result};
use crate::types::{IsoStatus, PartStatus};

const MAX_RETRY: u32 = 100_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dirs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    path             TEXT    NOT NULL,
    scan_root_dir_id INTEGER NOT NULL,
    mod_time         TIMESTAMP,
    create_time      TIMESTAMP NOT NULL,
    UNIQUE (path, scan_root_dir_id)
);
CREATE TABLE IF NOT EXISTS files (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    dir_id      INTEGER NOT NULL,
    name        TEXT    NOT NULL,
    ext         TEXT,
    size        INTEGER NOT NULL,
    mod_time    TIMESTAMP,
    hash_local  TEXT    DEFAULT '',
    hash_remote TEXT    DEFAULT '',
    iso_id      INTEGER NOT NULL DEFAULT 0,
    ref_id      TEXT    DEFAULT '',
    create_time TIMESTAMP NOT NULL,
    UNIQUE (name, dir_id)
);
CREATE TABLE IF NOT EXISTS isos (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT    NOT NULL UNIQUE,
    size        INTEGER NOT NULL,
    status      INTEGER NOT NULL,
    region      TEXT    DEFAULT '',
    bucket      TEXT    DEFAULT '',
    hash_local  TEXT    DEFAULT '',
    hash_remote TEXT    DEFAULT '',
    upload_key  TEXT    DEFAULT '',
    upload_id   TEXT    DEFAULT '',
    create_time TIMESTAMP NOT NULL
);
CREATE TABLE IF NOT EXISTS parts (
    iso_id      INTEGER NOT NULL,
    part_no     INTEGER NOT NULL,
    size        INTEGER NOT NULL,
    status      INTEGER NOT NULL,
    etag        TEXT    DEFAULT '',
    hash_local  TEXT    DEFAULT '',
    hash_remote TEXT    DEFAULT '',
    create_time TIMESTAMP NOT NULL,
    PRIMARY KEY (iso_id, part_no)
);
";

pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Open (creating tables on first use) the catalog at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_millis(20))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Catalog { conn })
    }

    /// Run `f` inside a transaction, retrying the whole closure while the
    /// database reports busy/locked, up to [`MAX_RETRY`] attempts.
    pub(crate) fn with_tx<T>(
        &mut self,
        label: &str,
        f: impl Fn(&Transaction) -> rusqlite::Result<T>,
    ) -> Result<T> {
        for _ in 0..MAX_RETRY {
            let tx = match self.conn.transaction() {
                Ok(tx) => tx,
                Err(e) if is_busy(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            match f(&tx) {
                Ok(v) => match tx.commit() {
                    Ok(()) => return Ok(v),
                    Err(e) if is_busy(&e) => continue,
                    Err(e) => return Err(e.into()),
                },
                Err(e) if is_busy(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Busy(label.to_string()))
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

pub(crate) fn iso_status_from(v: i64) -> rusqlite::Result<IsoStatus> {
    IsoStatus::from_i64(v).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, v))
}

pub(crate) fn part_status_from(v: i64) -> rusqlite::Result<PartStatus> {
    PartStatus::from_i64(v).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, v))
}

/// `?, ?, ?` placeholder list for batched `IN (…)` statements.
pub(crate) fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            s.push_str(", ");
        }
        s.push('?');
    }
    s
}
