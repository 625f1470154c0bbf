//! Error taxonomy shared by every component.
//!
//! The split matters operationally: `Busy` is retried inside the catalog,
//! `NotFound` never surfaces from lookups (those return `Option`), a failed
//! part becomes `UploadFailed` state rather than aborting the loop, and
//! `IntegrityMismatch` before an upload is a hard stop.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// An entity that was expected to exist (not a lookup miss).
    #[error("{0} not found")]
    NotFound(String),

    /// Catalog stayed locked beyond the retry budget.
    #[error("database busy beyond max retry: {0}")]
    Busy(String),

    /// Size or digest disagrees between disk, catalog, and cloud.
    #[error("{what}: expect {expect}, got {got}")]
    IntegrityMismatch {
        what:   String,
        expect: String,
        got:    String,
    },

    /// Network-level failure talking to a cloud endpoint.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote answered with a non-success status.
    #[error("remote rejected with status {status}: {body}")]
    RemoteRejected { status: u16, body: String },

    /// Encrypted stream shorter than the 16-byte salt header.
    #[error("encrypted stream shorter than salt header")]
    ShortHeader,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// An operation was attempted in a state that cannot support it.
    #[error("invalid state: {0}")]
    State(String),

    #[error("{0}")]
    UserInput(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("catalog error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl Error {
    pub fn mismatch(what: impl Into<String>, expect: impl ToString, got: impl ToString) -> Self {
        Error::IntegrityMismatch {
            what:   what.into(),
            expect: expect.to_string(),
            got:    got.to_string(),
        }
    }
}
