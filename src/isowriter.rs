//! ISO 9660 image emission via an external Rock Ridge capable builder.

use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

/// Emits a single ISO 9660 image from a staged directory tree.
pub trait IsoWriter {
    fn write_image(&self, volume_id: &str, output: &Path, staging_dir: &Path) -> Result<()>;
}

/// Shells out to the first Rock Ridge capable `mkisofs` flavour found on
/// PATH.  All three accept the same flag set for our use.
pub struct MkisofsWriter {
    binary: String,
}

const CANDIDATES: [&str; 3] = ["xorrisofs", "genisoimage", "mkisofs"];

impl MkisofsWriter {
    pub fn detect() -> Result<Self> {
        for bin in CANDIDATES {
            let found = Command::new(bin).arg("-version").output();
            if matches!(found, Ok(out) if out.status.success()) {
                log::debug!("using {bin} for ISO emission");
                return Ok(MkisofsWriter { binary: bin.to_string() });
            }
        }
        Err(Error::State(format!(
            "no ISO 9660 builder found on PATH (tried {})",
            CANDIDATES.join(", ")
        )))
    }

}

impl IsoWriter for MkisofsWriter {
    fn write_image(&self, volume_id: &str, output: &Path, staging_dir: &Path) -> Result<()> {
        let out = Command::new(&self.binary)
            .arg("-R") // Rock Ridge, preserves names and timestamps
            .arg("-V")
            .arg(volume_id)
            .arg("-o")
            .arg(output)
            .arg(staging_dir)
            .output()?;

        if !out.status.success() {
            return Err(Error::State(format!(
                "{} failed with {}: {}",
                self.binary,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }
}
