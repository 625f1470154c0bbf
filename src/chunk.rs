//! Bounded read-seek window over an underlying file.
//!
//! A [`PartReadSeeker`] exposes `[start, end)` of its inner source as an
//! independent `Read + Seek` whose positions are window-relative.  Several
//! windows may share one file handle: each read first re-seeks the handle
//! to the window's own cursor, so interleaved reads through different
//! windows do not disturb each other.  Seeks clamp to `[0, size()]` instead
//! of failing, matching what upload clients expect when they probe length
//! with `seek(0, End)`.

use std::io::{self, Read, Seek, SeekFrom};

pub struct PartReadSeeker<R: Read + Seek> {
    inner:   R,
    start:   u64,
    end:     u64,
    /// Absolute cursor within the inner source, `start ≤ current ≤ end`.
    current: u64,
}

impl<R: Read + Seek> PartReadSeeker<R> {
    pub fn new(inner: R, start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        PartReadSeeker { inner, start, end, current: start }
    }

    /// Bytes visible through the window.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Retarget the window without reallocating; the cursor moves to the
    /// new `start`.
    pub fn set_start_end(&mut self, start: u64, end: u64) {
        debug_assert!(start <= end);
        self.start = start;
        self.end = end;
        self.current = start;
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for PartReadSeeker<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.current >= self.end || buf.is_empty() {
            return Ok(0);
        }

        // Another window may have moved the shared handle since our last
        // read; restore our own cursor first.
        let pos = self.inner.stream_position()?;
        if pos != self.current {
            self.inner.seek(SeekFrom::Start(self.current))?;
        }

        let want = buf.len().min((self.end - self.current) as usize);
        let n = self.inner.read(&mut buf[..want])?;
        self.current += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for PartReadSeeker<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.size() as i64;
        let target = match pos {
            SeekFrom::Start(o)   => o.min(i64::MAX as u64) as i64,
            SeekFrom::Current(o) => (self.current - self.start) as i64 + o,
            SeekFrom::End(o)     => size + o,
        };
        let target = target.clamp(0, size) as u64;

        self.current = self.start + target;
        self.inner.seek(SeekFrom::Start(self.current))?;
        Ok(target)
    }
}
