//! Sequential reader for line-oriented record files.
//!
//! Both stores keep one record per line. A line that fails to parse (a
//! half-written tail after a crash, or plain corruption) is logged and
//! skipped; reading resumes with the next line. Skipping is an explicit loop
//! with a bound on consecutive bad lines, so a file full of garbage ends the
//! read instead of spinning through it.
//!
//! Appends go through [`open_append`], which first terminates a torn last
//! line so the next record is not glued onto it.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::{error, warn};

/// Consecutive corrupt lines tolerated before the rest of a file is abandoned.
pub const MAX_CONSECUTIVE_CORRUPT_LINES: usize = 10_000;

/// A read cursor over a record file.
#[derive(Debug)]
pub struct LineReader {
    reader: BufReader<File>,
    path: PathBuf,
    line_number: u64,
    offset: u64,
    abandoned: bool,
    buf: Vec<u8>,
}

/// Opens `path` for appending records, creating it if needed.
///
/// If the file does not end with a newline its last record was cut off; a
/// newline is written first so that record stays a single corrupt line.
pub fn open_append(path: &Path) -> io::Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    let len = file.metadata()?.len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            warn!(path = %path.display(), "terminating truncated last line");
            file.write_all(b"\n")?;
        }
    }
    Ok(file)
}

impl LineReader {
    /// Opens `path` for sequential reading.
    ///
    /// Returns `Ok(None)` if the file does not exist.
    pub fn open(path: &Path) -> io::Result<Option<Self>> {
        match File::open(path) {
            Ok(file) => Ok(Some(LineReader {
                reader: BufReader::new(file),
                path: path.to_path_buf(),
                line_number: 0,
                offset: 0,
                abandoned: false,
                buf: Vec::new(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Number of lines consumed so far.
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether the rest of the file was given up on after a run of corrupt
    /// lines.
    pub fn abandoned(&self) -> bool {
        self.abandoned
    }

    /// Whether every byte of the file has been consumed.
    ///
    /// A read error counts as the end.
    pub fn at_end(&mut self) -> bool {
        self.abandoned || self.reader.fill_buf().map_or(true, |buf| buf.is_empty())
    }

    /// Returns the next record that `parse` accepts, or `None` at end of file.
    ///
    /// Blank lines are ignored. A read error ends the file.
    pub fn next_with<T, E, F>(&mut self, mut parse: F) -> Option<T>
    where
        E: fmt::Display,
        F: FnMut(&[u8]) -> Result<T, E>,
    {
        if self.abandoned {
            return None;
        }
        let mut corrupt = 0usize;
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(n) => self.offset += n as u64,
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "read failed, treating as end of file");
                    return None;
                }
            }
            self.line_number += 1;

            let line = self.buf.trim_ascii();
            if line.is_empty() {
                continue;
            }

            match parse(line) {
                Ok(record) => return Some(record),
                Err(e) => {
                    error!(
                        path = %self.path.display(),
                        lineno = self.line_number,
                        error = %e,
                        line = %String::from_utf8_lossy(line),
                        "corrupted line skipped"
                    );
                    corrupt += 1;
                    if corrupt >= MAX_CONSECUTIVE_CORRUPT_LINES {
                        error!(
                            path = %self.path.display(),
                            corrupt,
                            offset = self.offset,
                            "too many consecutive corrupted lines, abandoning rest of file"
                        );
                        self.abandoned = true;
                        return None;
                    }
                }
            }
        }
    }

    /// Returns the next line that decodes as JSON `T`.
    pub fn next_json<T: DeserializeOwned>(&mut self) -> Option<T> {
        self.next_with(|line| serde_json::from_slice::<T>(line))
    }
}
