//! Archive completeness check
//!
//! Readers never fail on a truncated archive, so whether an archive was
//! finished is a separate question answered from its last non-empty line.
//! Current archives end with the `ENTRY_FILE_END:` sentinel. Archives from
//! format generations before [`SENTINEL_SINCE`] stop after the last entry's
//! `ENTRY_END:` line.

use crate::config::compare_versions;
use crate::entry::{self, END_MARKER, SENTINEL_MARKER};
use crate::error::Result;
use crate::scanner::ArchiveScanner;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// First format generation that writes the end sentinel.
pub const SENTINEL_SINCE: &str = "2.3.1";

/// Longest trailing line inspected. Marker lines are far shorter.
const MAX_TAIL: u64 = 64 * 1024;

const BLOCK: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    Incomplete,
    /// The archive could not be read at all.
    Unknown,
}

/// Last non-empty line of a file without its line terminator. `None` for an
/// empty file or when the last line is longer than the inspected tail.
pub fn last_line<P: AsRef<Path>>(path: P) -> Result<Option<Vec<u8>>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut tail: Vec<u8> = Vec::new();
    let mut position = len;
    loop {
        // Strip trailing line breaks before looking for the line start.
        while matches!(tail.last(), Some(b'\n') | Some(b'\r')) {
            tail.pop();
        }
        if let Some(newline) = tail.iter().rposition(|&b| b == b'\n') {
            return Ok(Some(tail[newline + 1..].to_vec()));
        }
        if position == 0 {
            return Ok(if tail.is_empty() { None } else { Some(tail) });
        }
        if len - position >= MAX_TAIL {
            return Ok(None);
        }

        let read = BLOCK.min(position);
        position -= read;
        let mut block = vec![0u8; read as usize];
        file.seek(SeekFrom::Start(position))?;
        file.read_exact(&mut block)?;
        block.extend_from_slice(&tail);
        tail = block;
    }
}

pub fn check<P: AsRef<Path>>(path: P) -> Completeness {
    let path = path.as_ref();

    let version = match ArchiveScanner::new(path).metadata(false) {
        Ok(Some(metadata)) => metadata.config.plugin.version,
        Ok(None) => {
            tracing::debug!("{} has no metadata line", path.display());
            return Completeness::Incomplete;
        }
        Err(crate::error::Error::IoError(e)) => {
            tracing::warn!("Cannot read {}: {}", path.display(), e);
            return Completeness::Unknown;
        }
        Err(e) => {
            tracing::debug!("{} has unreadable metadata: {}", path.display(), e);
            return Completeness::Incomplete;
        }
    };

    let line = match last_line(path) {
        Ok(Some(line)) => line,
        Ok(None) => return Completeness::Incomplete,
        Err(e) => {
            tracing::warn!("Cannot read {}: {}", path.display(), e);
            return Completeness::Unknown;
        }
    };

    let complete = if compare_versions(&version, SENTINEL_SINCE) == Ordering::Less {
        line.starts_with(END_MARKER.as_bytes())
    } else {
        sentinel_matches(path, &line)
    };

    if complete {
        Completeness::Complete
    } else {
        Completeness::Incomplete
    }
}

/// The sentinel records the archive length before it was appended, so a
/// sentinel followed by more writes is caught too.
fn sentinel_matches(path: &Path, line: &[u8]) -> bool {
    if !line.starts_with(SENTINEL_MARKER.as_bytes()) {
        return false;
    }
    let Some(offset) = entry::match_sentinel(line) else {
        return false;
    };
    let Some(expected) = offset.checked_add(entry::write_sentinel(offset).len() as u64) else {
        return false;
    };
    match std::fs::metadata(path) {
        Ok(metadata) => metadata.len() == expected,
        Err(_) => false,
    }
}
