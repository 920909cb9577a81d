//! Archive index reader
//!
//! [`ArchiveScanner`] walks an archive line by line and reports the byte range
//! of every complete entry. Only the first [`MAX_LINE_HEAD`] bytes of a line are
//! kept, so binary payloads without newlines never grow memory.
//!
//! Entries are never interleaved, so at most one entry is open at a time.
//! While one is open every line other than its own end marker is payload, even
//! when it looks like a marker. A scan only pauses between entries, which keeps
//! the resume offset self-contained.

use crate::budget::{Budget, Unlimited};
use crate::config::ArchiveMetadata;
use crate::entry::{self, Marker};
use crate::error::{Error, Result};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Bytes of a line kept for marker matching.
pub const MAX_LINE_HEAD: usize = 8 * 1024;

/// Upper bound for the metadata line.
const MAX_METADATA_LEN: u64 = 16 * 1024 * 1024;

/// Payload location of one entry. `end - start` is the stored payload length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryRange {
    pub path: String,
    pub start: u64,
    pub end: u64,
}

impl EntryRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub entries: Vec<EntryRange>,
    /// Paths recorded as deleted since the parent backup.
    pub deleted: Vec<String>,
    pub done: bool,
    /// Where the next call should continue. Equals the archive length once
    /// `done` is set.
    pub resume_offset: u64,
}

pub struct ArchiveScanner {
    path: PathBuf,
    metadata: Option<Value>,
}

impl ArchiveScanner {
    pub fn new<P: AsRef<Path>>(path: P) -> ArchiveScanner {
        ArchiveScanner {
            path: path.as_ref().to_path_buf(),
            metadata: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scan from `resume_offset` until the end of the archive or until the
    /// budget asks for a pause. At least one line is consumed per call.
    pub fn scan(&mut self, resume_offset: u64, budget: &mut dyn Budget) -> Result<ScanPage> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(resume_offset))?;
        let mut lines = LineReader::new(file, resume_offset);

        let mut page = ScanPage::default();
        let mut open: Option<(String, u64)> = None;
        let mut head = Vec::with_capacity(256);

        while let Some(line_start) = lines.next_line(&mut head)? {
            let marker = Marker::parse(&head);

            match marker {
                Some(Marker::Start(path)) if open.is_none() => {
                    open = Some((path, lines.offset()));
                }
                Some(Marker::End(end_path))
                    if open.as_ref().map_or(false, |(path, _)| *path == end_path) =>
                {
                    if let Some((path, start)) = open.take() {
                        // The byte before the end marker line is the separator
                        // newline written by the archiver, not payload.
                        let end = line_start.saturating_sub(1).max(start);
                        page.entries.push(EntryRange { path, start, end });
                    }
                }
                Some(Marker::Delete(path)) if open.is_none() => page.deleted.push(path),
                _ => {}
            }

            if open.is_none() && budget.exhausted() {
                page.resume_offset = lines.offset();
                tracing::debug!(
                    "Scan of {} paused at {} with {} entries",
                    self.path.display(),
                    page.resume_offset,
                    page.entries.len()
                );
                return Ok(page);
            }
        }

        if let Some((path, start)) = open {
            tracing::warn!(
                "Dropping unterminated entry {} at offset {} in {}",
                path,
                start,
                self.path.display()
            );
        }

        page.done = true;
        page.resume_offset = lines.offset();
        Ok(page)
    }

    /// Scan the whole archive in one call.
    pub fn scan_all(&mut self) -> Result<ScanPage> {
        self.scan(0, &mut Unlimited)
    }

    /// Metadata record from the first line. `None` when the archive has no
    /// metadata line.
    pub fn metadata(&mut self, force_refresh: bool) -> Result<Option<ArchiveMetadata>> {
        let value = match self.metadata_json(force_refresh)?.cloned() {
            Some(value) => value,
            None => return Ok(None),
        };
        let metadata = serde_json::from_value(value).map_err(|e| {
            Error::InvalidFormat(format!(
                "Unreadable metadata in {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(Some(metadata))
    }

    /// One top-level value of the metadata record, e.g. `"stats"` or `"config"`.
    pub fn metadata_value(&mut self, key: &str, force_refresh: bool) -> Result<Option<Value>> {
        Ok(self
            .metadata_json(force_refresh)?
            .and_then(|value| value.get(key).cloned()))
    }

    fn metadata_json(&mut self, force_refresh: bool) -> Result<Option<&Value>> {
        if force_refresh || self.metadata.is_none() {
            self.metadata = read_metadata_line(&self.path)?;
        }
        Ok(self.metadata.as_ref())
    }
}

fn read_metadata_line(path: &Path) -> Result<Option<Value>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file).take(MAX_METADATA_LEN);
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;

    match entry::match_metadata(&line) {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Line iterator that tracks absolute offsets and truncates long lines.
struct LineReader<R> {
    inner: BufReader<R>,
    offset: u64,
}

impl<R: Read> LineReader<R> {
    fn new(inner: R, offset: u64) -> Self {
        LineReader {
            inner: BufReader::with_capacity(64 * 1024, inner),
            offset,
        }
    }

    /// Offset just past the last line returned.
    fn offset(&self) -> u64 {
        self.offset
    }

    /// Fills `head` with the start of the next line and returns the line's
    /// starting offset, or `None` at end of file.
    fn next_line(&mut self, head: &mut Vec<u8>) -> std::io::Result<Option<u64>> {
        head.clear();
        let start = self.offset;
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Ok(if self.offset == start { None } else { Some(start) });
            }

            let (take, found) = match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (buf.len(), false),
            };
            let room = MAX_LINE_HEAD.saturating_sub(head.len());
            head.extend_from_slice(&buf[..take.min(room)]);

            self.inner.consume(take);
            self.offset += take as u64;
            if found {
                return Ok(Some(start));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::StepBudget;

    fn write_archive(bytes: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.ebwp");
        std::fs::write(&path, bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn test_scan_ranges() {
        let (_dir, path) = write_archive(
            b"ENTRY_START:a.txt\nhello\nENTRY_END:a.txt\nENTRY_START:e\n\nENTRY_END:e\nENTRY_DELETE:old.php\n\nENTRY_FILE_END:70",
        );
        let page = ArchiveScanner::new(&path).scan_all().unwrap();
        assert!(page.done);
        assert_eq!(
            page.entries,
            vec![
                EntryRange { path: "a.txt".into(), start: 18, end: 23 },
                EntryRange { path: "e".into(), start: 54, end: 54 },
            ]
        );
        assert_eq!(page.deleted, vec!["old.php".to_string()]);
    }

    #[test]
    fn test_markers_inside_payload_are_payload() {
        let (_dir, path) = write_archive(
            b"ENTRY_START:a\nENTRY_START:b\nENTRY_DELETE:c\nENTRY_END:b\nENTRY_END:a\nENTRY_START:b\nx\nENTRY_END:b\n",
        );
        let page = ArchiveScanner::new(&path).scan_all().unwrap();
        let paths: Vec<_> = page.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b"]);
        assert!(page.deleted.is_empty());
        assert_eq!(page.entries[0].start, 14);
    }

    #[test]
    fn test_unterminated_entry_dropped() {
        let (_dir, path) = write_archive(b"ENTRY_START:a\nhello\nENTRY_END:a\nENTRY_START:b\npartial");
        let page = ArchiveScanner::new(&path).scan_all().unwrap();
        assert_eq!(page.entries.len(), 1);
        assert!(page.done);
    }

    #[test]
    fn test_scan_pauses_between_entries() {
        let (_dir, path) =
            write_archive(b"ENTRY_START:a\n1\n2\n3\nENTRY_END:a\nENTRY_START:b\nx\nENTRY_END:b\n");
        let mut scanner = ArchiveScanner::new(&path);

        let first = scanner.scan(0, &mut StepBudget::new(1)).unwrap();
        assert!(!first.done);
        assert_eq!(first.entries.len(), 1);
        assert_eq!(first.resume_offset, 32);

        let second = scanner.scan(first.resume_offset, &mut StepBudget::new(1)).unwrap();
        assert!(!second.done);
        assert_eq!(second.entries[0].path, "b");
    }

    #[test]
    fn test_long_lines_are_bounded() {
        let mut bytes = b"ENTRY_START:big\n".to_vec();
        bytes.extend(std::iter::repeat(b'z').take(MAX_LINE_HEAD * 4));
        bytes.extend_from_slice(b"\nENTRY_END:big\n");
        let (_dir, path) = write_archive(&bytes);
        let page = ArchiveScanner::new(&path).scan_all().unwrap();
        assert_eq!(page.entries[0].len(), (MAX_LINE_HEAD * 4) as u64);
    }

    #[test]
    fn test_metadata_cache() {
        let (_dir, path) =
            write_archive(b"ENTRY_METADATA:{\"stats\":{\"total\":1,\"size\":5},\"custom\":[1]}\n");
        let mut scanner = ArchiveScanner::new(&path);
        let metadata = scanner.metadata(false).unwrap().unwrap();
        assert_eq!(metadata.stats.total, 1);
        assert_eq!(scanner.metadata_value("custom", false).unwrap(), Some(serde_json::json!([1])));

        std::fs::write(&path, b"ENTRY_METADATA:{\"stats\":{\"total\":2,\"size\":5}}\n").unwrap();
        assert_eq!(scanner.metadata(false).unwrap().unwrap().stats.total, 1);
        assert_eq!(scanner.metadata(true).unwrap().unwrap().stats.total, 2);
        assert_eq!(scanner.metadata_value("missing", false).unwrap(), None);
    }

    #[test]
    fn test_no_metadata_line() {
        let (_dir, path) = write_archive(b"ENTRY_START:a\n\nENTRY_END:a\n");
        assert!(ArchiveScanner::new(&path).metadata(false).unwrap().is_none());
    }
}
