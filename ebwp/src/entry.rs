//! Entry framing for the `.ebwp` byte stream
//!
//! An archive has no central index. Every piece of structure is an ASCII marker
//! line and everything between an entry's start and end marker is payload:
//!
//! ```text
//! ENTRY_METADATA:{"stats":...}\n           written once, first line
//! ENTRY_START:<path>\n
//! <payload bytes>                            raw, or IV || ciphertext chunks
//! \nENTRY_END:<path>\n
//! ENTRY_DELETE:<path>\n                      incremental deletions, no payload
//! \nENTRY_FILE_END:<offset>                  sentinel, archive is complete
//! ```
//!
//! Markers are only recognised at the start of a line. Anything else is opaque
//! payload belonging to the currently open entry, so parsing never fails: a
//! malformed line is simply not a match.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

pub const METADATA_MARKER: &str = "ENTRY_METADATA:";
pub const START_MARKER: &str = "ENTRY_START:";
pub const END_MARKER: &str = "ENTRY_END:";
pub const DELETE_MARKER: &str = "ENTRY_DELETE:";
pub const SENTINEL_MARKER: &str = "ENTRY_FILE_END:";

/// Namespace reserved for files generated by the backup tool itself
/// (configuration, database dump).
pub const GENERATED_FILES_PREFIX: &str = "ebwp-files/";

/// Directory name fragment identifying the database dump directory.
pub const DATABASE_DIR_TAG: &str = "ebwp-database";

/// Archive file extension, without the dot.
pub const ARCHIVE_EXTENSION: &str = "ebwp";

pub fn write_start(path: &str) -> Vec<u8> {
    format!("{START_MARKER}{path}\n").into_bytes()
}

/// The end marker carries its own leading newline so that binary payloads
/// without a trailing newline still leave the marker at a line start.
pub fn write_end(path: &str) -> Vec<u8> {
    format!("\n{END_MARKER}{path}\n").into_bytes()
}

pub fn write_delete(path: &str) -> Vec<u8> {
    format!("{DELETE_MARKER}{path}\n").into_bytes()
}

pub fn write_metadata(json: &str) -> Vec<u8> {
    format!("{METADATA_MARKER}{json}\n").into_bytes()
}

/// `offset` is the archive length before the sentinel is appended.
pub fn write_sentinel(offset: u64) -> Vec<u8> {
    format!("\n{SENTINEL_MARKER}{offset}").into_bytes()
}

pub fn match_start(line: &[u8]) -> Option<String> {
    match_marker(line, START_MARKER)
}

pub fn match_end(line: &[u8]) -> Option<String> {
    match_marker(line, END_MARKER)
}

pub fn match_delete(line: &[u8]) -> Option<String> {
    match_marker(line, DELETE_MARKER)
}

pub fn match_metadata(line: &[u8]) -> Option<String> {
    match_marker(line, METADATA_MARKER)
}

pub fn match_sentinel(line: &[u8]) -> Option<u64> {
    match_marker(line, SENTINEL_MARKER).and_then(|value| value.parse().ok())
}

fn match_marker(line: &[u8], marker: &str) -> Option<String> {
    let rest = line.strip_prefix(marker.as_bytes())?;
    let end = rest
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

/// Kind of a single archive line, as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Metadata(String),
    Start(String),
    End(String),
    Delete(String),
    Sentinel(u64),
}

impl Marker {
    /// Classify a line. Returns `None` for payload.
    pub fn parse(line: &[u8]) -> Option<Marker> {
        // Cheap reject: every marker begins with "ENTRY_".
        if !line.starts_with(b"ENTRY_") {
            return None;
        }
        if let Some(path) = match_start(line) {
            return Some(Marker::Start(path));
        }
        if let Some(path) = match_end(line) {
            return Some(Marker::End(path));
        }
        if let Some(path) = match_delete(line) {
            return Some(Marker::Delete(path));
        }
        if let Some(offset) = match_sentinel(line) {
            return Some(Marker::Sentinel(offset));
        }
        match_metadata(line).map(Marker::Metadata)
    }
}

/// Maps absolute source paths to archive entry paths and back.
///
/// Site content is stored relative to the content root. Files produced by the
/// tool in its temp directory are moved into [`GENERATED_FILES_PREFIX`] so a
/// restore can tell them apart from real content; database dump files keep
/// their dump directory name.
#[derive(Debug, Clone)]
pub struct EntryPathMapper {
    content_root: String,
    temp_dir: String,
}

impl EntryPathMapper {
    pub fn new<P1: AsRef<Path>, P2: AsRef<Path>>(content_root: P1, temp_dir: P2) -> Self {
        EntryPathMapper {
            content_root: untrailingslash(normalize_path(content_root.as_ref())),
            temp_dir: untrailingslash(normalize_path(temp_dir.as_ref())),
        }
    }

    pub fn content_root(&self) -> &str {
        &self.content_root
    }

    pub fn temp_dir(&self) -> &str {
        &self.temp_dir
    }

    pub fn to_entry_path<P: AsRef<Path>>(&self, file: P) -> String {
        let file = normalize_path(file.as_ref());

        if let Some(inside_temp) = strip_dir_prefix(&file, &self.temp_dir) {
            let mut components = inside_temp.rsplit('/');
            let name = components.next().unwrap_or_default();
            if file.contains(DATABASE_DIR_TAG) {
                if let Some(dump_dir) = components.next() {
                    return format!("{GENERATED_FILES_PREFIX}{dump_dir}/{name}");
                }
            }
            return format!("{GENERATED_FILES_PREFIX}{name}");
        }

        if let Some(relative) = strip_dir_prefix(&file, &self.content_root) {
            return relative.to_string();
        }

        file.trim_start_matches('/').to_string()
    }

    /// Resolve an entry path to the location it should be restored to.
    /// Entry paths that would escape the target directories are rejected.
    pub fn to_restore_path(&self, entry_path: &str) -> Result<PathBuf> {
        let (base, relative) = match entry_path.strip_prefix(GENERATED_FILES_PREFIX) {
            Some(rest) => (&self.temp_dir, rest),
            None => (&self.content_root, entry_path),
        };

        let relative_path = Path::new(relative);
        let escapes = relative_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if relative.is_empty() || escapes {
            return Err(Error::InvalidFormat(format!(
                "Entry path cannot be restored safely: {entry_path}"
            )));
        }

        Ok(PathBuf::from(base).join(relative_path))
    }
}

fn normalize_path(path: &Path) -> String {
    let mut normalized = path.to_string_lossy().replace('\\', "/");
    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }
    normalized
}

fn untrailingslash(path: String) -> String {
    if path.len() > 1 {
        path.trim_end_matches('/').to_string()
    } else {
        path
    }
}

fn strip_dir_prefix<'a>(file: &'a str, dir: &str) -> Option<&'a str> {
    if dir.is_empty() {
        return None;
    }
    let rest = file.strip_prefix(dir)?;
    let rest = rest.strip_prefix('/')?;
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_bytes() {
        assert_eq!(write_start("a/b.txt"), b"ENTRY_START:a/b.txt\n");
        assert_eq!(write_end("a/b.txt"), b"\nENTRY_END:a/b.txt\n");
        assert_eq!(write_delete("a/b.txt"), b"ENTRY_DELETE:a/b.txt\n");
        assert_eq!(write_sentinel(42), b"\nENTRY_FILE_END:42");
    }

    #[test]
    fn test_match_tolerates_trailing_whitespace() {
        assert_eq!(match_start(b"ENTRY_START:x.txt\n"), Some("x.txt".to_string()));
        assert_eq!(match_start(b"ENTRY_START:x.txt\r\n"), Some("x.txt".to_string()));
        assert_eq!(match_end(b"ENTRY_END:dir/y z.bin  \n"), Some("dir/y z.bin".to_string()));
        assert_eq!(match_delete(b"ENTRY_DELETE:gone.php"), Some("gone.php".to_string()));
    }

    #[test]
    fn test_malformed_lines_are_not_markers() {
        assert_eq!(match_start(b"ENTRY_START:\n"), None);
        assert_eq!(match_start(b" ENTRY_START:x\n"), None);
        assert_eq!(match_end(b"xxENTRY_END:x\n"), None);
        assert_eq!(Marker::parse(b"ENTRY_STARTED:x\n"), None);
        assert_eq!(Marker::parse(b"\n"), None);
        assert_eq!(Marker::parse(b"ENTRY_FILE_END:abc"), None);
    }

    #[test]
    fn test_marker_parse() {
        assert_eq!(Marker::parse(b"ENTRY_START:a\n"), Some(Marker::Start("a".into())));
        assert_eq!(Marker::parse(b"ENTRY_END:a\n"), Some(Marker::End("a".into())));
        assert_eq!(Marker::parse(b"ENTRY_DELETE:a\n"), Some(Marker::Delete("a".into())));
        assert_eq!(Marker::parse(b"ENTRY_FILE_END:1024"), Some(Marker::Sentinel(1024)));
        assert_eq!(
            Marker::parse(b"ENTRY_METADATA:{}\n"),
            Some(Marker::Metadata("{}".into()))
        );
    }

    #[test]
    fn test_entry_path_content() {
        let mapper = EntryPathMapper::new("/var/www/wp-content/", "/var/www/wp-content/ebwp-temp");
        assert_eq!(
            mapper.to_entry_path("/var/www/wp-content/uploads/2024/01/a.jpg"),
            "uploads/2024/01/a.jpg"
        );
        assert_eq!(
            mapper.to_entry_path("C:\\site\\wp-content\\x.php").as_str(),
            "C:/site/wp-content/x.php"
        );
        assert_eq!(mapper.to_entry_path("/etc/hosts"), "etc/hosts");
    }

    #[test]
    fn test_entry_path_generated_files() {
        let mapper = EntryPathMapper::new("/var/www/wp-content", "/var/www/wp-content/ebwp-temp");
        assert_eq!(
            mapper.to_entry_path("/var/www/wp-content/ebwp-temp/ebwp-config.json"),
            "ebwp-files/ebwp-config.json"
        );
        assert_eq!(
            mapper.to_entry_path("/var/www/wp-content/ebwp-temp/req1/ebwp-database/wp_posts.sql"),
            "ebwp-files/ebwp-database/wp_posts.sql"
        );
    }

    #[test]
    fn test_restore_path() {
        let mapper = EntryPathMapper::new("/srv/site", "/srv/tmp");
        assert_eq!(
            mapper.to_restore_path("uploads/a.jpg").unwrap(),
            PathBuf::from("/srv/site/uploads/a.jpg")
        );
        assert_eq!(
            mapper.to_restore_path("ebwp-files/ebwp-database/t.sql").unwrap(),
            PathBuf::from("/srv/tmp/ebwp-database/t.sql")
        );
        assert!(mapper.to_restore_path("../etc/passwd").is_err());
        assert!(mapper.to_restore_path("ebwp-files/").is_err());
    }
}
