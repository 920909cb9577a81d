//! Backup set planning
//!
//! Decides which files go into an archive. A full plan lists every readable
//! regular file under the content roots. An incremental plan compares
//! modification times against the snapshot taken by the previous run and lists
//! only what changed, plus the files that disappeared since.
//!
//! Plans are persisted as plain list files, one absolute path per line, so a
//! job resumed in another process reads the same lists:
//!
//! ```text
//! <storage>/ebwp-files.ebwplist           files to add
//! <storage>/ebwp-files-remove.ebwplist    files deleted since the parent
//! ```

use crate::config::FileStats;
use crate::entry::ARCHIVE_EXTENSION;
use crate::error::Result;
use filetime::FileTime;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const ADD_LIST_FILE_NAME: &str = "ebwp-files.ebwplist";
pub const REMOVE_LIST_FILE_NAME: &str = "ebwp-files-remove.ebwplist";

/// Modification times of every file seen by a run, keyed by absolute path.
///
/// Stored as text: the archive name on the first line, then `<mtime> - <path>`
/// per file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSnapshot {
    pub archive_name: String,
    pub files: BTreeMap<PathBuf, i64>,
}

impl FileSnapshot {
    pub fn new(archive_name: &str) -> FileSnapshot {
        FileSnapshot {
            archive_name: archive_name.to_string(),
            files: BTreeMap::new(),
        }
    }

    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<FileSnapshot> {
        let mut lines = BufReader::new(reader).lines();
        let archive_name = match lines.next() {
            Some(line) => line?.trim().to_string(),
            None => String::new(),
        };

        let mut files = BTreeMap::new();
        for line in lines {
            let line = line?;
            if let Some((mtime, path)) = line.split_once(" - ") {
                if let Ok(mtime) = mtime.trim().parse::<i64>() {
                    files.insert(PathBuf::from(path.trim()), mtime);
                }
            }
        }
        Ok(FileSnapshot { archive_name, files })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<FileSnapshot> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn to_writer<W: Write>(&self, mut writer: W) -> Result<()> {
        writeln!(writer, "{}", self.archive_name)?;
        for (path, mtime) in &self.files {
            writeln!(writer, "{} - {}", mtime, path.display())?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.to_writer(BufWriter::new(File::create(path)?))
    }

    /// Make the snapshot of a finished run the baseline for the next one.
    pub fn promote<P1: AsRef<Path>, P2: AsRef<Path>>(current: P1, last: P2) -> Result<()> {
        std::fs::rename(current, last)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupSet {
    pub add: Vec<PathBuf>,
    pub remove: Vec<PathBuf>,
    pub stats: FileStats,
    pub snapshot: FileSnapshot,
}

impl BackupSet {
    /// Write both list files into `dir`. Returns (add list, remove list).
    pub fn write_lists<P: AsRef<Path>>(&self, dir: P) -> Result<(PathBuf, PathBuf)> {
        let add_path = dir.as_ref().join(ADD_LIST_FILE_NAME);
        let remove_path = dir.as_ref().join(REMOVE_LIST_FILE_NAME);
        write_list(&add_path, &self.add)?;
        write_list(&remove_path, &self.remove)?;
        Ok((add_path, remove_path))
    }
}

pub fn write_list<P: AsRef<Path>>(path: P, files: &[PathBuf]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for file in files {
        writeln!(writer, "{}", file.display())?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a list file. Blank lines and archive files are dropped. A missing
/// list is an empty list.
pub fn read_list<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
    let file = match File::open(path.as_ref()) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let path = PathBuf::from(trimmed);
        if is_archive(&path) {
            continue;
        }
        files.push(path);
    }
    Ok(files)
}

/// Count and total size of the listed files that still exist.
pub fn list_stats(files: &[PathBuf]) -> FileStats {
    files
        .iter()
        .filter_map(|file| std::fs::metadata(file).ok())
        .filter(|metadata| metadata.is_file())
        .fold(FileStats::default(), |stats, metadata| FileStats {
            total: stats.total + 1,
            size: stats.size + metadata.len(),
        })
}

fn is_archive(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == ARCHIVE_EXTENSION)
}

#[derive(Debug, Clone, Default)]
pub struct BackupSetPlanner {
    roots: Vec<PathBuf>,
    patterns: Vec<Glob>,
    excluded_dirs: Vec<String>,
}

impl BackupSetPlanner {
    pub fn new() -> BackupSetPlanner {
        BackupSetPlanner::default()
    }

    pub fn add_root<P: AsRef<Path>>(mut self, root: P) -> BackupSetPlanner {
        self.roots.push(root.as_ref().to_path_buf());
        self
    }

    /// Skip files whose path relative to their root matches `pattern`.
    pub fn exclude(mut self, pattern: &str) -> Result<BackupSetPlanner> {
        self.patterns.push(Glob::new(pattern)?);
        Ok(self)
    }

    /// Skip every directory with this exact name.
    pub fn exclude_dir(mut self, name: &str) -> BackupSetPlanner {
        self.excluded_dirs.push(name.to_string());
        self
    }

    /// Plan a backup. Without a previous snapshot every file is listed.
    pub fn plan(&self, archive_name: &str, previous: Option<&FileSnapshot>) -> Result<BackupSet> {
        let excludes = self.build_excludes()?;
        let mut snapshot = FileSnapshot::new(archive_name);
        let mut add = Vec::new();
        let mut seen = HashSet::new();

        for root in &self.roots {
            let walker = WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| {
                    entry.depth() == 0
                        || !entry.file_type().is_dir()
                        || !self
                            .excluded_dirs
                            .iter()
                            .any(|name| entry.file_name() == name.as_str())
                });

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!("Skipping unreadable path under {}: {}", root.display(), e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() || is_archive(entry.path()) {
                    continue;
                }
                let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
                if excludes.is_match(relative) {
                    continue;
                }
                if !seen.insert(entry.path().to_path_buf()) {
                    continue;
                }

                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        tracing::warn!("Skipping {}: {}", entry.path().display(), e);
                        continue;
                    }
                };
                if let Err(e) = File::open(entry.path()) {
                    tracing::warn!("Skipping unreadable {}: {}", entry.path().display(), e);
                    continue;
                }

                let mtime = FileTime::from_last_modification_time(&metadata).unix_seconds();
                snapshot.files.insert(entry.path().to_path_buf(), mtime);

                let unchanged = previous
                    .and_then(|previous| previous.files.get(entry.path()))
                    .map_or(false, |&previous_mtime| previous_mtime == mtime);
                if !unchanged {
                    add.push(entry.path().to_path_buf());
                }
            }
        }

        let remove: Vec<PathBuf> = match previous {
            Some(previous) => previous
                .files
                .keys()
                .filter(|path| !snapshot.files.contains_key(*path))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        let stats = list_stats(&add);
        tracing::info!(
            "Planned {} files ({} bytes) to add, {} to remove",
            stats.total,
            stats.size,
            remove.len()
        );

        Ok(BackupSet {
            add,
            remove,
            stats,
            snapshot,
        })
    }

    fn build_excludes(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.patterns {
            builder.add(pattern.clone());
        }
        Ok(builder.build()?)
    }
}
