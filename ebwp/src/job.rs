//! Archive job driver
//!
//! Runs the archiving stage of a backup as a series of budgeted steps. The
//! first step checks free space, creates the archive and writes its metadata.
//! Every step then adds files from the add list, records the remove list as
//! deletion entries and finally appends the end sentinel. When the budget runs
//! out, the step returns an [`ArchiveToken`] that the caller persists and hands
//! to the next step, which may run in a new process.

use crate::archiver::{AddOutcome, Archiver, FileCursor, OpenMode};
use crate::budget::Budget;
use crate::cipher::ChunkCipher;
use crate::config::ArchiveMetadata;
use crate::entry::{EntryPathMapper, ARCHIVE_EXTENSION};
use crate::error::Result;
use crate::storage::{ensure_space, StorageProvider};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Progress reported while archiving runs from here to 100.
const PROGRESS_START: f64 = 80.0;
const PROGRESS_SPAN: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Adding,
    Removing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveTotals {
    pub count: u64,
    pub size: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub deleted: u64,
}

/// Everything a later step needs to continue the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveToken {
    pub phase: Phase,
    /// Next position in the current phase's list.
    pub list_index: usize,
    /// Set when a file was paused part way.
    pub current_file: Option<FileCursor>,
    /// Archive length when the step paused.
    pub archive_offset: u64,
    pub totals: ArchiveTotals,
}

impl ArchiveToken {
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        serde_json::to_writer(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }
}

/// One progress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcStat {
    pub status: String,
    pub progress: f64,
    pub message: String,
    pub detail: Option<String>,
}

pub trait StatusSink {
    fn update(&mut self, stat: &ProcStat);
}

/// Reports progress through `tracing`.
#[derive(Debug, Default)]
pub struct TracingStatus;

impl StatusSink for TracingStatus {
    fn update(&mut self, stat: &ProcStat) {
        match &stat.detail {
            Some(detail) => tracing::info!("[{:.2}%] {} ({})", stat.progress, stat.message, detail),
            None => tracing::info!("[{:.2}%] {}", stat.progress, stat.message),
        }
    }
}

/// Keeps every report.
#[derive(Debug, Default)]
pub struct CollectingStatus {
    pub updates: Vec<ProcStat>,
}

impl StatusSink for CollectingStatus {
    fn update(&mut self, stat: &ProcStat) {
        self.updates.push(stat.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    /// Final archive length including the sentinel.
    pub length: u64,
    pub totals: ArchiveTotals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Paused(ArchiveToken),
    Finished(ArchiveSummary),
}

pub struct ArchiveJob<S: StatusSink = TracingStatus> {
    archive_path: PathBuf,
    metadata: ArchiveMetadata,
    add: Vec<PathBuf>,
    remove: Vec<PathBuf>,
    cipher: Option<Box<dyn ChunkCipher>>,
    mapper: EntryPathMapper,
    storage: Option<Box<dyn StorageProvider>>,
    status: S,
}

impl ArchiveJob<TracingStatus> {
    pub fn new<P: AsRef<Path>>(
        archive_path: P,
        metadata: ArchiveMetadata,
        add: Vec<PathBuf>,
        remove: Vec<PathBuf>,
    ) -> Self {
        ArchiveJob {
            archive_path: archive_path.as_ref().to_path_buf(),
            metadata,
            add,
            remove,
            cipher: None,
            mapper: EntryPathMapper::new("", ""),
            storage: None,
            status: TracingStatus,
        }
    }
}

impl<S: StatusSink> ArchiveJob<S> {
    pub fn with_status<T: StatusSink>(self, status: T) -> ArchiveJob<T> {
        ArchiveJob {
            archive_path: self.archive_path,
            metadata: self.metadata,
            add: self.add,
            remove: self.remove,
            cipher: self.cipher,
            mapper: self.mapper,
            storage: self.storage,
            status,
        }
    }

    pub fn with_cipher(mut self, cipher: Box<dyn ChunkCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_path_mapper(mut self, mapper: EntryPathMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Destination checked for free space before the archive is created.
    pub fn with_storage(mut self, storage: Box<dyn StorageProvider>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn status(&self) -> &S {
        &self.status
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Run one step. `token` is `None` for the first step and the token
    /// returned by the previous step otherwise.
    pub fn run_step(
        &mut self,
        token: Option<&ArchiveToken>,
        budget: &mut dyn Budget,
    ) -> Result<StepOutcome> {
        let chunk_size = self.metadata.config.file_info.chunk_size;

        let (archiver, mut token) = match token {
            Some(token) => {
                let archiver = Archiver::open(
                    &self.archive_path,
                    OpenMode::Append {
                        expected_len: token.archive_offset,
                    },
                )?;
                (archiver, token.clone())
            }
            None => {
                if let Some(storage) = &self.storage {
                    ensure_space(storage.as_ref(), self.metadata.stats.size)?;
                }
                self.report("in-process", PROGRESS_START, "Space available, archiving files", None);

                let mut archiver = Archiver::open(&self.archive_path, OpenMode::Create)?;
                archiver.write_metadata_once(&self.metadata)?;
                let token = ArchiveToken {
                    phase: Phase::Adding,
                    list_index: 0,
                    current_file: None,
                    archive_offset: archiver.position(),
                    totals: ArchiveTotals::default(),
                };
                (archiver, token)
            }
        };
        let mut archiver = archiver
            .with_chunk_size(chunk_size)
            .with_path_mapper(self.mapper.clone());

        if token.phase == Phase::Adding {
            while token.list_index < self.add.len() {
                let source = self.add[token.list_index].clone();
                if source.extension().map_or(false, |ext| ext == ARCHIVE_EXTENSION) {
                    token.list_index += 1;
                    continue;
                }

                let cipher = self.cipher.as_deref();
                match archiver.add_file(&source, token.current_file.as_ref(), cipher, budget)? {
                    AddOutcome::Done { bytes } => {
                        token.totals.count += 1;
                        token.totals.size += bytes;
                        self.report_added(token.totals.count, &source);
                    }
                    AddOutcome::Skipped(_) => token.totals.skipped += 1,
                    AddOutcome::Paused(cursor) => {
                        token.current_file = Some(cursor);
                        return Self::pause(archiver, token);
                    }
                }
                token.current_file = None;
                token.list_index += 1;

                if token.list_index < self.add.len() && budget.exhausted() {
                    return Self::pause(archiver, token);
                }
            }

            token.phase = Phase::Removing;
            token.list_index = 0;
            if !self.remove.is_empty() && budget.exhausted() {
                return Self::pause(archiver, token);
            }
        }

        while token.list_index < self.remove.len() {
            archiver.add_deleted_file(&self.remove[token.list_index])?;
            token.totals.deleted += 1;
            token.list_index += 1;

            if token.list_index < self.remove.len() && budget.exhausted() {
                return Self::pause(archiver, token);
            }
        }

        let length = archiver.finalize()?;
        self.report("done", 100.0, "Backup completed", None);
        Ok(StepOutcome::Finished(ArchiveSummary {
            path: self.archive_path.clone(),
            length,
            totals: token.totals,
        }))
    }

    fn pause(archiver: Archiver, mut token: ArchiveToken) -> Result<StepOutcome> {
        token.archive_offset = archiver.close()?;
        tracing::debug!(
            "Archive step paused in {:?} phase at list index {} ({} bytes)",
            token.phase,
            token.list_index,
            token.archive_offset
        );
        Ok(StepOutcome::Paused(token))
    }

    fn report_added(&mut self, count: u64, source: &Path) {
        let total = self.metadata.stats.total.max(count);
        let percent = count as f64 / total as f64 * 100.0;
        let progress = (percent * PROGRESS_SPAN / 100.0 + PROGRESS_START) * 100.0;
        self.report(
            "in-process",
            progress.round() / 100.0,
            &format!("Archiving files: {}% completed", percent as u64),
            Some(format!(
                "Archived: {} out of {} ({})",
                count,
                total,
                source.display()
            )),
        );
    }

    fn report(&mut self, status: &str, progress: f64, message: &str, detail: Option<String>) {
        self.status.update(&ProcStat {
            status: status.to_string(),
            progress,
            message: message.to_string(),
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Unlimited;
    use crate::config::{BackupConfig, FileStats};

    #[test]
    fn test_token_json() {
        let token = ArchiveToken {
            phase: Phase::Adding,
            list_index: 3,
            current_file: Some(FileCursor {
                path: PathBuf::from("/srv/big.bin"),
                offset: 524288,
            }),
            archive_offset: 1_000_000,
            totals: ArchiveTotals {
                count: 2,
                size: 10,
                skipped: 0,
                deleted: 0,
            },
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        token.to_file(&path).unwrap();
        assert_eq!(ArchiveToken::from_file(&path).unwrap(), token);
    }

    #[test]
    fn test_single_step_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"alpha").unwrap();
        std::fs::write(&b, b"beta").unwrap();

        let stats = FileStats { total: 2, size: 9 };
        let metadata = ArchiveMetadata::new(stats, "ebwp-t-1-ab.ebwp", "ab", BackupConfig::default());
        let mut job = ArchiveJob::new(
            dir.path().join("out.ebwp"),
            metadata,
            vec![a, dir.path().join("missing.txt"), b],
            vec![dir.path().join("gone.txt")],
        )
        .with_path_mapper(EntryPathMapper::new(dir.path(), dir.path().join("tmp")))
        .with_status(CollectingStatus::default());

        let summary = match job.run_step(None, &mut Unlimited).unwrap() {
            StepOutcome::Finished(summary) => summary,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(summary.totals.count, 2);
        assert_eq!(summary.totals.size, 9);
        assert_eq!(summary.totals.skipped, 1);
        assert_eq!(summary.totals.deleted, 1);

        let updates = &job.status().updates;
        assert_eq!(updates.first().unwrap().progress, 80.0);
        assert_eq!(updates[1].progress, 90.0);
        assert_eq!(updates[2].progress, 100.0);
        assert_eq!(updates.last().unwrap().status, "done");
    }
}
