//! Sequential archive writer
//!
//! An [`Archiver`] appends entries to a single `.ebwp` file. A large source file
//! may take several invocations to copy; [`Archiver::add_file`] returns a
//! [`FileCursor`] when the budget runs out and accepts it back on the next call,
//! possibly from a different process that reopened the archive with
//! [`OpenMode::Append`].
//!
//! ```no_run
//! use ebwp::archiver::{AddOutcome, Archiver, OpenMode};
//! use ebwp::budget::Unlimited;
//!
//! # fn main() -> ebwp::error::Result<()> {
//! let mut archiver = Archiver::open("site.ebwp", OpenMode::Create)?;
//! match archiver.add_file("/srv/site/index.php", None, None, &mut Unlimited)? {
//!     AddOutcome::Done { bytes } => println!("{} bytes", bytes),
//!     AddOutcome::Paused(cursor) => println!("resume at {}", cursor.offset),
//!     AddOutcome::Skipped(reason) => println!("skipped: {}", reason),
//! }
//! let length = archiver.finalize()?;
//! # Ok(())
//! # }
//! ```

use crate::budget::Budget;
use crate::cipher::ChunkCipher;
use crate::config::{ArchiveMetadata, DEFAULT_CHUNK_SIZE};
use crate::entry::{self, EntryPathMapper};
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Start a new archive, replacing any existing file.
    Create,
    /// Continue an archive written by an earlier step. `expected_len` is the
    /// archive length recorded when that step paused.
    Append { expected_len: u64 },
}

/// Position inside a source file whose entry is still open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCursor {
    pub path: PathBuf,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Entry closed. `bytes` is the plaintext size of the whole file.
    Done { bytes: u64 },
    /// Budget ran out mid-file. The entry is left open.
    Paused(FileCursor),
    /// Source could not be read. Nothing was written unless the failure
    /// happened mid-file, in which case the entry was closed early.
    Skipped(String),
}

pub struct Archiver {
    path: PathBuf,
    writer: BufWriter<File>,
    position: u64,
    chunk_size: usize,
    mapper: EntryPathMapper,
}

impl Archiver {
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Archiver> {
        let path = path.as_ref().to_path_buf();
        let (file, position) = match mode {
            OpenMode::Create => (File::create(&path)?, 0),
            OpenMode::Append { expected_len } => {
                let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
                let actual = file.metadata()?.len();
                if actual < expected_len {
                    return Err(Error::TokenMismatch {
                        expected: expected_len,
                        actual,
                    });
                }
                if actual > expected_len {
                    tracing::warn!(
                        "Discarding {} bytes written past the last pause in {}",
                        actual - expected_len,
                        path.display()
                    );
                    file.set_len(expected_len)?;
                }
                file.seek(SeekFrom::Start(expected_len))?;
                (file, expected_len)
            }
        };
        tracing::debug!("Opened {} at offset {}", path.display(), position);

        Ok(Archiver {
            path,
            writer: BufWriter::new(file),
            position,
            chunk_size: DEFAULT_CHUNK_SIZE,
            mapper: EntryPathMapper::new("", ""),
        })
    }

    /// Plaintext bytes read from a source per chunk. Must match the value
    /// recorded in the metadata when entries are encrypted.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Archiver {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_path_mapper(mut self, mapper: EntryPathMapper) -> Archiver {
        self.mapper = mapper;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current write offset, which is also the archive length.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The metadata line can only be the first line of the archive.
    pub fn write_metadata_once(&mut self, metadata: &ArchiveMetadata) -> Result<()> {
        if self.position != 0 {
            return Err(Error::MetadataAlreadyWritten);
        }
        let json = metadata.to_json()?;
        self.write(&entry::write_metadata(&json))
    }

    pub fn add_file<P: AsRef<Path>>(
        &mut self,
        source: P,
        resume: Option<&FileCursor>,
        cipher: Option<&dyn ChunkCipher>,
        budget: &mut dyn Budget,
    ) -> Result<AddOutcome> {
        let source = source.as_ref();
        let entry_path = self.mapper.to_entry_path(source);

        let resume_at = resume
            .filter(|cursor| cursor.path == source)
            .map(|cursor| cursor.offset);

        let mut input = match File::open(source) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", source.display(), e);
                // A resumed entry is already open in the archive.
                if resume_at.is_some() {
                    self.write(&entry::write_end(&entry_path))?;
                }
                return Ok(AddOutcome::Skipped(e.to_string()));
            }
        };

        let mut offset = match resume_at {
            Some(offset) => {
                input.seek(SeekFrom::Start(offset))?;
                tracing::debug!("Resuming {} at {}", entry_path, offset);
                offset
            }
            None => {
                self.write(&entry::write_start(&entry_path))?;
                0
            }
        };

        let mut chunk = Vec::with_capacity(self.chunk_size);
        loop {
            chunk.clear();
            let read = match (&mut input).take(self.chunk_size as u64).read_to_end(&mut chunk) {
                Ok(read) => read,
                Err(e) => {
                    tracing::warn!("Read failed for {} at {}: {}", source.display(), offset, e);
                    self.write(&entry::write_end(&entry_path))?;
                    return Ok(AddOutcome::Skipped(e.to_string()));
                }
            };

            if read > 0 {
                match cipher {
                    Some(cipher) => {
                        let sealed = cipher.encrypt(&chunk)?;
                        self.write(&sealed)?;
                    }
                    None => self.write(&chunk)?,
                }
                offset += read as u64;
            }

            if read < self.chunk_size {
                self.write(&entry::write_end(&entry_path))?;
                tracing::debug!("Added {} ({} bytes)", entry_path, offset);
                return Ok(AddOutcome::Done { bytes: offset });
            }

            if budget.exhausted() {
                self.writer.flush()?;
                tracing::debug!("Pausing {} at {}", entry_path, offset);
                return Ok(AddOutcome::Paused(FileCursor {
                    path: source.to_path_buf(),
                    offset,
                }));
            }
        }
    }

    /// Record that a file from the previous backup no longer exists.
    pub fn add_deleted_file<P: AsRef<Path>>(&mut self, source: P) -> Result<()> {
        let entry_path = self.mapper.to_entry_path(source.as_ref());
        self.write(&entry::write_delete(&entry_path))
    }

    /// Flush and release the archive without marking it complete, so a later
    /// step can append to it.
    pub fn close(mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.position)
    }

    /// Append the end sentinel and close. Returns the final archive length.
    pub fn finalize(mut self) -> Result<u64> {
        let sentinel = entry::write_sentinel(self.position);
        self.write(&sentinel)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        tracing::info!("Finalized {} ({} bytes)", self.path.display(), self.position);
        Ok(self.position)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }
}
