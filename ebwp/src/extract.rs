//! Byte range extraction
//!
//! Copies one entry's payload out of an archive. Plain payloads are copied
//! verbatim. Encrypted payloads are a run of sealed chunks where every chunk
//! but the last holds exactly `chunk_size` plaintext bytes, so each sealed
//! window is `cipher.sealed_len(chunk_size)` long and the last one ends at the
//! entry's `end` offset. Windows are found by arithmetic, never by searching
//! ciphertext for marker text.

use crate::budget::Budget;
use crate::cipher::ChunkCipher;
use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::scanner::EntryRange;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Where an interrupted extraction continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractToken {
    /// Next archive byte to read. Always a chunk boundary.
    pub archive_offset: u64,
    /// Plaintext bytes already written to the output.
    pub output_len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Done { written: u64 },
    Paused(ExtractToken),
}

pub struct RangeExtractor {
    path: PathBuf,
    chunk_size: usize,
}

impl RangeExtractor {
    pub fn new<P: AsRef<Path>>(path: P) -> RangeExtractor {
        RangeExtractor {
            path: path.as_ref().to_path_buf(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Plaintext chunk size the archive was written with.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> RangeExtractor {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Write the payload of `range` to `sink`, decrypting when a cipher is
    /// given. Pauses between windows when the budget is exhausted.
    pub fn extract(
        &self,
        range: &EntryRange,
        cipher: Option<&dyn ChunkCipher>,
        resume: Option<&ExtractToken>,
        sink: &mut dyn Write,
        budget: &mut dyn Budget,
    ) -> Result<ExtractOutcome> {
        let mut token = match resume {
            Some(token) => *token,
            None => ExtractToken {
                archive_offset: range.start,
                output_len: 0,
            },
        };
        if token.archive_offset < range.start || token.archive_offset > range.end {
            return Err(Error::InvalidFormat(format!(
                "Extract offset {} outside entry {} [{}, {})",
                token.archive_offset, range.path, range.start, range.end
            )));
        }

        let window = match cipher {
            Some(cipher) => cipher.sealed_len(self.chunk_size) as u64,
            None => self.chunk_size as u64,
        };

        let mut archive = File::open(&self.path)?;
        archive.seek(SeekFrom::Start(token.archive_offset))?;
        let mut buffer = Vec::with_capacity(window.min(range.len()) as usize);

        while token.archive_offset < range.end {
            let len = window.min(range.end - token.archive_offset);
            buffer.resize(len as usize, 0);
            archive.read_exact(&mut buffer)?;
            token.archive_offset += len;

            match cipher {
                Some(cipher) => {
                    let plain = cipher.decrypt(&buffer)?;
                    sink.write_all(&plain)?;
                    token.output_len += plain.len() as u64;
                }
                None => {
                    sink.write_all(&buffer)?;
                    token.output_len += len;
                }
            }

            if token.archive_offset < range.end && budget.exhausted() {
                sink.flush()?;
                tracing::debug!("Extraction of {} paused at {}", range.path, token.archive_offset);
                return Ok(ExtractOutcome::Paused(token));
            }
        }

        sink.flush()?;
        Ok(ExtractOutcome::Done {
            written: token.output_len,
        })
    }

    /// Extract into a file. A resumed extraction appends to the existing
    /// output after cutting it back to the length recorded in the token.
    pub fn extract_to_path<P: AsRef<Path>>(
        &self,
        range: &EntryRange,
        cipher: Option<&dyn ChunkCipher>,
        out: P,
        resume: Option<&ExtractToken>,
        budget: &mut dyn Budget,
    ) -> Result<ExtractOutcome> {
        let out = out.as_ref();
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = match resume {
            Some(token) => {
                let mut file = OpenOptions::new().write(true).open(out)?;
                let actual = file.metadata()?.len();
                if actual < token.output_len {
                    return Err(Error::TokenMismatch {
                        expected: token.output_len,
                        actual,
                    });
                }
                if actual > token.output_len {
                    file.set_len(token.output_len)?;
                }
                file.seek(SeekFrom::Start(token.output_len))?;
                file
            }
            None => File::create(out)?,
        };

        let mut writer = BufWriter::new(file);
        let outcome = self.extract(range, cipher, resume, &mut writer, budget)?;
        writer.flush()?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{StepBudget, Unlimited};

    #[test]
    fn test_plain_range() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.ebwp");
        std::fs::write(&archive, b"ENTRY_START:a\nhello\nENTRY_END:a\n").unwrap();
        let range = EntryRange {
            path: "a".into(),
            start: 14,
            end: 19,
        };

        let mut out = Vec::new();
        let outcome = RangeExtractor::new(&archive)
            .extract(&range, None, None, &mut out, &mut Unlimited)
            .unwrap();
        assert_eq!(outcome, ExtractOutcome::Done { written: 5 });
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_empty_range() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.ebwp");
        std::fs::write(&archive, b"ENTRY_START:c\n\nENTRY_END:c\n").unwrap();
        let range = EntryRange {
            path: "c".into(),
            start: 14,
            end: 14,
        };
        let mut out = Vec::new();
        let outcome = RangeExtractor::new(&archive)
            .extract(&range, None, None, &mut out, &mut Unlimited)
            .unwrap();
        assert_eq!(outcome, ExtractOutcome::Done { written: 0 });
        assert!(out.is_empty());
    }

    #[test]
    fn test_resume_to_path_truncates_overrun() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.ebwp");
        std::fs::write(&archive, b"ENTRY_START:a\n0123456789\nENTRY_END:a\n").unwrap();
        let range = EntryRange {
            path: "a".into(),
            start: 14,
            end: 24,
        };
        let out = dir.path().join("restored/a");
        let extractor = RangeExtractor::new(&archive).with_chunk_size(4);

        let token = match extractor
            .extract_to_path(&range, None, &out, None, &mut StepBudget::new(1))
            .unwrap()
        {
            ExtractOutcome::Paused(token) => token,
            other => panic!("expected pause, got {:?}", other),
        };
        assert_eq!(token, ExtractToken { archive_offset: 18, output_len: 4 });

        // A killed step may have written more than the token records.
        std::fs::write(&out, b"0123xx").unwrap();
        let outcome = extractor
            .extract_to_path(&range, None, &out, Some(&token), &mut Unlimited)
            .unwrap();
        assert_eq!(outcome, ExtractOutcome::Done { written: 10 });
        assert_eq!(std::fs::read(&out).unwrap(), b"0123456789");

        std::fs::write(&out, b"01").unwrap();
        assert!(matches!(
            extractor.extract_to_path(&range, None, &out, Some(&token), &mut Unlimited),
            Err(Error::TokenMismatch { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_offset_outside_range() {
        let range = EntryRange {
            path: "a".into(),
            start: 10,
            end: 20,
        };
        let token = ExtractToken {
            archive_offset: 25,
            output_len: 0,
        };
        let mut out = Vec::new();
        assert!(RangeExtractor::new("/nonexistent")
            .extract(&range, None, Some(&token), &mut out, &mut Unlimited)
            .is_err());
    }
}
