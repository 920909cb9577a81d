use std::path::Path;

use ebwp::budget::Unlimited;
use ebwp::cipher;
use ebwp::extract::{ExtractOutcome, RangeExtractor};
use ebwp::scanner::ArchiveScanner;

use crate::error::{Error, Result};
use crate::utils;

/// Restore the entry stored as `entry_path` to `destination`. Returns the
/// number of bytes written.
pub fn extract_entry(
    archive: &Path,
    entry_path: &str,
    destination: &Path,
    password: Option<&str>,
) -> Result<u64> {
    let mut scanner = ArchiveScanner::new(archive);
    let file_info = scanner
        .metadata(false)?
        .map(|metadata| metadata.config.file_info)
        .unwrap_or_default();

    let entry = scanner
        .scan_all()?
        .entries
        .into_iter()
        .find(|entry| entry.path == entry_path)
        .ok_or_else(|| Error::NotFound(format!("{} in {}", entry_path, archive.display())))?;

    let password = if file_info.encrypt {
        Some(utils::get_password(password)?)
    } else {
        None
    };
    let cipher = cipher::cipher_for(&file_info, password.as_deref())?;

    let extractor = RangeExtractor::new(archive).with_chunk_size(file_info.chunk_size);
    let mut token = None;
    loop {
        match extractor.extract_to_path(&entry, cipher.as_deref(), destination, token.as_ref(), &mut Unlimited)? {
            ExtractOutcome::Done { written } => {
                println!("Recovered '{}' to {:?}", entry_path, destination);
                return Ok(written);
            }
            ExtractOutcome::Paused(next) => token = Some(next),
        }
    }
}
