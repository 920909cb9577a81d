use std::path::Path;

use ebwp::completeness::{self, Completeness};
use ebwp::naming::{self, BackupName};
use ebwp::scanner::ArchiveScanner;

use crate::create::stored_archives;
use crate::error::Result;

/// Print the archive summary and its index. With `json`, each entry is one
/// `{"path","start","end"}` object per line.
pub fn list(archive: &Path, json: bool) -> Result<()> {
    let mut scanner = ArchiveScanner::new(archive);
    match scanner.metadata(false)? {
        Some(metadata) => {
            println!("Archive: {}", metadata.filename);
            if let Some(created) = BackupName::parse(&metadata.filename)
                .ok()
                .and_then(|name| chrono::DateTime::from_timestamp(name.timestamp, 0))
            {
                println!("Created: {}", created.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            println!("Version: {}", metadata.config.plugin.version);
            println!("Encrypted: {}", metadata.is_encrypted());
            println!("Files: {} ({} bytes)", metadata.stats.total, metadata.stats.size);
            if !metadata.tags.is_empty() {
                println!("Excluded: {}", metadata.tags.join(", "));
            }
        }
        None => println!("Archive: {} (no metadata)", archive.display()),
    }

    let page = scanner.scan_all()?;
    println!("Entries:");
    for entry in &page.entries {
        if json {
            println!("{}", serde_json::to_string(entry).map_err(ebwp::error::Error::from)?);
        } else {
            println!("  {}\t{}\t{}", entry.path, entry.start, entry.end);
        }
    }
    if !page.deleted.is_empty() {
        println!("Deleted:");
        for path in &page.deleted {
            println!("  {}", path);
        }
    }
    Ok(())
}

pub fn check(archive: &Path) -> Completeness {
    let result = completeness::check(archive);
    match result {
        Completeness::Complete => println!("complete"),
        Completeness::Incomplete => println!("incomplete"),
        Completeness::Unknown => println!("unknown"),
    }
    result
}

pub fn chain(dir: &Path, last: &str) -> Result<()> {
    let available = stored_archives(dir)?;
    match naming::resolve_parent(last, &available) {
        Ok(decision) => {
            println!("Parent: {}", decision.parent);
            println!("Increments: {}", decision.children_count);
            println!("Next: {}", decision.next_child()?);
        }
        Err(e) => println!("Full backup required: {}", e),
    }
    Ok(())
}
