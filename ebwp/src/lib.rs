//! # ebwp
//!
//! Reader and writer for `.ebwp` backup archives.
//!
//! An archive is a single append-only file: an optional metadata line, then
//! every backed up file framed by start and end marker lines, then deletion
//! markers for incremental backups, then an end sentinel. Writing, indexing
//! and extraction all run in short steps under a caller supplied [`budget`],
//! returning a resumption token when they pause so the next step (possibly in
//! another process) continues exactly where the last one stopped.
//!
//! ## Writing an archive
//!
//! ```no_run
//! use ebwp::budget::Unlimited;
//! use ebwp::config::{ArchiveMetadata, BackupConfig};
//! use ebwp::job::{ArchiveJob, StepOutcome};
//! use ebwp::planner::BackupSetPlanner;
//!
//! fn main() -> ebwp::error::Result<()> {
//!     let set = BackupSetPlanner::new()
//!         .add_root("/srv/site")
//!         .exclude("*.log")?
//!         .plan("ebwp-site-1735110151-4f0abb701c.ebwp", None)?;
//!
//!     let metadata = ArchiveMetadata::new(
//!         set.stats,
//!         "ebwp-site-1735110151-4f0abb701c.ebwp",
//!         "4f0abb701c",
//!         BackupConfig::default(),
//!     );
//!     let mut job = ArchiveJob::new("/backups/site.ebwp", metadata, set.add, set.remove);
//!     let mut token = None;
//!     loop {
//!         match job.run_step(token.as_ref(), &mut Unlimited)? {
//!             StepOutcome::Paused(next) => token = Some(next),
//!             StepOutcome::Finished(summary) => {
//!                 println!("{} files, {} bytes", summary.totals.count, summary.length);
//!                 break;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Reading an archive
//!
//! ```no_run
//! use ebwp::budget::Unlimited;
//! use ebwp::extract::RangeExtractor;
//! use ebwp::scanner::ArchiveScanner;
//!
//! fn main() -> ebwp::error::Result<()> {
//!     let mut scanner = ArchiveScanner::new("/backups/site.ebwp");
//!     let index = scanner.scan_all()?;
//!     let extractor = RangeExtractor::new("/backups/site.ebwp");
//!     for entry in &index.entries {
//!         let mut out = Vec::new();
//!         extractor.extract(entry, None, None, &mut out, &mut Unlimited)?;
//!         println!("{}: {} bytes", entry.path, out.len());
//!     }
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate serde_derive;

pub mod archiver;
pub mod budget;
pub mod cipher;
pub mod completeness;
pub mod config;
pub mod entry;
pub mod error;
pub mod extract;
pub mod job;
pub mod naming;
pub mod planner;
pub mod scanner;
pub mod storage;

pub use crate::archiver::{AddOutcome, Archiver, FileCursor, OpenMode};
pub use crate::completeness::Completeness;
pub use crate::error::{Error, Result};
pub use crate::extract::{ExtractOutcome, ExtractToken, RangeExtractor};
pub use crate::job::{ArchiveJob, ArchiveToken, StepOutcome};
pub use crate::scanner::{ArchiveScanner, EntryRange, ScanPage};
