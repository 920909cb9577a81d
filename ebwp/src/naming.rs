//! Backup file names and incremental lineage
//!
//! ```text
//! ebwp-<slug>-<unix-ts>-<id>.ebwp              full backup
//! ebwpbuwa-<slug>-<unix-ts>-<id>.ebwp          full backup that starts a chain
//! ebwpinc-<slug>-<unix-ts>-<id>-<n>.ebwp       n-th increment of that chain
//! ```
//!
//! A chain is only usable when its increments are numbered `0..N` without
//! gaps. Anything else forces the next run to be a full backup.

use crate::entry::ARCHIVE_EXTENSION;
use crate::error::{Error, Result};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::BTreeSet;
use std::fmt;

const ID_BYTES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupKind {
    Full,
    ChainParent,
    Increment,
}

impl BackupKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            BackupKind::Full => "ebwp",
            BackupKind::ChainParent => "ebwpbuwa",
            BackupKind::Increment => "ebwpinc",
        }
    }

    fn from_prefix(prefix: &str) -> Option<BackupKind> {
        match prefix {
            "ebwp" => Some(BackupKind::Full),
            "ebwpbuwa" => Some(BackupKind::ChainParent),
            "ebwpinc" => Some(BackupKind::Increment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupName {
    pub kind: BackupKind,
    pub slug: String,
    pub timestamp: i64,
    pub id: String,
    /// Set for increments only.
    pub index: Option<u32>,
}

impl BackupName {
    /// Name for a full backup. `kind` must not be [`BackupKind::Increment`].
    pub fn full(kind: BackupKind, slug: &str, timestamp: i64, id: &str) -> Result<BackupName> {
        if kind == BackupKind::Increment {
            return Err(Error::InvalidBackupName(
                "an increment needs a chain parent".to_string(),
            ));
        }
        Ok(BackupName {
            kind,
            slug: slug.to_string(),
            timestamp,
            id: id.to_string(),
            index: None,
        })
    }

    /// Full backup name for a site or custom tag, stamped now.
    pub fn generate(kind: BackupKind, site_or_tag: &str) -> Result<BackupName> {
        let slug = sanitize_slug(site_or_tag);
        BackupName::full(kind, &slug, chrono::Utc::now().timestamp(), &random_id()?)
    }

    pub fn parse(filename: &str) -> Result<BackupName> {
        let invalid = || Error::InvalidBackupName(filename.to_string());

        let stem = filename
            .strip_suffix(ARCHIVE_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(invalid)?;
        let (prefix, rest) = stem.split_once('-').ok_or_else(invalid)?;
        let kind = BackupKind::from_prefix(prefix).ok_or_else(invalid)?;

        let mut parts = rest.rsplitn(if kind == BackupKind::Increment { 4 } else { 3 }, '-');
        let index = match kind {
            BackupKind::Increment => {
                let index = parts.next().ok_or_else(invalid)?;
                Some(index.parse::<u32>().map_err(|_| invalid())?)
            }
            _ => None,
        };
        let id = parts.next().ok_or_else(invalid)?;
        let timestamp = parts.next().ok_or_else(invalid)?;
        let slug = parts.next().ok_or_else(invalid)?;

        if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        if slug.is_empty() || !timestamp.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let timestamp = timestamp.parse::<i64>().map_err(|_| invalid())?;

        Ok(BackupName {
            kind,
            slug: slug.to_string(),
            timestamp,
            id: id.to_string(),
            index,
        })
    }

    /// The `n`-th increment of this chain.
    pub fn child(&self, index: u32) -> Result<BackupName> {
        if self.kind == BackupKind::Full {
            return Err(Error::InvalidBackupName(format!(
                "{} does not start an incremental chain",
                self
            )));
        }
        Ok(BackupName {
            kind: BackupKind::Increment,
            index: Some(index),
            ..self.clone()
        })
    }

    /// Chain parent of an increment.
    pub fn parent(&self) -> Option<BackupName> {
        match self.kind {
            BackupKind::Increment => Some(BackupName {
                kind: BackupKind::ChainParent,
                index: None,
                ..self.clone()
            }),
            _ => None,
        }
    }

    /// True when both names belong to the same chain.
    pub fn same_chain(&self, other: &BackupName) -> bool {
        self.slug == other.slug && self.timestamp == other.timestamp && self.id == other.id
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.kind.prefix(),
            self.slug,
            self.timestamp,
            self.id
        )?;
        if let Some(index) = self.index {
            write!(f, "-{}", index)?;
        }
        write!(f, ".{}", ARCHIVE_EXTENSION)
    }
}

/// Filename-safe slug: scheme dropped, lowercase, runs of other characters
/// collapsed to one `-`.
pub fn sanitize_slug(site_or_tag: &str) -> String {
    let trimmed = site_or_tag.trim();
    let lower = trimmed.to_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);

    let mut slug = String::with_capacity(without_scheme.len());
    for c in without_scheme.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// Ten lowercase hex characters from the system RNG.
pub fn random_id() -> Result<String> {
    let mut bytes = [0u8; ID_BYTES];
    SystemRandom::new().fill(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Increment indices form `0..N` with no gaps.
pub fn chain_is_contiguous(indices: &[u32]) -> bool {
    let unique: BTreeSet<u32> = indices.iter().copied().collect();
    unique.len() == indices.len() && unique.iter().enumerate().all(|(i, &n)| i as u64 == n as u64)
}

/// Where the next increment attaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentDecision {
    pub parent: String,
    /// Increments already present. The next one gets this index.
    pub children_count: usize,
}

impl ParentDecision {
    pub fn next_child(&self) -> Result<BackupName> {
        BackupName::parse(&self.parent)?.child(self.children_count as u32)
    }
}

/// Find the chain parent for the next increment, given the name of the last
/// backup and the backups currently stored. Errors mean the next run must be
/// a full backup.
pub fn resolve_parent<S: AsRef<str>>(last_backup: &str, available: &[S]) -> Result<ParentDecision> {
    let last = BackupName::parse(last_backup)?;

    let parent = match last.kind {
        BackupKind::ChainParent => last.clone(),
        BackupKind::Increment => last.parent().ok_or_else(|| Error::ParentNotFound(last_backup.to_string()))?,
        BackupKind::Full => return Err(Error::ParentNotFound(last_backup.to_string())),
    };
    let parent_name = parent.to_string();

    if !available.iter().any(|name| name.as_ref() == parent_name) {
        return Err(Error::ParentNotFound(parent_name));
    }

    let indices: Vec<u32> = available
        .iter()
        .filter_map(|name| BackupName::parse(name.as_ref()).ok())
        .filter(|name| name.kind == BackupKind::Increment && name.same_chain(&parent))
        .filter_map(|name| name.index)
        .collect();

    if !chain_is_contiguous(&indices) {
        tracing::warn!("Increment chain of {} has gaps: {:?}", parent_name, indices);
        return Err(Error::BrokenChain(parent_name));
    }

    Ok(ParentDecision {
        parent: parent_name,
        children_count: indices.len(),
    })
}
