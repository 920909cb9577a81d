//! Backup configuration and archive metadata
//!
//! `ebwp-config.json` describes one backup request. Its content is embedded
//! verbatim in the archive metadata line so a restore knows how the archive
//! was produced:
//!
//! ```json
//! {
//!   "Plugin": {"Version": "2.3.1"},
//!   "FileInfo": {"filename": "ebwp-example-com-1735110151-4f0abb701c.ebwp",
//!                "encrypt": true, "cipher": "aes-256-cbc",
//!                "chunk_size": 524288, "key_salt": "9f1c..."},
//!   "Params": {"ignore_media": 1, "incremental": false, "save_to": "server"}
//! }
//! ```
//!
//! Keys this crate does not know about are kept and written back unchanged.

use crate::cipher::CipherKind;
use crate::error::Result;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Format generation written by this crate. Archives recorded with an older
/// version carry no end sentinel.
pub const FORMAT_VERSION: &str = "2.3.1";

pub const CONFIG_FILE_NAME: &str = "ebwp-config.json";

pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    #[serde(rename = "Version")]
    pub version: String,
}

impl Default for PluginInfo {
    fn default() -> Self {
        PluginInfo {
            version: FORMAT_VERSION.to_string(),
        }
    }
}

/// How entry payloads are stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    #[serde(default)]
    pub filename: String,
    #[serde(default, deserialize_with = "flag")]
    pub encrypt: bool,
    #[serde(default)]
    pub cipher: CipherKind,
    /// Plaintext bytes read per chunk. Encrypted readers need it to find
    /// chunk boundaries.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Hex encoded salt used to derive the key from a password.
    #[serde(default)]
    pub key_salt: Option<String>,
}

impl Default for FileInfo {
    fn default() -> Self {
        FileInfo {
            filename: String::new(),
            encrypt: false,
            cipher: CipherKind::None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            key_salt: None,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

/// Request parameters chosen by the user when the backup was started.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Params {
    #[serde(default, deserialize_with = "flag")]
    pub ignore_database: bool,
    #[serde(default, deserialize_with = "flag")]
    pub ignore_plugins: bool,
    #[serde(default, deserialize_with = "flag")]
    pub ignore_themes: bool,
    #[serde(default, deserialize_with = "flag")]
    pub ignore_media: bool,
    #[serde(default, deserialize_with = "flag")]
    pub ignore_content: bool,
    #[serde(default, deserialize_with = "flag")]
    pub incremental: bool,
    #[serde(default, deserialize_with = "flag")]
    pub parent_incremental: bool,
    #[serde(default)]
    pub custom_name_tag: Option<String>,
    #[serde(default)]
    pub save_to: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Params {
    /// Module names that were left out of the backup.
    pub fn tags(&self) -> Vec<String> {
        [
            (self.ignore_database, "database"),
            (self.ignore_plugins, "plugins"),
            (self.ignore_themes, "themes"),
            (self.ignore_media, "media"),
            (self.ignore_content, "content"),
        ]
        .iter()
        .filter(|(ignored, _)| *ignored)
        .map(|(_, tag)| tag.to_string())
        .collect()
    }
}

/// BackupConfig represents the ebwp-config.json file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackupConfig {
    #[serde(rename = "Plugin", default)]
    pub plugin: PluginInfo,
    #[serde(rename = "FileInfo", default)]
    pub file_info: FileInfo,
    #[serde(rename = "Params", default)]
    pub params: Params,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BackupConfig {
    /// Load a BackupConfig from a JSON reader
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Load a BackupConfig from a file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

/// File count and byte total of a backup set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileStats {
    pub total: u64,
    pub size: u64,
}

/// The record stored on the first line of an archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArchiveMetadata {
    #[serde(default)]
    pub stats: FileStats,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: BackupConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ArchiveMetadata {
    pub fn new(stats: FileStats, filename: &str, request_id: &str, config: BackupConfig) -> Self {
        ArchiveMetadata {
            stats,
            filename: filename.to_string(),
            request_id: request_id.to_string(),
            tags: config.params.tags(),
            config,
            extra: Map::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_encrypted(&self) -> bool {
        self.config.file_info.encrypt
    }

    /// Salt recorded for password derived keys.
    pub fn key_salt(&self) -> Result<Option<Vec<u8>>> {
        self.config
            .file_info
            .key_salt
            .as_deref()
            .map(|salt| hex::decode(salt).map_err(crate::error::Error::from))
            .transpose()
    }
}

/// Accepts the loose encodings found in stored configs: booleans, 0/1 and
/// numeric strings.
fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        Value::String(s) => !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false")),
        _ => false,
    })
}

/// Compare dotted version strings numerically. Missing components count as 0.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering != std::cmp::Ordering::Equal {
            return ordering;
        }
    }
    std::cmp::Ordering::Equal
}
