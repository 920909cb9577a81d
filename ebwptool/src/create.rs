use std::path::{Path, PathBuf};

use std::fs::File;
use std::io::BufWriter;

use ebwp::budget::{Budget, Deadline, Unlimited};
use ebwp::cipher::{self, Aes256CbcCipher, CipherKind, EncryptionKey};
use ebwp::config::{ArchiveMetadata, BackupConfig};
use ebwp::entry::EntryPathMapper;
use ebwp::job::{ArchiveJob, ArchiveSummary, ArchiveToken, StepOutcome};
use ebwp::naming::{self, BackupKind, BackupName};
use ebwp::planner::{self, BackupSetPlanner, FileSnapshot, ADD_LIST_FILE_NAME, REMOVE_LIST_FILE_NAME};
use ebwp::scanner::ArchiveScanner;
use ebwp::storage::LocalDirectory;

use crate::error::{Error, Result};
use crate::utils;

const TOKEN_FILE_NAME: &str = "ebwp-archive.token";
const TEMP_DIR_NAME: &str = "ebwp-tmp";

pub struct CreateOptions<'a> {
    pub sources: Vec<PathBuf>,
    pub out: PathBuf,
    pub excludes: Vec<&'a str>,
    pub config: Option<PathBuf>,
    pub encrypt: bool,
    pub password: Option<&'a str>,
    pub name_tag: Option<&'a str>,
    pub incremental: bool,
    pub snapshot: Option<PathBuf>,
    pub budget_secs: Option<u64>,
    pub token: Option<PathBuf>,
}

impl<'a> CreateOptions<'a> {
    pub fn from_matches(matches: &'a clap::ArgMatches<'a>, password: Option<&'a str>) -> Result<Self> {
        let sources: Vec<PathBuf> = matches
            .values_of("source")
            .map(|values| values.map(PathBuf::from).collect())
            .unwrap_or_default();
        if sources.is_empty() {
            return Err(Error::CliInputError("at least one --source is required".to_string()));
        }
        let budget_secs = match matches.value_of("budget-secs") {
            Some(secs) => Some(secs.parse::<u64>().map_err(|e| {
                Error::CliInputError(format!("--budget-secs: {}", e))
            })?),
            None => None,
        };

        Ok(CreateOptions {
            sources,
            out: PathBuf::from(utils::required(matches, "out")?),
            excludes: matches.values_of("exclude").map(|v| v.collect()).unwrap_or_default(),
            config: matches.value_of("config").map(PathBuf::from),
            encrypt: matches.is_present("encrypt"),
            password,
            name_tag: matches.value_of("name-tag"),
            incremental: matches.is_present("incremental"),
            snapshot: matches.value_of("snapshot").map(PathBuf::from),
            budget_secs,
            token: matches.value_of("token").map(PathBuf::from),
        })
    }
}

/// Token file contents: the job token and the archive it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingArchive {
    pub archive: String,
    pub token: ArchiveToken,
}

impl PendingArchive {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file).map_err(ebwp::error::Error::from)?)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        serde_json::to_writer(BufWriter::new(File::create(path)?), self)
            .map_err(ebwp::error::Error::from)?;
        Ok(())
    }
}

/// Create a new archive, or continue the one recorded in the token file when
/// an earlier invocation stopped before finishing.
pub fn create(options: &CreateOptions) -> Result<ArchiveSummary> {
    std::fs::create_dir_all(&options.out)?;

    let token_path = token_path(options);
    if token_path.is_file() {
        return resume(options, &token_path);
    }

    let mut config = match &options.config {
        Some(path) => BackupConfig::from_file(path)?,
        None => BackupConfig::default(),
    };
    config.params.incremental = options.incremental;
    if let Some(tag) = options.name_tag {
        config.params.custom_name_tag = Some(tag.to_string());
    }

    let previous = match (&options.snapshot, options.incremental) {
        (Some(path), true) if path.exists() => Some(FileSnapshot::from_file(path)?),
        _ => None,
    };
    let (name, previous) = choose_name(options, &config, previous)?;
    config.params.parent_incremental = name.kind == BackupKind::Increment;
    tracing::info!("Creating {}", name);

    let mut planner = BackupSetPlanner::new()
        .exclude_dir(TEMP_DIR_NAME)
        .exclude("*.ebwplist")?
        .exclude("*.token")?;
    for source in &options.sources {
        planner = planner.add_root(source);
    }
    // Files dropped into the temp directory, such as database dumps, are
    // archived as generated files.
    let temp_dir = options.out.join(TEMP_DIR_NAME);
    if temp_dir.is_dir() {
        planner = planner.add_root(&temp_dir);
    }
    for pattern in &options.excludes {
        planner = planner.exclude(pattern)?;
    }
    let filename = name.to_string();
    let set = planner.plan(&filename, previous.as_ref())?;
    set.write_lists(&options.out)?;

    let cipher = if options.encrypt || config.file_info.encrypt {
        let password = utils::get_password(options.password)?;
        let salt = cipher::generate_salt()?;
        config.file_info.encrypt = true;
        config.file_info.cipher = CipherKind::Aes256Cbc;
        config.file_info.key_salt = Some(hex::encode(salt));
        Some(Aes256CbcCipher::new(EncryptionKey::derive(&password, &salt)))
    } else {
        None
    };
    config.file_info.filename = filename.clone();

    let archive_path = options.out.join(&filename);
    let metadata = ArchiveMetadata::new(set.stats, &filename, &name.id, config);
    let mut job = ArchiveJob::new(&archive_path, metadata, set.add, set.remove)
        .with_path_mapper(path_mapper(&options.sources, &options.out))
        .with_storage(Box::new(LocalDirectory::new(&options.out)));
    if let Some(cipher) = cipher {
        job = job.with_cipher(Box::new(cipher));
    }

    // The new snapshot is only promoted once the archive is finished, which
    // may happen in a later invocation.
    if let Some(snapshot_path) = pending_snapshot(options) {
        set.snapshot.to_file(&snapshot_path)?;
    }

    let summary = run_job(&mut job, options, &filename, None)?;
    promote_snapshot(options)?;
    Ok(summary)
}

/// Continue an interrupted run from its token file. The archive name, lists,
/// chunk size and key salt all come from the first invocation.
fn resume(options: &CreateOptions, token_path: &Path) -> Result<ArchiveSummary> {
    let pending = PendingArchive::from_file(token_path)?;
    let archive_path = options.out.join(&pending.archive);
    tracing::info!(
        "Resuming {} at offset {}",
        pending.archive,
        pending.token.archive_offset
    );

    let metadata = ArchiveScanner::new(&archive_path)
        .metadata(false)?
        .ok_or_else(|| Error::NotFound(format!("metadata in {}", archive_path.display())))?;
    let password = if metadata.is_encrypted() {
        Some(utils::get_password(options.password)?)
    } else {
        None
    };
    let cipher = cipher::cipher_for(&metadata.config.file_info, password.as_deref())?;

    let add = planner::read_list(options.out.join(ADD_LIST_FILE_NAME))?;
    let remove = planner::read_list(options.out.join(REMOVE_LIST_FILE_NAME))?;
    let mut job = ArchiveJob::new(&archive_path, metadata, add, remove)
        .with_path_mapper(path_mapper(&options.sources, &options.out))
        .with_storage(Box::new(LocalDirectory::new(&options.out)));
    if let Some(cipher) = cipher {
        job = job.with_cipher(cipher);
    }

    let summary = run_job(&mut job, options, &pending.archive, Some(pending.token))?;
    promote_snapshot(options)?;
    Ok(summary)
}

fn pending_snapshot(options: &CreateOptions) -> Option<PathBuf> {
    match &options.snapshot {
        Some(path) if options.incremental => Some(path.with_extension("new")),
        _ => None,
    }
}

fn promote_snapshot(options: &CreateOptions) -> Result<()> {
    if let (Some(current), Some(last)) = (pending_snapshot(options), &options.snapshot) {
        if current.is_file() {
            FileSnapshot::promote(&current, last)?;
        }
    }
    Ok(())
}

/// Pick the archive name. Incremental runs attach to the chain of the last
/// snapshot when it is intact and fall back to a new chain otherwise.
fn choose_name(
    options: &CreateOptions,
    config: &BackupConfig,
    previous: Option<FileSnapshot>,
) -> Result<(BackupName, Option<FileSnapshot>)> {
    let tag = match (&config.params.custom_name_tag, options.sources.first()) {
        (Some(tag), _) => tag.clone(),
        (None, Some(source)) => source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "site".to_string()),
        (None, None) => "site".to_string(),
    };

    if !options.incremental {
        return Ok((BackupName::generate(BackupKind::Full, &tag)?, None));
    }

    if let Some(snapshot) = previous {
        let available = stored_archives(&options.out)?;
        match naming::resolve_parent(&snapshot.archive_name, &available) {
            Ok(decision) => return Ok((decision.next_child()?, Some(snapshot))),
            Err(e) => tracing::warn!("Starting a new incremental chain: {}", e),
        }
    }
    Ok((BackupName::generate(BackupKind::ChainParent, &tag)?, None))
}

pub fn stored_archives(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if BackupName::parse(&name).is_ok() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Entries are named relative to the first source.
fn path_mapper(sources: &[PathBuf], out: &Path) -> EntryPathMapper {
    let root = sources.first().cloned().unwrap_or_default();
    EntryPathMapper::new(root, out.join(TEMP_DIR_NAME))
}

fn token_path(options: &CreateOptions) -> PathBuf {
    options
        .token
        .clone()
        .unwrap_or_else(|| options.out.join(TOKEN_FILE_NAME))
}

fn run_job(
    job: &mut ArchiveJob,
    options: &CreateOptions,
    archive: &str,
    mut token: Option<ArchiveToken>,
) -> Result<ArchiveSummary> {
    let token_path = token_path(options);
    loop {
        let mut budget: Box<dyn Budget> = match options.budget_secs {
            Some(secs) => Box::new(Deadline::from_secs(secs)),
            None => Box::new(Unlimited),
        };
        match job.run_step(token.as_ref(), budget.as_mut())? {
            StepOutcome::Paused(next) => {
                let pending = PendingArchive {
                    archive: archive.to_string(),
                    token: next,
                };
                pending.to_file(&token_path)?;
                token = Some(PendingArchive::from_file(&token_path)?.token);
            }
            StepOutcome::Finished(summary) => {
                if token_path.exists() {
                    std::fs::remove_file(&token_path)?;
                }
                return Ok(summary);
            }
        }
    }
}
