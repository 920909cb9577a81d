use ebwp::budget::{StepBudget, Unlimited};
use ebwp::config::{ArchiveMetadata, BackupConfig};
use ebwp::entry::EntryPathMapper;
use ebwp::error::Error;
use ebwp::job::{ArchiveJob, ArchiveToken, CollectingStatus, StepOutcome};
use ebwp::planner::{read_list, BackupSetPlanner, FileSnapshot};
use ebwp::scanner::ArchiveScanner;
use filetime::FileTime;
use std::io::Write;
use std::path::{Path, PathBuf};

const ARCHIVE_NAME: &str = "ebwpbuwa-example-1700000000-0a1b2c3d4e.ebwp";

struct Site {
    dir: tempfile::TempDir,
}

impl Site {
    fn new() -> Site {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("site");
        std::fs::create_dir_all(root.join("wp-content/uploads")).unwrap();
        std::fs::write(root.join("index.php"), b"<?php echo 'hi';").unwrap();
        std::fs::write(root.join("wp-config.php"), b"<?php define('DB', 'x');").unwrap();
        let image: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(root.join("wp-content/uploads/photo.jpg"), image).unwrap();
        Site { dir }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("site")
    }

    fn job(&self, archive: &Path, previous: Option<&FileSnapshot>) -> ArchiveJob<CollectingStatus> {
        let set = BackupSetPlanner::new()
            .add_root(self.root())
            .plan(ARCHIVE_NAME, previous)
            .unwrap();
        let mut config = BackupConfig::default();
        config.file_info.chunk_size = 512;
        let metadata = ArchiveMetadata::new(set.stats, ARCHIVE_NAME, "0a1b2c3d4e", config);
        ArchiveJob::new(archive, metadata, set.add, set.remove)
            .with_path_mapper(EntryPathMapper::new(self.root(), self.dir.path().join("tmp")))
            .with_status(CollectingStatus::default())
    }
}

fn run_to_end(job: &mut ArchiveJob<CollectingStatus>, steps: usize) -> usize {
    let mut token: Option<ArchiveToken> = None;
    let mut count = 0;
    loop {
        count += 1;
        match job.run_step(token.as_ref(), &mut StepBudget::new(steps)).unwrap() {
            StepOutcome::Paused(next) => token = Some(next),
            StepOutcome::Finished(_) => return count,
        }
    }
}

#[test]
fn test_many_steps_match_one_step() {
    let site = Site::new();
    let single = site.dir.path().join("single.ebwp");
    let stepped = site.dir.path().join("stepped.ebwp");

    let mut job = site.job(&single, None);
    match job.run_step(None, &mut Unlimited).unwrap() {
        StepOutcome::Finished(summary) => {
            assert_eq!(summary.totals.count, 3);
            assert_eq!(summary.totals.size, 16 + 24 + 3000);
            assert_eq!(summary.length, std::fs::metadata(&single).unwrap().len());
        }
        other => panic!("unexpected {:?}", other),
    }

    let mut job = site.job(&stepped, None);
    let steps = run_to_end(&mut job, 1);
    assert!(steps > 3);
    assert_eq!(std::fs::read(&stepped).unwrap(), std::fs::read(&single).unwrap());
    assert_eq!(job.status().updates.last().unwrap().progress, 100.0);
}

#[test]
fn test_token_survives_a_new_process() {
    let site = Site::new();
    let single = site.dir.path().join("single.ebwp");
    run_to_end(&mut site.job(&single, None), usize::MAX);

    let archive = site.dir.path().join("resumed.ebwp");
    let token_path = site.dir.path().join("token.json");
    let mut token = None;
    loop {
        // Each iteration builds a fresh job as a new request would.
        let mut job = site.job(&archive, None);
        match job.run_step(token.as_ref(), &mut StepBudget::new(2)).unwrap() {
            StepOutcome::Paused(next) => {
                next.to_file(&token_path).unwrap();
                token = Some(ArchiveToken::from_file(&token_path).unwrap());
            }
            StepOutcome::Finished(_) => break,
        }
    }
    assert_eq!(std::fs::read(&archive).unwrap(), std::fs::read(&single).unwrap());
}

#[test]
fn test_resume_discards_bytes_past_token() {
    let site = Site::new();
    let single = site.dir.path().join("single.ebwp");
    run_to_end(&mut site.job(&single, None), usize::MAX);

    let archive = site.dir.path().join("crashed.ebwp");
    let mut job = site.job(&archive, None);
    let token = match job.run_step(None, &mut StepBudget::new(2)).unwrap() {
        StepOutcome::Paused(token) => token,
        other => panic!("unexpected {:?}", other),
    };

    // A step that crashed after the token was saved left partial output.
    let mut file = std::fs::OpenOptions::new().append(true).open(&archive).unwrap();
    file.write_all(b"half written chunk").unwrap();
    drop(file);

    let mut token = Some(token);
    loop {
        match job.run_step(token.as_ref(), &mut Unlimited).unwrap() {
            StepOutcome::Paused(next) => token = Some(next),
            StepOutcome::Finished(_) => break,
        }
    }
    assert_eq!(std::fs::read(&archive).unwrap(), std::fs::read(&single).unwrap());
}

#[test]
fn test_file_removed_while_paused_keeps_later_entries() {
    let site = Site::new();
    std::fs::write(site.root().join("zz-readme.txt"), b"read me").unwrap();
    let photo = site.root().join("wp-content/uploads/photo.jpg");
    let archive = site.dir.path().join("archive.ebwp");
    let mut job = site.job(&archive, None);

    let mut token = None;
    let cursor = loop {
        match job.run_step(token.as_ref(), &mut StepBudget::new(1)).unwrap() {
            StepOutcome::Paused(next) => {
                if let Some(cursor) = next.current_file.clone().filter(|c| c.path == photo) {
                    token = Some(next);
                    break cursor;
                }
                token = Some(next);
            }
            other => panic!("unexpected {:?}", other),
        }
    };
    std::fs::remove_file(&photo).unwrap();

    let summary = match job.run_step(token.as_ref(), &mut Unlimited).unwrap() {
        StepOutcome::Finished(summary) => summary,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(summary.totals.skipped, 1);
    assert_eq!(summary.totals.count, 3);

    let page = ArchiveScanner::new(&archive).scan_all().unwrap();
    let paths: Vec<&str> = page.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["index.php", "wp-config.php", "wp-content/uploads/photo.jpg", "zz-readme.txt"]
    );
    assert_eq!(page.entries[2].len(), cursor.offset);
    assert_eq!(ebwp::completeness::check(&archive), ebwp::completeness::Completeness::Complete);
}

#[test]
fn test_resume_rejects_short_archive() {
    let site = Site::new();
    let archive = site.dir.path().join("short.ebwp");
    let mut job = site.job(&archive, None);
    let token = match job.run_step(None, &mut StepBudget::new(2)).unwrap() {
        StepOutcome::Paused(token) => token,
        other => panic!("unexpected {:?}", other),
    };

    let file = std::fs::OpenOptions::new().write(true).open(&archive).unwrap();
    file.set_len(token.archive_offset - 1).unwrap();
    drop(file);

    match job.run_step(Some(&token), &mut Unlimited) {
        Err(Error::TokenMismatch { expected, actual }) => {
            assert_eq!(expected, token.archive_offset);
            assert_eq!(actual, token.archive_offset - 1);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_incremental_plan() {
    let site = Site::new();
    let root = site.root();
    let index = root.join("index.php");
    let config = root.join("wp-config.php");
    let photo = root.join("wp-content/uploads/photo.jpg");
    filetime::set_file_mtime(&index, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
    filetime::set_file_mtime(&config, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

    let first = BackupSetPlanner::new().add_root(&root).plan(ARCHIVE_NAME, None).unwrap();
    assert_eq!(first.add.len(), 3);
    let snapshot_path = site.dir.path().join("last.snapshot");
    first.snapshot.to_file(&snapshot_path).unwrap();
    let previous = FileSnapshot::from_file(&snapshot_path).unwrap();
    assert_eq!(previous, first.snapshot);

    filetime::set_file_mtime(&index, FileTime::from_unix_time(1_600_000_500, 0)).unwrap();
    std::fs::remove_file(&photo).unwrap();
    let added = root.join("new.php");
    std::fs::write(&added, b"<?php").unwrap();

    let next = BackupSetPlanner::new()
        .add_root(&root)
        .plan("ebwpinc-example-1700000000-0a1b2c3d4e-0.ebwp", Some(&previous))
        .unwrap();
    assert_eq!(next.add, vec![index, added]);
    assert_eq!(next.remove, vec![photo]);
    assert_eq!(next.stats.total, 2);

    let (add_list, remove_list) = next.write_lists(site.dir.path()).unwrap();
    assert_eq!(read_list(add_list).unwrap(), next.add);
    assert_eq!(read_list(remove_list).unwrap(), next.remove);
}

#[test]
fn test_incremental_archive_records_deletions() {
    let site = Site::new();
    let root = site.root();
    let first = BackupSetPlanner::new().add_root(&root).plan(ARCHIVE_NAME, None).unwrap();
    std::fs::remove_file(root.join("wp-config.php")).unwrap();

    let archive = site.dir.path().join("inc.ebwp");
    let mut job = site.job(&archive, Some(&first.snapshot));
    run_to_end(&mut job, usize::MAX);

    let page = ArchiveScanner::new(&archive).scan_all().unwrap();
    assert!(page.entries.is_empty());
    assert_eq!(page.deleted, vec!["wp-config.php"]);
}
