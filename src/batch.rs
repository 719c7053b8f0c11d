//! Batch filtering of many EVT files onto a worker pool.
//!
//! A run records one filter parameter row, then gates each input file
//! independently: decode, gate, compute OPP statistics, write the OPP subset
//! and commit the summary. Files are never ordered relative to each other.
//!
//! Per-file problems (bad name, malformed content, unusable parameters, I/O)
//! are collected in the [`BatchReport`] and the run moves on. A storage
//! failure stops dispatch; files already in flight finish, then the error is
//! returned.
//!
//! Gated output is written to `<file>.opp.gz.tmp` and renamed into place
//! inside the summary transaction, which commits only once the rename has
//! succeeded. A file that yields no OPP rows has any earlier output removed
//! the same way. An OPP file on disk therefore always matches its database
//! row.

use crate::db::{OppSummary, Repository};
use crate::error::{AppResult, OppError};
use crate::evt::{decode_file, encode_gz, SeaflowFile};
use crate::gating::{FilterOptions, GatingEngine};
use futures::stream::{self, StreamExt};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Settings for one batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Cruise name recorded with every summary
    pub cruise: String,
    /// Root directory for gated OPP files
    pub output_dir: PathBuf,
    /// Number of files processed concurrently
    pub workers: usize,
    /// Gating parameters shared by every file
    pub options: FilterOptions,
}

/// A file that was gated and stored.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSuccess {
    /// Input path
    pub path: PathBuf,
    /// Gated output path; `None` when no particle passed the gate
    pub output: Option<PathBuf>,
    /// Summary row written for the file
    pub summary: OppSummary,
}

/// A file that could not be processed.
#[derive(Debug)]
pub struct FileFailure {
    /// Input path
    pub path: PathBuf,
    /// What went wrong
    pub error: OppError,
}

/// Outcome of a batch run.
#[derive(Debug)]
pub struct BatchReport {
    /// Filter parameter row used by the run
    pub filter_id: String,
    /// Files gated and stored
    pub succeeded: Vec<FileSuccess>,
    /// Files skipped with a file-scoped error
    pub failed: Vec<FileFailure>,
    /// Whether cancellation stopped the run before every file started
    pub cancelled: bool,
}

impl BatchReport {
    /// Files that finished, successfully or not.
    pub fn processed(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

enum Outcome {
    Done(PathBuf, AppResult<FileSuccess>),
    Skipped,
}

/// Drives a batch run against one repository.
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    repo: Repository,
    config: BatchConfig,
}

impl BatchOrchestrator {
    /// Create an orchestrator writing into `repo`.
    pub fn new(repo: Repository, config: BatchConfig) -> Self {
        Self { repo, config }
    }

    /// Run settings.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Gate every file in `files`.
    ///
    /// Setting `cancel` to `true` lets files already in flight finish and
    /// starts no new ones.
    pub async fn run(
        &self,
        files: Vec<PathBuf>,
        cancel: watch::Receiver<bool>,
    ) -> Result<BatchReport, OppError> {
        if self.config.workers == 0 {
            return Err(OppError::Config("workers must be at least 1".to_string()));
        }
        if self.config.cruise.trim().is_empty() {
            return Err(OppError::Config("cruise must be set".to_string()));
        }
        self.config.options.validate()?;

        let repo = self.repo.clone();
        let options = self.config.options;
        let filter = tokio::task::spawn_blocking(move || -> AppResult<_> {
            repo.ensure_tables()?;
            repo.ensure_indexes()?;
            repo.save_filter_parameters(&options)
        })
        .await
        .map_err(|e| OppError::Worker(e.to_string()))??;
        let filter_id = filter.id;

        tracing::info!(
            cruise = %self.config.cruise,
            files = files.len(),
            workers = self.config.workers,
            filter_id = %filter_id,
            "starting batch"
        );

        let halt = Arc::new(AtomicBool::new(false));
        let job = Arc::new(FileJob {
            repo: self.repo.clone(),
            cruise: self.config.cruise.clone(),
            output_dir: self.config.output_dir.clone(),
            options,
            filter_id: filter_id.clone(),
        });

        let mut outcomes = stream::iter(files)
            .map(|path| {
                let halt = Arc::clone(&halt);
                let cancel = cancel.clone();
                let job = Arc::clone(&job);
                async move {
                    if halt.load(Ordering::SeqCst) || *cancel.borrow() {
                        return Ok(Outcome::Skipped);
                    }
                    let input = path.clone();
                    tokio::task::spawn_blocking(move || job.process(&input))
                        .await
                        .map(|result| Outcome::Done(path, result))
                }
            })
            .buffer_unordered(self.config.workers);

        let mut report = BatchReport {
            filter_id,
            succeeded: Vec::new(),
            failed: Vec::new(),
            cancelled: false,
        };
        let mut fatal: Option<OppError> = None;
        let mut skipped = 0usize;

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(Outcome::Done(_, Ok(success))) => report.succeeded.push(success),
                Ok(Outcome::Done(path, Err(error))) if error.is_file_scoped() => {
                    tracing::warn!(path = %path.display(), error = %error, "file failed");
                    report.failed.push(FileFailure { path, error });
                }
                Ok(Outcome::Done(path, Err(error))) => {
                    tracing::error!(path = %path.display(), error = %error, "stopping batch");
                    halt.store(true, Ordering::SeqCst);
                    fatal.get_or_insert(error);
                }
                Ok(Outcome::Skipped) => skipped += 1,
                Err(join) => {
                    halt.store(true, Ordering::SeqCst);
                    fatal.get_or_insert(OppError::Worker(join.to_string()));
                }
            }
        }

        if let Some(error) = fatal {
            return Err(error);
        }
        report.cancelled = skipped > 0;

        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped,
            cancelled = report.cancelled,
            "batch finished"
        );
        Ok(report)
    }
}

/// Everything a worker needs to process one file.
struct FileJob {
    repo: Repository,
    cruise: String,
    output_dir: PathBuf,
    options: FilterOptions,
    filter_id: String,
}

impl FileJob {
    fn process(&self, path: &Path) -> AppResult<FileSuccess> {
        let file = SeaflowFile::parse(path)?;
        let file_id = file.file_id();
        let particles = decode_file(path)?;

        let mut engine = GatingEngine::new(&particles);
        let result = engine.gate(&self.options)?.clone();
        let stats = engine.opp_stats().unwrap_or_default();
        let summary = OppSummary::from_result(&self.cruise, &file_id, &result, stats, &self.filter_id);

        let target = file.opp_output_path(&self.output_dir);
        let output = if result.opp_count() > 0 {
            let bytes = encode_gz(&engine.opp_events())?;
            self.commit_with_output(&summary, &target, &bytes)?;
            Some(target)
        } else {
            // an earlier run may have left output for this file
            self.repo
                .save_opp_summary_with(&summary, || remove_if_present(&target), || {})?;
            None
        };

        tracing::debug!(
            file_id = %file_id,
            opp_count = summary.opp_count,
            evt_count = summary.evt_count,
            "gated file"
        );
        Ok(FileSuccess {
            path: path.to_path_buf(),
            output,
            summary,
        })
    }

    fn commit_with_output(&self, summary: &OppSummary, target: &Path, bytes: &[u8]) -> AppResult<()> {
        let tmp = temp_path(target);
        let attempt = || -> AppResult<()> {
            if let Some(dir) = tmp.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&tmp, bytes)?;
            self.repo.save_opp_summary_with(
                summary,
                || std::fs::rename(&tmp, target),
                || {
                    let _ = std::fs::rename(target, &tmp);
                },
            )
        };
        attempt().inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp);
        })
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StorageConfig;
    use crate::evt::{decode, write_file, ParticleEvent};
    use tempfile::TempDir;

    fn synthetic_rows(n: u16) -> Vec<ParticleEvent> {
        (0..n)
            .map(|i| {
                let d1 = 1000 + (i * 37) % 500;
                let d2 = d1 + (i * 13) % 200;
                let fsc = if i % 10 == 0 { 0 } else { 100 + (i * 97) % 30000 };
                ParticleEvent::new([i, 5, d1, d2, fsc, i, i, i, i, i])
            })
            .collect()
    }

    struct Fixture {
        dir: TempDir,
        repo: Repository,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let repo = Repository::open(dir.path().join("test.db"), StorageConfig::default()).unwrap();
            Self { dir, repo }
        }

        fn evt(&self, name: &str, rows: u16) -> PathBuf {
            let path = self.dir.path().join("testcruise").join("2014_185").join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            write_file(&path, &synthetic_rows(rows)).unwrap();
            path
        }

        fn orchestrator(&self, workers: usize) -> BatchOrchestrator {
            BatchOrchestrator::new(
                self.repo.clone(),
                BatchConfig {
                    cruise: "testcruise".to_string(),
                    output_dir: self.dir.path().join("oppdir"),
                    workers,
                    options: FilterOptions::default(),
                },
            )
        }
    }

    fn not_cancelled() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_batch_gates_and_stores_each_file() {
        let fx = Fixture::new();
        let files = vec![
            fx.evt("2014-07-04T00-00-02+00-00", 400),
            fx.evt("2014-07-04T00-03-02+00-00.gz", 300),
        ];

        let report = fx.orchestrator(2).run(files, not_cancelled()).await.unwrap();
        assert_eq!(report.succeeded.len(), 2);
        assert!(report.failed.is_empty());
        assert!(!report.cancelled);
        assert_eq!(fx.repo.opp_row_count().unwrap(), 2);
        assert!(fx.repo.load_filter_parameters(&report.filter_id).unwrap().is_some());

        for success in &report.succeeded {
            let output = success.output.as_ref().unwrap();
            assert!(output.starts_with(fx.dir.path().join("oppdir").join("2014_185")));
            let opp = decode(&std::fs::read(output).unwrap()).unwrap();
            assert_eq!(opp.len() as u64, success.summary.opp_count);
            assert!(!temp_path(output).exists());

            let stored = fx
                .repo
                .load_opp_summary("testcruise", &success.summary.file)
                .unwrap()
                .unwrap();
            assert_eq!(stored, success.summary);
            assert_eq!(stored.filter_id, report.filter_id);
        }
    }

    #[tokio::test]
    async fn test_bad_files_recorded_and_run_continues() {
        let fx = Fixture::new();
        let good = fx.evt("2014-07-04T00-00-02+00-00", 200);
        let truncated = fx.dir.path().join("testcruise/2014_185/2014-07-04T00-06-02+00-00");
        std::fs::write(&truncated, [5u8, 0, 0, 0, 1, 2, 3]).unwrap();
        let badname = fx.dir.path().join("testcruise/2014_185/notes.txt");
        std::fs::write(&badname, b"hello").unwrap();
        let empty = fx.dir.path().join("testcruise/2014_185/2014-07-04T00-09-02+00-00");
        std::fs::write(&empty, [0u8; 4]).unwrap();

        let report = fx
            .orchestrator(3)
            .run(vec![good, truncated, badname, empty], not_cancelled())
            .await
            .unwrap();
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 3);
        assert_eq!(report.processed(), 4);
        assert!(report
            .failed
            .iter()
            .any(|f| matches!(f.error, OppError::FileName(_))));
        assert_eq!(
            report
                .failed
                .iter()
                .filter(|f| matches!(f.error, OppError::Format(_)))
                .count(),
            2
        );
        assert_eq!(fx.repo.opp_row_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rerun_overwrites_summaries() {
        let fx = Fixture::new();
        let files = vec![fx.evt("2014-07-04T00-00-02+00-00", 250)];
        let first = fx.orchestrator(1).run(files.clone(), not_cancelled()).await.unwrap();
        let second = fx.orchestrator(1).run(files, not_cancelled()).await.unwrap();
        assert_ne!(first.filter_id, second.filter_id);
        assert_eq!(fx.repo.opp_row_count().unwrap(), 1);
        let stored = fx.repo.load_opp_summaries("testcruise").unwrap();
        assert_eq!(stored[0].filter_id, second.filter_id);
    }

    #[tokio::test]
    async fn test_rerun_with_empty_gate_removes_stale_output() {
        let fx = Fixture::new();
        let files = vec![fx.evt("2014-07-04T00-00-02+00-00", 250)];
        let first = fx.orchestrator(1).run(files.clone(), not_cancelled()).await.unwrap();
        let output = first.succeeded[0].output.clone().unwrap();
        assert!(output.exists());

        let mut strict = fx.orchestrator(1);
        strict.config.options = FilterOptions::default().with_notches(100.0, 100.0);
        let second = strict.run(files, not_cancelled()).await.unwrap();
        assert_eq!(second.succeeded.len(), 1);
        assert_eq!(second.succeeded[0].summary.opp_count, 0);
        assert!(second.succeeded[0].output.is_none());
        assert!(!output.exists());

        let stored = fx.repo.load_opp_summaries("testcruise").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].opp_count, 0);
        assert_eq!(stored[0].filter_id, second.filter_id);
    }

    #[tokio::test]
    async fn test_blocked_output_leaves_no_summary() {
        let fx = Fixture::new();
        let files = vec![fx.evt("2014-07-04T00-00-02+00-00", 250)];
        let target = fx
            .dir
            .path()
            .join("oppdir/2014_185/2014-07-04T00-00-02+00-00.opp.gz");
        std::fs::create_dir_all(target.join("occupied")).unwrap();

        let report = fx.orchestrator(1).run(files, not_cancelled()).await.unwrap();
        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].error, OppError::Io(_)));
        assert_eq!(fx.repo.opp_row_count().unwrap(), 0);
        assert!(!temp_path(&target).exists());
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_no_files() {
        let fx = Fixture::new();
        let files = vec![
            fx.evt("2014-07-04T00-00-02+00-00", 100),
            fx.evt("2014-07-04T00-03-02+00-00", 100),
        ];
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = fx.orchestrator(2).run(files, rx).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processed(), 0);
        assert_eq!(fx.repo.opp_row_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_stops_run() {
        let fx = Fixture::new();
        // an incompatible opp table makes every summary insert fail
        rusqlite::Connection::open(fx.repo.path())
            .unwrap()
            .execute_batch("CREATE TABLE opp (cruise TEXT, file TEXT)")
            .unwrap();
        let files = vec![fx.evt("2014-07-04T00-00-02+00-00", 200)];

        let err = fx.orchestrator(1).run(files, not_cancelled()).await.unwrap_err();
        assert!(matches!(err, OppError::Storage(_)));
        assert!(!err.is_file_scoped());

        let leftovers = crate::evt::find_evt_files(&fx.dir.path().join("oppdir"), true)
            .unwrap_or_default();
        assert!(leftovers.is_empty());
        let tmp = fx
            .dir
            .path()
            .join("oppdir/2014_185/2014-07-04T00-00-02+00-00.opp.gz.tmp");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_dispatch() {
        let fx = Fixture::new();
        let mut orchestrator = fx.orchestrator(1);
        orchestrator.config.options.width = None;
        let err = orchestrator
            .run(vec![fx.evt("2014-07-04T00-00-02+00-00", 50)], not_cancelled())
            .await
            .unwrap_err();
        assert!(matches!(err, OppError::Parameter(_)));

        orchestrator.config.options = FilterOptions::default();
        orchestrator.config.workers = 0;
        let err = orchestrator.run(Vec::new(), not_cancelled()).await.unwrap_err();
        assert!(matches!(err, OppError::Config(_)));
    }
}
