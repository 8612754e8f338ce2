//! Ingestion coordinator: classification, batched commits and diff mirroring

use super::classify::{classify, Change};
use super::progress::IngestProgress;
use super::source::{
    ImportError, IngestCheckpoint, IngestEnd, IngestStats, PageRecord, RecordSource,
};
use crate::config::{Config, IngestConfig, ParseErrorPolicy};
use crate::store::{DiffBatch, DiffStore, PageBatch, PageStore};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Drives one or more ingestion runs against a page store and optional diff store
pub struct IngestCoordinator {
    /// Ingestion configuration
    config: IngestConfig,
    /// Authoritative snapshot
    pages: PageStore,
    /// Append-only change log
    diff: Option<DiffStore>,
    /// Raised from outside to stop after the in-flight batch commits
    cancel: Arc<AtomicBool>,
    /// Records at the head of the source already committed by an earlier run
    skip_records: usize,
    /// Quiet mode
    quiet: bool,
}

/// Counts for the batch currently open; merged into the run stats on commit
#[derive(Debug, Default)]
struct BatchTally {
    processed: usize,
    inserted: usize,
    updated: usize,
    unchanged: usize,
    diff_rows: usize,
}

impl BatchTally {
    fn merge_into(&self, stats: &mut IngestStats) {
        stats.records_processed += self.processed;
        stats.inserted += self.inserted;
        stats.updated += self.updated;
        stats.unchanged += self.unchanged;
        stats.diff_rows += self.diff_rows;
    }
}

impl IngestCoordinator {
    /// Create a coordinator over already opened stores
    pub fn new(
        config: IngestConfig,
        pages: PageStore,
        diff: Option<DiffStore>,
    ) -> Result<Self, ImportError> {
        if config.batch_size == 0 {
            return Err(ImportError::Config("batch_size must be positive".into()));
        }
        Ok(Self {
            config,
            pages,
            diff,
            cancel: Arc::new(AtomicBool::new(false)),
            skip_records: 0,
            quiet: false,
        })
    }

    /// Set quiet mode (no heartbeat output)
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Share an externally owned cancel flag
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that stops the run after the in-flight batch when set
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run ingestion from the start of a source
    pub fn ingest<S: RecordSource>(&mut self, mut source: S) -> Result<IngestStats, ImportError> {
        self.run(&mut source)
    }

    /// Run ingestion skipping the records a checkpoint reports as committed.
    ///
    /// A checkpoint written for a different source is ignored and the run
    /// starts from the first record.
    pub fn resume<S: RecordSource>(
        &mut self,
        mut source: S,
        checkpoint: &IngestCheckpoint,
    ) -> Result<IngestStats, ImportError> {
        let source_path = source.source_path();
        if checkpoint.source_path != source_path {
            warn!(
                "Checkpoint was written for {}, not {}; ingesting from the beginning",
                checkpoint.source_path.display(),
                source_path.display()
            );
            return self.run(&mut source);
        }

        info!(
            "Resuming from checkpoint: {} records committed in {} batches",
            checkpoint.records_committed, checkpoint.batches_committed
        );
        self.skip_records = checkpoint.records_committed;
        let result = self.run(&mut source);
        self.skip_records = 0;
        result
    }

    fn run<S: RecordSource>(&mut self, source: &mut S) -> Result<IngestStats, ImportError> {
        let source_name = source.source_name().to_string();
        let source_path = source.source_path();
        let batch_size = self.config.batch_size;
        let policy = self.config.on_parse_error;
        let skip = self.skip_records;
        info!(
            "Starting ingestion from {} (batch_size={}, diff={})",
            source_name,
            batch_size,
            self.diff.is_some()
        );

        let mut progress = IngestProgress::new(&source_name, self.quiet);
        let mut stats = IngestStats::default();
        let mut records = source.iter_records();
        let mut position = 0usize;
        let mut end: Option<IngestEnd> = None;

        while end.is_none() {
            let page_batch = self.pages.begin()?;
            let diff_batch = match self.diff.as_mut() {
                Some(diff) => Some(diff.begin()?),
                None => None,
            };
            let mut tally = BatchTally::default();
            let mut rollback = false;

            while tally.processed < batch_size {
                if self.cancel.load(Ordering::Relaxed) {
                    info!("Ingestion cancelled");
                    end = Some(IngestEnd::Cancelled);
                    break;
                }

                match records.next() {
                    None => {
                        end = Some(IngestEnd::Exhausted);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Error reading dump after {} records: {}", position, e);
                        rollback = policy == ParseErrorPolicy::Rollback;
                        end = Some(IngestEnd::ParseError(e.to_string()));
                        break;
                    }
                    Some(Ok(record)) => {
                        position += 1;
                        if position <= skip {
                            stats.records_resumed += 1;
                            continue;
                        }
                        apply_record(&page_batch, diff_batch.as_ref(), &record, &mut tally)?;
                    }
                }
            }

            if rollback {
                warn!("Rolling back {} records of the in-flight batch", tally.processed);
                page_batch.rollback()?;
                diff_batch.map(DiffBatch::rollback).transpose()?;
                break;
            }

            // Page store first, then the diff store: a crash in between leaves
            // the diff store at most one batch behind
            page_batch.commit()?;
            diff_batch.map(DiffBatch::commit).transpose()?;

            if tally.processed > 0 {
                tally.merge_into(&mut stats);
                stats.batches_committed += 1;
                debug!(
                    "Committed batch {} ({} records, {} total)",
                    stats.batches_committed, tally.processed, stats.records_processed
                );
                progress.batch_committed(&stats);
                save_checkpoint(&self.config, &source_path, &stats);
            }
        }

        stats.end = end.unwrap_or_default();
        stats.heartbeats = progress.heartbeats();
        stats.elapsed_seconds = progress.elapsed().as_secs_f64();
        stats.update_rate();

        if stats.end == IngestEnd::Cancelled {
            progress.cancelled();
        } else {
            progress.finish(&stats);
        }

        info!(
            "Ingested {} records ({} inserted, {} updated, {} unchanged) in {:.1}s",
            stats.records_processed,
            stats.inserted,
            stats.updated,
            stats.unchanged,
            stats.elapsed_seconds
        );

        Ok(stats)
    }

    /// Access the page store
    pub fn pages(&self) -> &PageStore {
        &self.pages
    }

    /// Access the diff store, if enabled
    pub fn diff(&self) -> Option<&DiffStore> {
        self.diff.as_ref()
    }

    /// Release the stores
    pub fn into_stores(self) -> (PageStore, Option<DiffStore>) {
        (self.pages, self.diff)
    }
}

/// Persist the committed position; failures never stop ingestion
fn save_checkpoint(config: &IngestConfig, source_path: &Path, stats: &IngestStats) {
    let Some(ref path) = config.checkpoint_path else {
        return;
    };
    let checkpoint = IngestCheckpoint::new(
        source_path.to_path_buf(),
        stats.records_resumed + stats.records_processed,
        stats.batches_committed,
    );
    if let Err(e) = checkpoint.save(path) {
        warn!("Failed to save checkpoint: {}", e);
    }
}

/// Classify one record and apply the resulting mutation to both stores
fn apply_record(
    pages: &PageBatch<'_>,
    diff: Option<&DiffBatch<'_>>,
    record: &PageRecord,
    tally: &mut BatchTally,
) -> Result<Change, ImportError> {
    let change = classify(pages, &record.title, record.revision_id)?;

    match change {
        Change::Insert => {
            pages.insert(record)?;
            tally.inserted += 1;
        }
        Change::Update { id, previous_revision } => {
            debug!(
                "New revision for page {} (row {}) old: {} new: {}",
                record.title, id, previous_revision, record.revision_id
            );
            pages.update(record)?;
            tally.updated += 1;
        }
        Change::Unchanged => {
            tally.unchanged += 1;
        }
    }

    if change.is_write() {
        if let Some(diff) = diff {
            diff.append(record)?;
            tally.diff_rows += 1;
        }
    }

    tally.processed += 1;
    Ok(change)
}

/// Builder for IngestCoordinator
pub struct IngestCoordinatorBuilder {
    config: IngestConfig,
    db_path: PathBuf,
    diff_db_path: Option<PathBuf>,
    cache_size_kib: u32,
    cancel: Option<Arc<AtomicBool>>,
    quiet: bool,
}

impl IngestCoordinatorBuilder {
    /// Create a new builder with default settings
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            config: IngestConfig::default(),
            db_path: db_path.as_ref().to_path_buf(),
            diff_db_path: None,
            cache_size_kib: 0,
            cancel: None,
            quiet: false,
        }
    }

    /// Seed the builder from a full configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            config: config.ingest.clone(),
            db_path: config.store.db_path.clone(),
            diff_db_path: config.store.diff_db_path.clone(),
            cache_size_kib: config.store.cache_size_kib,
            cancel: None,
            quiet: false,
        }
    }

    /// Enable the diff store
    pub fn with_diff_db(mut self, path: Option<impl AsRef<Path>>) -> Self {
        self.diff_db_path = path.map(|p| p.as_ref().to_path_buf());
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set handling of the in-flight batch on parse errors
    pub fn with_parse_error_policy(mut self, policy: ParseErrorPolicy) -> Self {
        self.config.on_parse_error = policy;
        self
    }

    /// Set checkpoint path
    pub fn with_checkpoint(mut self, path: impl AsRef<Path>) -> Self {
        self.config.checkpoint_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set page cache hint for the page store
    pub fn with_cache_size_kib(mut self, kib: u32) -> Self {
        self.cache_size_kib = kib;
        self
    }

    /// Share an externally owned cancel flag
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Set quiet mode
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Open the stores and build the coordinator
    pub fn build(self) -> Result<IngestCoordinator, ImportError> {
        if self.config.batch_size == 0 {
            return Err(ImportError::Config("batch_size must be positive".into()));
        }

        let pages = PageStore::open(&self.db_path)?;
        pages.set_cache_size_kib(self.cache_size_kib)?;
        let diff = self.diff_db_path.as_ref().map(DiffStore::open).transpose()?;

        let mut coordinator = IngestCoordinator::new(self.config, pages, diff)?.with_quiet(self.quiet);
        if let Some(cancel) = self.cancel {
            coordinator = coordinator.with_cancel_flag(cancel);
        }
        Ok(coordinator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::VecSource;

    /// Raises the cancel flag as the record at `after` (1-based) is handed out
    struct CancellingSource {
        records: Vec<PageRecord>,
        after: usize,
        cancel: Arc<AtomicBool>,
    }

    impl RecordSource for CancellingSource {
        fn iter_records(&mut self) -> Box<dyn Iterator<Item = Result<PageRecord, ImportError>> + '_> {
            let after = self.after;
            let cancel = self.cancel.clone();
            Box::new(self.records.drain(..).enumerate().map(move |(i, r)| {
                if i + 1 == after {
                    cancel.store(true, Ordering::Relaxed);
                }
                Ok(r)
            }))
        }

        fn source_name(&self) -> &str {
            "cancelling"
        }
    }

    fn record(title: &str, rev: u64) -> PageRecord {
        PageRecord::new(title, rev, format!("2024-01-{:02}T00:00:00Z", rev), format!("{} body r{}", title, rev))
    }

    fn coordinator(batch_size: usize, with_diff: bool) -> IngestCoordinator {
        let config = IngestConfig {
            batch_size,
            ..Default::default()
        };
        let diff = with_diff.then(|| DiffStore::open_in_memory().unwrap());
        IngestCoordinator::new(config, PageStore::open_in_memory().unwrap(), diff)
            .unwrap()
            .with_quiet(true)
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let config = IngestConfig {
            batch_size: 0,
            ..Default::default()
        };
        let result = IngestCoordinator::new(config, PageStore::open_in_memory().unwrap(), None);
        assert!(matches!(result, Err(ImportError::Config(_))));
    }

    #[test]
    fn test_insert_update_unchanged_counts() {
        let mut c = coordinator(2, true);
        let stats = c
            .ingest(VecSource::new(vec![record("T1", 1), record("T2", 1), record("T1", 2), record("T2", 1)]))
            .unwrap();

        assert_eq!(stats.records_processed, 4);
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.diff_rows, 3);
        assert_eq!(stats.batches_committed, 2);
        assert_eq!(stats.end, IngestEnd::Exhausted);
        assert_eq!(c.diff().unwrap().change_count().unwrap(), 3);
    }

    #[test]
    fn test_same_title_twice_in_one_batch() {
        let mut c = coordinator(10, false);
        let stats = c
            .ingest(VecSource::new(vec![record("T1", 1), record("T1", 2), record("T1", 2)]))
            .unwrap();

        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(c.pages().page_count().unwrap(), 1);
        assert_eq!(c.pages().get("T1").unwrap().unwrap().revision_id, 2);
    }

    #[test]
    fn test_exact_multiple_of_batch_size() {
        let mut c = coordinator(2, false);
        let stats = c
            .ingest(VecSource::new(vec![record("A", 1), record("B", 1), record("C", 1), record("D", 1)]))
            .unwrap();
        assert_eq!(stats.records_processed, 4);
        assert_eq!(stats.batches_committed, 2);
    }

    #[test]
    fn test_empty_source() {
        let mut c = coordinator(2, true);
        let stats = c.ingest(VecSource::new(Vec::new())).unwrap();
        assert_eq!(stats.records_processed, 0);
        assert_eq!(stats.batches_committed, 0);
        assert_eq!(stats.end, IngestEnd::Exhausted);
    }

    #[test]
    fn test_parse_error_commits_in_flight_batch_by_default() {
        let mut c = coordinator(2, true);
        let stats = c
            .ingest(VecSource::from_results(vec![
                Ok(record("A", 1)),
                Ok(record("B", 1)),
                Ok(record("C", 1)),
                Err(ImportError::XmlParse("unexpected token".into())),
                Ok(record("D", 1)),
            ]))
            .unwrap();

        assert!(matches!(stats.end, IngestEnd::ParseError(ref msg) if msg.contains("unexpected token")));
        assert_eq!(stats.records_processed, 3);
        assert_eq!(c.pages().page_count().unwrap(), 3);
        assert!(c.pages().get("D").unwrap().is_none());
        assert_eq!(c.diff().unwrap().change_count().unwrap(), 3);
    }

    #[test]
    fn test_parse_error_rollback_keeps_completed_batches() {
        let config = IngestConfig {
            batch_size: 2,
            on_parse_error: ParseErrorPolicy::Rollback,
            ..Default::default()
        };
        let mut c = IngestCoordinator::new(
            config,
            PageStore::open_in_memory().unwrap(),
            Some(DiffStore::open_in_memory().unwrap()),
        )
        .unwrap()
        .with_quiet(true);

        let stats = c
            .ingest(VecSource::from_results(vec![
                Ok(record("A", 1)),
                Ok(record("B", 1)),
                Ok(record("C", 1)),
                Err(ImportError::InvalidFormat("truncated".into())),
            ]))
            .unwrap();

        assert_eq!(stats.records_processed, 2);
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(c.pages().page_count().unwrap(), 2);
        assert!(c.pages().get("C").unwrap().is_none());
        assert_eq!(c.diff().unwrap().change_count().unwrap(), 2);
    }

    #[test]
    fn test_cancel_before_start_commits_nothing() {
        let mut c = coordinator(2, false);
        c.cancel_handle().store(true, Ordering::Relaxed);
        let stats = c.ingest(VecSource::new(vec![record("A", 1)])).unwrap();
        assert_eq!(stats.end, IngestEnd::Cancelled);
        assert_eq!(stats.records_processed, 0);
        assert_eq!(c.pages().page_count().unwrap(), 0);
    }

    #[test]
    fn test_cancel_mid_batch_commits_in_flight_batch() {
        let mut c = coordinator(10, true);
        let cancel = c.cancel_handle();
        let stats = c
            .ingest(CancellingSource {
                records: vec![record("A", 1), record("B", 1), record("C", 1), record("D", 1)],
                after: 2,
                cancel,
            })
            .unwrap();

        assert_eq!(stats.end, IngestEnd::Cancelled);
        assert_eq!(stats.records_processed, 2);
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(c.pages().page_count().unwrap(), 2);
        assert!(c.pages().get("C").unwrap().is_none());
        assert_eq!(c.diff().unwrap().change_count().unwrap(), 2);
    }

    #[test]
    fn test_cancel_in_second_batch_keeps_both_batches() {
        let mut c = coordinator(2, true);
        let cancel = c.cancel_handle();
        let stats = c
            .ingest(CancellingSource {
                records: vec![record("A", 1), record("B", 1), record("C", 1), record("D", 1), record("E", 1)],
                after: 3,
                cancel,
            })
            .unwrap();

        assert_eq!(stats.end, IngestEnd::Cancelled);
        assert_eq!(stats.records_processed, 3);
        assert_eq!(stats.batches_committed, 2);
        assert_eq!(c.pages().page_count().unwrap(), 3);
        assert_eq!(c.diff().unwrap().change_count().unwrap(), 3);
    }

    #[test]
    fn test_heartbeat_per_committed_batch() {
        let config = IngestConfig {
            batch_size: 2,
            ..Default::default()
        };
        let mut c = IngestCoordinator::new(config, PageStore::open_in_memory().unwrap(), None).unwrap();
        let stats = c
            .ingest(VecSource::new(vec![
                record("A", 1),
                record("B", 1),
                record("C", 1),
                record("D", 1),
                record("E", 1),
            ]))
            .unwrap();

        assert_eq!(stats.batches_committed, 3);
        assert_eq!(stats.heartbeats, 3);
    }

    #[test]
    fn test_no_heartbeat_for_trailing_empty_batch() {
        let config = IngestConfig {
            batch_size: 2,
            ..Default::default()
        };
        let mut c = IngestCoordinator::new(config, PageStore::open_in_memory().unwrap(), None).unwrap();
        let stats = c
            .ingest(VecSource::new(vec![record("A", 1), record("B", 1)]))
            .unwrap();

        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.heartbeats, 1);
    }

    #[test]
    fn test_quiet_run_has_no_heartbeats() {
        let mut c = coordinator(2, false);
        let stats = c
            .ingest(VecSource::new(vec![record("A", 1), record("B", 1), record("C", 1)]))
            .unwrap();
        assert_eq!(stats.batches_committed, 2);
        assert_eq!(stats.heartbeats, 0);
    }

    #[test]
    fn test_resume_ignores_checkpoint_of_other_source() {
        let mut c = coordinator(2, true);
        let checkpoint = IngestCheckpoint::new(PathBuf::from("some-other-dump.xml.bz2"), 2, 1);
        let stats = c
            .resume(
                VecSource::new(vec![record("A", 1), record("B", 1), record("C", 1)]),
                &checkpoint,
            )
            .unwrap();

        assert_eq!(stats.records_resumed, 0);
        assert_eq!(stats.records_processed, 3);
        assert_eq!(c.pages().page_count().unwrap(), 3);
        assert!(c.pages().get("A").unwrap().is_some());
    }

    #[test]
    fn test_resume_skips_committed_prefix() {
        let mut c = coordinator(2, true);
        let checkpoint = IngestCheckpoint::new(PathBuf::from("memory"), 2, 1);
        let stats = c
            .resume(
                VecSource::new(vec![record("A", 1), record("B", 1), record("C", 1)]),
                &checkpoint,
            )
            .unwrap();

        assert_eq!(stats.records_resumed, 2);
        assert_eq!(stats.records_processed, 1);
        assert_eq!(c.pages().page_count().unwrap(), 1);
        assert!(c.pages().get("C").unwrap().is_some());
    }

    #[test]
    fn test_checkpoint_written_after_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let checkpoint_path = tmp.path().join("run.checkpoint");
        let config = IngestConfig {
            batch_size: 2,
            checkpoint_path: Some(checkpoint_path.clone()),
            ..Default::default()
        };
        let mut c = IngestCoordinator::new(config, PageStore::open_in_memory().unwrap(), None)
            .unwrap()
            .with_quiet(true);
        c.ingest(VecSource::new(vec![record("A", 1), record("B", 1), record("C", 1)]))
            .unwrap();

        let checkpoint = IngestCheckpoint::load(&checkpoint_path).unwrap();
        assert_eq!(checkpoint.source_path, PathBuf::from("memory"));
        assert_eq!(checkpoint.records_committed, 3);
        assert_eq!(checkpoint.batches_committed, 2);
    }

    #[test]
    fn test_checkpoint_and_diff_store_together() {
        let tmp = tempfile::tempdir().unwrap();
        let checkpoint_path = tmp.path().join("run.checkpoint");
        let config = IngestConfig {
            batch_size: 2,
            checkpoint_path: Some(checkpoint_path.clone()),
            ..Default::default()
        };
        let mut c = IngestCoordinator::new(
            config,
            PageStore::open_in_memory().unwrap(),
            Some(DiffStore::open_in_memory().unwrap()),
        )
        .unwrap()
        .with_quiet(true);
        let stats = c
            .ingest(VecSource::new(vec![record("A", 1), record("B", 1), record("A", 2)]))
            .unwrap();

        assert_eq!(stats.diff_rows, 3);
        assert_eq!(c.diff().unwrap().change_count().unwrap(), 3);
        assert_eq!(IngestCheckpoint::load(&checkpoint_path).unwrap().records_committed, 3);
    }

    #[test]
    fn test_builder_opens_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut c = IngestCoordinatorBuilder::new(tmp.path().join("wiki.db"))
            .with_diff_db(Some(tmp.path().join("diff.db")))
            .with_batch_size(5)
            .with_cache_size_kib(4096)
            .with_quiet(true)
            .build()
            .unwrap();
        let stats = c.ingest(VecSource::new(vec![record("A", 1)])).unwrap();
        assert_eq!(stats.inserted, 1);
        assert!(tmp.path().join("wiki.db").exists());
        assert!(tmp.path().join("diff.db").exists());
    }

    #[test]
    fn test_builder_rejects_zero_batch_size() {
        let tmp = tempfile::tempdir().unwrap();
        let result = IngestCoordinatorBuilder::new(tmp.path().join("wiki.db"))
            .with_batch_size(0)
            .build();
        assert!(matches!(result, Err(ImportError::Config(_))));
    }
}
