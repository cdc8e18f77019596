// src/engine/batch.rs
//
// Batch driver: an ordered file list, one settings snapshot per batch, and
// per-file status/progress reporting. A failed file never aborts the batch.

use crate::config::{Concurrency, EngineConfig};
use crate::engine::common::run_with_panic_policy;
use crate::engine::debounce::Debouncer;
use crate::engine::encoder::{ImageEncoder, NativeEncoder};
use crate::engine::io::SourceImage;
use crate::engine::pool;
use crate::engine::search::{savings_percent, ConversionResult};
use crate::engine::tasks::ConversionTask;
use crate::error::{ErrorCategory, LeanImageError};
use crate::history::{HistoryEntry, HistoryLog};
use crate::naming::{output_filename, today};
use crate::ops::{EncodeSettings, TransformSettings};
use crate::ProcessingMetrics;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

type BatchResult<T> = std::result::Result<T, LeanImageError>;

pub type FileId = u64;

/// The settings pair a batch snapshots when it starts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversionSettings {
    pub transform: TransformSettings,
    pub encode: EncodeSettings,
}

#[derive(Clone, Debug)]
pub enum FileStatus {
    Pending,
    Converting,
    Converted(Arc<ConversionResult>),
    Errored {
        message: String,
        category: ErrorCategory,
    },
}

impl FileStatus {
    pub fn result(&self) -> Option<&Arc<ConversionResult>> {
        match self {
            FileStatus::Converted(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, FileStatus::Converted(_) | FileStatus::Errored { .. })
    }
}

/// What one file produced in a batch.
#[derive(Clone, Debug)]
pub enum FileOutcome {
    Success(Arc<ConversionResult>),
    Failure {
        error_message: String,
        category: ErrorCategory,
    },
}

impl FileOutcome {
    fn from_error(err: &LeanImageError) -> Self {
        FileOutcome::Failure {
            error_message: err.to_string(),
            category: err.category(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FileOutcome::Success(_))
    }

    /// `LEAN_IMAGE_*` code of a failure; `None` on success.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            FileOutcome::Success(_) => None,
            FileOutcome::Failure { category, .. } => Some(category.code()),
        }
    }
}

impl From<&FileOutcome> for FileStatus {
    fn from(outcome: &FileOutcome) -> Self {
        match outcome {
            FileOutcome::Success(result) => FileStatus::Converted(Arc::clone(result)),
            FileOutcome::Failure {
                error_message,
                category,
            } => FileStatus::Errored {
                message: error_message.clone(),
                category: *category,
            },
        }
    }
}

/// Point-in-time copy of one file's entry.
#[derive(Clone, Debug)]
pub struct FileSnapshot {
    pub id: FileId,
    pub name: String,
    pub original_size: u64,
    pub status: FileStatus,
    pub metrics: Option<ProcessingMetrics>,
}

/// Aggregates over successful files only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_original_bytes: u64,
    pub total_converted_bytes: u64,
    pub savings_percent: f64,
    pub elapsed_ms: f64,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[FileOutcome]) -> Self {
        let mut summary = BatchSummary {
            total: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                FileOutcome::Success(result) => {
                    summary.succeeded += 1;
                    summary.total_original_bytes += result.original_size;
                    summary.total_converted_bytes += result.byte_size;
                }
                FileOutcome::Failure { .. } => summary.failed += 1,
            }
        }
        summary.savings_percent =
            savings_percent(summary.total_original_bytes, summary.total_converted_bytes);
        summary
    }
}

#[derive(Clone, Debug)]
pub enum BatchOutcome {
    Completed(BatchSummary),
    /// A batch was already running; nothing was done.
    AlreadyRunning,
    /// A batch was running; a full rerun will follow it.
    Queued,
}

impl BatchOutcome {
    pub fn summary(&self) -> Option<&BatchSummary> {
        match self {
            BatchOutcome::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BatchState {
    #[default]
    Idle,
    Running,
}

/// Batch event sink. Never called while the driver holds its file list lock,
/// so implementations may call back into the driver.
pub trait BatchObserver: Send + Sync {
    /// Progress is 0 at this point.
    fn on_batch_started(&self, _total: usize) {}
    fn on_file_status(&self, _id: FileId, _name: &str, _status: &FileStatus) {}
    /// `completed / total`, strictly increasing within a batch.
    fn on_progress(&self, _fraction: f64) {}
    fn on_batch_finished(&self, _summary: &BatchSummary) {}
}

struct FileRecord {
    id: FileId,
    source: Arc<SourceImage>,
    status: FileStatus,
    metrics: Option<ProcessingMetrics>,
}

#[derive(Default)]
struct Control {
    state: BatchState,
    rerun: bool,
}

/// Puts the driver back to Idle if a batch unwinds.
struct RunningGuard<'a> {
    control: &'a Mutex<Control>,
    armed: bool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut control = self.control.lock();
            control.state = BatchState::Idle;
            control.rerun = false;
        }
    }
}

struct ProgressCounter {
    total: usize,
    done: Mutex<usize>,
    observer: Option<Arc<dyn BatchObserver>>,
}

impl ProgressCounter {
    fn tick(&self) {
        let mut done = self.done.lock();
        *done += 1;
        if let Some(observer) = &self.observer {
            observer.on_progress(*done as f64 / self.total as f64);
        }
    }
}

pub struct BatchDriver {
    config: EngineConfig,
    encoder: Arc<dyn ImageEncoder>,
    files: Mutex<Vec<FileRecord>>,
    next_id: AtomicU64,
    settings: RwLock<ConversionSettings>,
    control: Mutex<Control>,
    observer: RwLock<Option<Arc<dyn BatchObserver>>>,
    history: Mutex<HistoryLog>,
    last_summary: Mutex<Option<BatchSummary>>,
    debouncer: Debouncer,
    this: Weak<BatchDriver>,
}

impl BatchDriver {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_encoder(config, Arc::new(NativeEncoder))
    }

    pub fn with_encoder(config: EngineConfig, encoder: Arc<dyn ImageEncoder>) -> Arc<Self> {
        let debouncer = Debouncer::new(config.reconvert_delay);
        let history = HistoryLog::new(config.history_capacity);
        Arc::new_cyclic(|this| BatchDriver {
            config,
            encoder,
            files: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            settings: RwLock::new(ConversionSettings::default()),
            control: Mutex::new(Control::default()),
            observer: RwLock::new(None),
            history: Mutex::new(history),
            last_summary: Mutex::new(None),
            debouncer,
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_observer(&self, observer: Option<Arc<dyn BatchObserver>>) {
        *self.observer.write() = observer;
    }

    fn observer(&self) -> Option<Arc<dyn BatchObserver>> {
        self.observer.read().clone()
    }

    // ---- files ----

    pub fn add_file(&self, source: SourceImage) -> FileId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.files.lock().push(FileRecord {
            id,
            source: Arc::new(source),
            status: FileStatus::Pending,
            metrics: None,
        });
        id
    }

    pub fn add_path(&self, path: impl AsRef<Path>) -> BatchResult<FileId> {
        Ok(self.add_file(SourceImage::from_path(path)?))
    }

    pub fn remove_file(&self, id: FileId) -> bool {
        let mut files = self.files.lock();
        let before = files.len();
        files.retain(|record| record.id != id);
        files.len() != before
    }

    pub fn clear_files(&self) {
        self.files.lock().clear();
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    pub fn files(&self) -> Vec<FileSnapshot> {
        self.files
            .lock()
            .iter()
            .map(|record| FileSnapshot {
                id: record.id,
                name: record.source.name().to_string(),
                original_size: record.source.byte_size(),
                status: record.status.clone(),
                metrics: record.metrics.clone(),
            })
            .collect()
    }

    pub fn status(&self, id: FileId) -> Option<FileStatus> {
        self.files
            .lock()
            .iter()
            .find(|record| record.id == id)
            .map(|record| record.status.clone())
    }

    /// Converted files with their output names, in list order. Errored and
    /// unconverted files are left out.
    pub fn converted_outputs(&self, template: &str, date: &str) -> Vec<(String, Arc<ConversionResult>)> {
        self.files
            .lock()
            .iter()
            .filter_map(|record| {
                let result = record.status.result()?;
                let name = output_filename(template, record.source.stem(), date, result.format);
                Some((name, Arc::clone(result)))
            })
            .collect()
    }

    /// Write every converted file into `dir`.
    pub fn persist_all(&self, dir: impl AsRef<Path>, template: &str) -> BatchResult<Vec<PathBuf>> {
        let dir = dir.as_ref();
        self.converted_outputs(template, &today())
            .into_iter()
            .map(|(name, result)| result.persist(dir, &name))
            .collect()
    }

    // ---- settings ----

    pub fn settings(&self) -> ConversionSettings {
        self.settings.read().clone()
    }

    /// Replace the settings and schedule a debounced reconversion.
    pub fn set_settings(&self, settings: ConversionSettings) {
        *self.settings.write() = settings;
        self.settings_changed();
    }

    pub fn update_settings<F>(&self, f: F)
    where
        F: FnOnce(&mut ConversionSettings),
    {
        f(&mut self.settings.write());
        self.settings_changed();
    }

    /// Restart the reconversion delay. Rapid changes collapse into one batch.
    pub fn settings_changed(&self) {
        let this = self.this.clone();
        self.debouncer.schedule(move || {
            if let Some(driver) = this.upgrade() {
                driver.request_reconversion();
            }
        });
    }

    pub fn cancel_pending_reconversion(&self) -> bool {
        self.debouncer.cancel()
    }

    pub fn reconversion_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    // ---- history / summary ----

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().entries().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    pub fn last_summary(&self) -> Option<BatchSummary> {
        self.last_summary.lock().clone()
    }

    pub fn state(&self) -> BatchState {
        self.control.lock().state
    }

    // ---- running ----

    /// Convert every file once. A no-op while a batch is running.
    pub fn run_batch(&self) -> BatchOutcome {
        {
            let mut control = self.control.lock();
            if control.state == BatchState::Running {
                tracing::debug!("batch already running, request ignored");
                return BatchOutcome::AlreadyRunning;
            }
            control.state = BatchState::Running;
        }
        BatchOutcome::Completed(self.drive())
    }

    /// Like `run_batch`, but a request made during a batch is remembered
    /// and run as soon as that batch finishes.
    pub fn request_reconversion(&self) -> BatchOutcome {
        {
            let mut control = self.control.lock();
            if control.state == BatchState::Running {
                control.rerun = true;
                tracing::debug!("batch running, reconversion queued");
                return BatchOutcome::Queued;
            }
            control.state = BatchState::Running;
        }
        BatchOutcome::Completed(self.drive())
    }

    // Caller has set the state to Running.
    fn drive(&self) -> BatchSummary {
        let mut guard = RunningGuard {
            control: &self.control,
            armed: true,
        };
        loop {
            let summary = self.process_once();
            let mut control = self.control.lock();
            if control.rerun {
                control.rerun = false;
                tracing::debug!("starting queued reconversion");
                continue;
            }
            control.state = BatchState::Idle;
            guard.armed = false;
            return summary;
        }
    }

    fn process_once(&self) -> BatchSummary {
        let started = Instant::now();
        let settings = self.settings.read().clone();
        let queue: Vec<(FileId, Arc<SourceImage>)> = self
            .files
            .lock()
            .iter()
            .map(|record| (record.id, Arc::clone(&record.source)))
            .collect();
        let total = queue.len();
        let observer = self.observer();

        tracing::info!(
            files = total,
            format = %settings.encode.output_format,
            quality = settings.encode.quality,
            concurrency = ?self.config.concurrency,
            "batch started"
        );
        if let Some(observer) = &observer {
            observer.on_batch_started(total);
        }

        let progress = ProgressCounter {
            total,
            done: Mutex::new(0),
            observer: observer.clone(),
        };
        let convert = |(id, source): &(FileId, Arc<SourceImage>)| {
            self.convert_one(*id, source, &settings, observer.as_ref(), &progress)
        };

        let parallel_pool = match self.config.concurrency {
            Concurrency::Parallel if total > 1 => pool::get_pool(),
            _ => None,
        };
        let outcomes: Vec<FileOutcome> = match parallel_pool {
            Some(pool) => pool.install(|| queue.par_iter().map(convert).collect()),
            None => queue.iter().map(convert).collect(),
        };

        let mut summary = BatchSummary::from_outcomes(&outcomes);
        summary.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            bytes_in = summary.total_original_bytes,
            bytes_out = summary.total_converted_bytes,
            savings = summary.savings_percent,
            elapsed_ms = summary.elapsed_ms,
            "batch finished"
        );

        *self.last_summary.lock() = Some(summary.clone());
        if let Some(observer) = &observer {
            observer.on_batch_finished(&summary);
        }
        summary
    }

    fn convert_one(
        &self,
        id: FileId,
        source: &SourceImage,
        settings: &ConversionSettings,
        observer: Option<&Arc<dyn BatchObserver>>,
        progress: &ProgressCounter,
    ) -> FileOutcome {
        // Drops any previous result before the new one exists.
        self.set_status(id, FileStatus::Converting, None, observer);

        let task = ConversionTask::new(source, &settings.transform, &settings.encode, &self.config);
        let mut metrics = ProcessingMetrics::default();
        let run = run_with_panic_policy("convert", || {
            task.run_with_metrics(self.encoder.as_ref(), Some(&mut metrics))
        });

        let (outcome, metrics) = match run {
            Ok(result) => {
                self.history
                    .lock()
                    .record(HistoryEntry::from_result(source.name(), &result));
                (FileOutcome::Success(Arc::new(result)), Some(metrics))
            }
            Err(err) => {
                tracing::warn!(
                    file = %source.name(),
                    category = err.category().as_str(),
                    code = err.category().code(),
                    error = %err,
                    "file conversion failed"
                );
                (FileOutcome::from_error(&err), None)
            }
        };

        self.set_status(id, FileStatus::from(&outcome), metrics, observer);
        progress.tick();
        outcome
    }

    fn set_status(
        &self,
        id: FileId,
        status: FileStatus,
        metrics: Option<ProcessingMetrics>,
        observer: Option<&Arc<dyn BatchObserver>>,
    ) {
        let name = {
            let mut files = self.files.lock();
            // Removed mid-batch: the outcome still counts, the entry is gone.
            let Some(record) = files.iter_mut().find(|record| record.id == id) else {
                return;
            };
            record.status = status.clone();
            record.metrics = metrics;
            record.source.name().to_string()
        };
        if let Some(observer) = observer {
            observer.on_file_status(id, &name, &status);
        }
    }
}
