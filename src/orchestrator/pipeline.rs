//! # Pipeline Module
//!
//! Facciata della pipeline: possiede stato, registry degli handle, intake ed
//! export, e coordina i run dell'orchestratore.
//!
//! ## Responsabilità:
//! - Intake e rimozione degli item con emissione degli eventi
//! - Run del batch: al più `max_concurrency` trasformazioni in volo
//! - Un solo collector applica risultati e progresso allo stato (nessuna scrittura concorrente)
//! - Cancellazione cooperativa: gli item non partiti diventano `Cancelled`
//! - Reset con cambio di epoch: i risultati tardivi di un run precedente vengono scartati
//! - Export degli output riusciti e teardown di tutti gli handle
//!
//! ## Flusso di un run:
//! ```text
//! dispatcher ──(permesso semaforo)──► worker ──► WorkerEvent ──► collector ──► stato + eventi
//!      ▲                                                             │
//!      └──────────────── CancellationToken (cancel / deadline) ──────┘
//! ```
//!
//! ## Esempio:
//! ```rust,ignore
//! let pipeline = Pipeline::new(Config::default())?;
//! pipeline.add_files(candidates)?;
//! let summary = pipeline.run(Arc::new(ImageReencoder::new()), RunOptions::default()).await?;
//! let payload = pipeline.export().await?;
//! pipeline.shutdown();
//! ```

use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{savings_percent, BatchSummary, ItemStats, ResultAggregator};
use crate::config::Config;
use crate::error::{PipelineError, TransformError};
use crate::events::{EventBus, PipelineEvent};
use crate::exporter::{ArchiveExporter, DownloadSink, ExportEntry, ExportPayload};
use crate::intake::{Candidate, IntakeManager, IntakeReport};
use crate::lifecycle::{Handle, HandleKind, ReleaseOutcome, ResourceRegistry};
use crate::orchestrator::worker::{self, TransformJob, WorkerEvent};
use crate::state::{ItemId, Phase, PipelineState, TransformStatus};
use crate::transform::{TransformEngine, TransformOptions};

/// Per-run overrides of the configuration
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Transforms in flight at once (None = config)
    pub max_concurrency: Option<usize>,
    /// Options for items without an override (None = config)
    pub default_options: Option<TransformOptions>,
    pub per_item_options: HashMap<ItemId, TransformOptions>,
    /// Cancel the run after this long (None = config)
    pub deadline: Option<Duration>,
}

impl RunOptions {
    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_item_options(mut self, id: ItemId, options: TransformOptions) -> Self {
        self.per_item_options.insert(id, options);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl From<&Config> for RunOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrency: Some(config.max_concurrency),
            default_options: Some(config.transform_options()),
            per_item_options: HashMap::new(),
            deadline: config.deadline(),
        }
    }
}

/// Batch transformation pipeline; clones share the same state
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    state: Arc<Mutex<PipelineState>>,
    registry: ResourceRegistry,
    intake: IntakeManager,
    exporter: ArchiveExporter,
    events: EventBus,
    /// Token of the run in progress, tagged with its epoch
    active_run: Arc<Mutex<Option<(u64, CancellationToken)>>>,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        Self::with_registry(config, ResourceRegistry::new())
    }

    /// Pipeline whose handles live in `registry` (e.g. one with a release hook)
    pub fn with_registry(config: Config, registry: ResourceRegistry) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Validation(e.to_string()))?;

        let intake = IntakeManager::new(config.accepted_class, config.max_batch_items, config.max_batch_bytes);
        let exporter = ArchiveExporter::new(config.output_prefix.clone(), config.tool_name.clone());

        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(PipelineState::new())),
            registry,
            intake,
            exporter,
            events: EventBus::default(),
            active_run: Arc::new(Mutex::new(None)),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.active_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Validate and queue candidates
    pub fn add_files(&self, candidates: Vec<Candidate>) -> Result<IntakeReport, PipelineError> {
        let report = {
            let mut state = self.lock_state();
            self.intake.add_files(&mut state, &self.registry, candidates)?
        };

        self.events.publish_all(report.added.iter().map(|item| PipelineEvent::ItemAdded {
            id: item.id.clone(),
            name: item.name.clone(),
            size_bytes: item.size_bytes,
            preview: item.preview_handle,
        }));
        self.events.publish_all(
            report
                .reported()
                .cloned()
                .map(|reason| PipelineEvent::ItemRejected { reason }),
        );

        Ok(report)
    }

    /// Remove one item; unknown ids are a no-op
    pub fn remove_item(&self, id: &ItemId) -> bool {
        let removed = {
            let mut state = self.lock_state();
            self.intake.remove_item(&mut state, &self.registry, id)
        };

        match removed {
            Some(item) => {
                info!("Removed {}", item.name);
                self.events.publish(PipelineEvent::ItemRemoved { id: item.id });
                true
            }
            None => false,
        }
    }

    /// Bytes behind a preview handle, for display
    pub fn preview(&self, handle: Handle) -> Result<Bytes, PipelineError> {
        self.registry.resolve(handle)
    }

    /// The consumer finished loading a preview
    pub fn acknowledge_preview(&self, handle: Handle) -> ReleaseOutcome {
        self.registry.acknowledge(handle)
    }

    /// Output bytes of a succeeded item
    pub fn output_of(&self, id: &ItemId) -> Option<Bytes> {
        let handle = self.lock_state().result(id)?.output_handle?;
        self.registry.resolve(handle).ok()
    }

    /// Cancel the run in progress; `false` if none
    pub fn cancel(&self) -> bool {
        match self.lock_active().as_ref() {
            Some((_, token)) => {
                if !token.is_cancelled() {
                    info!("Cancelling the current run");
                }
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel any run, drop every item and release every handle
    pub fn reset(&self) -> usize {
        self.cancel();
        let removed = {
            let mut state = self.lock_state();
            self.intake.reset(&mut state, &self.registry)
        };
        info!("Pipeline reset ({} items removed)", removed);
        self.events.publish(PipelineEvent::Reset);
        removed
    }

    /// Teardown: nothing stays allocated after this returns
    pub fn shutdown(&self) {
        self.reset();
        let leftover = self.registry.release_all();
        if leftover > 0 {
            warn!("{} handles were still live at shutdown", leftover);
        }
        debug!("Pipeline shut down, {} handles released in total", self.registry.released_count());
    }

    /// Read-only copy of the current state
    pub fn snapshot(&self) -> PipelineState {
        self.lock_state().clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock_state().phase
    }

    pub fn summary(&self) -> BatchSummary {
        ResultAggregator::summarize(&self.lock_state())
    }

    /// Transform every pending item with `engine`
    pub async fn run(
        &self,
        engine: Arc<dyn TransformEngine>,
        options: RunOptions,
    ) -> Result<BatchSummary, PipelineError> {
        let max_concurrency = options
            .max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);

        let (epoch, queue) = {
            let mut state = self.lock_state();
            if state.phase != Phase::Selecting {
                return Err(PipelineError::InvalidPhase {
                    operation: "run",
                    phase: state.phase,
                });
            }
            let queue = state.pending_ids();
            if queue.is_empty() {
                return Err(PipelineError::Validation("no pending items to transform".to_string()));
            }
            state.transition(Phase::Transforming)?;
            (state.epoch, queue)
        };

        let token = CancellationToken::new();
        *self.lock_active() = Some((epoch, token.clone()));

        info!(
            "Transforming {} items with '{}' ({} at a time)",
            queue.len(),
            engine.name(),
            max_concurrency
        );

        let watchdog = options
            .deadline
            .or_else(|| self.config.deadline())
            .map(|limit| spawn_deadline(limit, token.clone()));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::join!(
            self.dispatch(queue, engine, &options, epoch, &token, tx, max_concurrency),
            self.collect(rx, epoch, &token),
        );

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        {
            let mut active = self.lock_active();
            if active.as_ref().is_some_and(|(run_epoch, _)| *run_epoch == epoch) {
                *active = None;
            }
        }

        self.finish_run(epoch)
    }

    /// Start workers in submission order, never more than the semaphore allows
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        queue: Vec<ItemId>,
        engine: Arc<dyn TransformEngine>,
        options: &RunOptions,
        epoch: u64,
        token: &CancellationToken,
        tx: UnboundedSender<WorkerEvent>,
        max_concurrency: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let default_options = options
            .default_options
            .clone()
            .unwrap_or_else(|| self.config.transform_options());

        for id in &queue {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = {
                let mut state = self.lock_state();
                if state.epoch != epoch {
                    break;
                }
                let Some(raw_handle) = state.item(id).map(|item| item.raw_handle) else {
                    debug!("{} was removed before it started", id);
                    continue;
                };
                if state.result(id).map(|r| r.status) != Some(TransformStatus::Pending) {
                    continue;
                }

                match self.registry.resolve(raw_handle) {
                    Ok(input) => {
                        if let Some(result) = state.result_mut(id) {
                            result.status = TransformStatus::Running;
                        }
                        TransformJob {
                            item_id: id.clone(),
                            epoch,
                            input,
                            options: options
                                .per_item_options
                                .get(id)
                                .cloned()
                                .unwrap_or_else(|| default_options.clone()),
                        }
                    }
                    Err(e) => {
                        error!("Input of {} is no longer available: {}", id, e);
                        let error = TransformError::Other(e.to_string());
                        if let Some(result) = state.result_mut(id) {
                            result.error = Some(error.clone());
                            result.settle(TransformStatus::Failed);
                        }
                        state.recompute_progress();
                        drop(state);
                        self.events.publish(PipelineEvent::ItemFailed { id: id.clone(), error });
                        continue;
                    }
                }
            };

            debug!("Starting transform of {}", id);
            self.events.publish(PipelineEvent::TransformStarted { id: id.clone() });
            worker::spawn_transform(
                engine.clone(),
                job,
                permit,
                tx.clone(),
                self.config.progress_updates_per_sec,
            );
        }
        drop(tx);

        // quello che non è partito viene cancellato
        let (cancelled, aggregate) = {
            let mut state = self.lock_state();
            if state.epoch != epoch {
                return;
            }
            let mut cancelled = Vec::new();
            for id in &queue {
                if let Some(result) = state.result_mut(id) {
                    if result.status == TransformStatus::Pending {
                        result.settle(TransformStatus::Cancelled);
                        cancelled.push(id.clone());
                    }
                }
            }
            (cancelled, state.recompute_progress())
        };

        if !cancelled.is_empty() {
            info!("{} items cancelled before starting", cancelled.len());
        }
        for id in cancelled {
            self.events.publish(PipelineEvent::ItemCancelled { id: id.clone() });
            self.events.publish(PipelineEvent::ItemProgress {
                id,
                percent: 100.0,
                aggregate,
            });
        }
    }

    /// Single writer for worker outcomes; ends when every sender is gone
    async fn collect(&self, mut rx: UnboundedReceiver<WorkerEvent>, epoch: u64, token: &CancellationToken) {
        while let Some(event) = rx.recv().await {
            let events = self.apply(event, epoch, token);
            self.events.publish_all(events);
        }
    }

    fn apply(&self, event: WorkerEvent, epoch: u64, token: &CancellationToken) -> Vec<PipelineEvent> {
        let mut state = self.lock_state();

        match event {
            WorkerEvent::Progress {
                item_id,
                epoch: event_epoch,
                percent,
            } => {
                if event_epoch != epoch || state.epoch != epoch || token.is_cancelled() {
                    return Vec::new();
                }
                let advanced = match state.result_mut(&item_id) {
                    Some(result) if result.status == TransformStatus::Running => result.advance(percent),
                    _ => false,
                };
                if !advanced {
                    return Vec::new();
                }
                let percent = state.result(&item_id).map_or(percent, |r| r.progress_percent);
                let aggregate = state.recompute_progress();
                vec![PipelineEvent::ItemProgress {
                    id: item_id,
                    percent,
                    aggregate,
                }]
            }

            WorkerEvent::Finished {
                item_id,
                epoch: event_epoch,
                result,
                elapsed,
            } => {
                if event_epoch != epoch || state.epoch != epoch {
                    debug!("Discarding result of {} from a previous run", item_id);
                    return Vec::new();
                }
                let Some(item) = state.item(&item_id) else {
                    debug!("{} was removed while in flight, discarding its output", item_id);
                    return Vec::new();
                };
                let (name, original_size) = (item.name.clone(), item.size_bytes);
                if state.result(&item_id).map(|r| r.status) != Some(TransformStatus::Running) {
                    return Vec::new();
                }

                let event = if token.is_cancelled() {
                    debug!("Run cancelled, {} settles as cancelled", item_id);
                    let Some(slot) = state.result_mut(&item_id) else {
                        return Vec::new();
                    };
                    slot.settle(TransformStatus::Cancelled);
                    PipelineEvent::ItemCancelled { id: item_id.clone() }
                } else {
                    match result {
                        Ok(output) => {
                            let output_size = output.bytes.len() as u64;
                            let mut metrics = output.metrics;
                            metrics.elapsed_ms = elapsed.as_millis() as u64;
                            let guard = self.registry.guard(HandleKind::Output, output.bytes);

                            let Some(slot) = state.result_mut(&item_id) else {
                                return Vec::new();
                            };
                            slot.output_handle = guard.into_handle();
                            slot.output_size_bytes = Some(output_size);
                            slot.metrics = Some(metrics);
                            slot.settle(TransformStatus::Succeeded);

                            let stats = ItemStats {
                                id: item_id.clone(),
                                name,
                                original_size,
                                output_size,
                                savings_percent: savings_percent(original_size, output_size),
                                elapsed_ms: elapsed.as_millis() as u64,
                            };
                            info!(
                                "{}: {} -> {} bytes ({:.1}% saved)",
                                stats.name, original_size, output_size, stats.savings_percent
                            );
                            PipelineEvent::ItemSucceeded {
                                id: item_id.clone(),
                                metrics: stats,
                            }
                        }
                        Err(error) => {
                            warn!("{} failed: {}", name, error);
                            let Some(slot) = state.result_mut(&item_id) else {
                                return Vec::new();
                            };
                            slot.error = Some(error.clone());
                            slot.settle(TransformStatus::Failed);
                            PipelineEvent::ItemFailed {
                                id: item_id.clone(),
                                error,
                            }
                        }
                    }
                };

                let aggregate = state.recompute_progress();
                vec![
                    event,
                    PipelineEvent::ItemProgress {
                        id: item_id,
                        percent: 100.0,
                        aggregate,
                    },
                ]
            }
        }
    }

    fn finish_run(&self, epoch: u64) -> Result<BatchSummary, PipelineError> {
        let (summary, orphaned) = {
            let mut state = self.lock_state();
            if state.epoch != epoch {
                warn!("Run interrupted by a reset");
                return Err(PipelineError::RunInterrupted);
            }

            let mut orphaned = Vec::new();
            for result in state.results.values_mut() {
                match result.status {
                    TransformStatus::Running => {
                        let error = TransformError::Other("worker exited without reporting a result".to_string());
                        result.error = Some(error.clone());
                        result.settle(TransformStatus::Failed);
                        orphaned.push((result.item_id.clone(), error));
                    }
                    TransformStatus::Pending => result.settle(TransformStatus::Cancelled),
                    _ => {}
                }
            }

            state.recompute_progress();
            state.transition(Phase::Completed)?;
            (ResultAggregator::summarize(&state), orphaned)
        };

        for (id, error) in orphaned {
            error!("{} never reported a result", id);
            self.events.publish(PipelineEvent::ItemFailed { id, error });
        }

        info!("{}", summary.format_summary());
        self.events.publish(PipelineEvent::BatchCompleted {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Succeeded outputs, in submission order
    fn export_entries(&self) -> Result<Vec<ExportEntry>, PipelineError> {
        let state = self.lock_state();
        let mut entries = Vec::new();

        for item in &state.items {
            let Some(result) = state.result(&item.id) else {
                continue;
            };
            if result.status != TransformStatus::Succeeded {
                continue;
            }
            let Some(handle) = result.output_handle else {
                continue;
            };
            entries.push(ExportEntry {
                original_name: item.name.clone(),
                bytes: self.registry.resolve(handle)?,
            });
        }

        Ok(entries)
    }

    /// Package every succeeded output; the state is untouched either way
    pub async fn export(&self) -> Result<ExportPayload, PipelineError> {
        let entries = self.export_entries()?;
        let exporter = self.exporter.clone();

        tokio::task::spawn_blocking(move || exporter.export(&entries))
            .await
            .map_err(|e| PipelineError::ArchiveBuildFailure(e.to_string()))?
    }

    /// Export and hand the payload to `sink`
    pub async fn export_to(&self, sink: &dyn DownloadSink) -> Result<PathBuf, PipelineError> {
        let payload = self.export().await?;
        sink.save(payload.filename(), payload.bytes())
    }
}

fn spawn_deadline(limit: Duration, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(limit) => {
                warn!("Run exceeded its {:?} deadline, cancelling", limit);
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}
