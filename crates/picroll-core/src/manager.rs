//! Cache manager - single owner of the pending, ready and history queues
//!
//! Every queue mutation happens on one tokio task. Frontends talk to it
//! through a [`CacheHandle`] (commands in, snapshots out); fetchers and
//! downloaders report back over an unbounded worker channel and never touch
//! the queues themselves.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::downloader::{self, DownloadJob};
use crate::error::{Error, ErrorEvent, ErrorKind, Result};
use crate::export::{self, ExportSource, EXPORT_WORKERS};
use crate::fetcher::{self, FetchJob, FetchOutcome};
use crate::gallery::Gallery;
use crate::history::{Advance, History};
use crate::registry::{ProgressSnapshot, TaskRegistry};
use crate::types::{
    CancelCategory, CoreSnapshot, ItemDescriptor, QueueStats, ReadyItem, Settings, TaskId,
    TaskKind,
};

/// Messages from workers to the owner
pub(crate) enum WorkerEvent {
    Progress {
        id: TaskId,
        percent: f32,
    },
    /// A view download finished
    Downloaded {
        id: TaskId,
        item: ReadyItem,
    },
    /// An export was written to disk
    Exported {
        id: TaskId,
        path: PathBuf,
    },
    /// Cancelled, or the asset is gone upstream
    Stopped {
        id: TaskId,
        unavailable: bool,
    },
    Failed {
        id: TaskId,
        kind: TaskKind,
        error: Error,
    },
    /// One metadata batch; `ack` receives the pending length after enqueueing
    Batch {
        id: TaskId,
        items: Vec<ItemDescriptor>,
        ack: oneshot::Sender<usize>,
    },
    FetchDone {
        id: TaskId,
        outcome: FetchOutcome,
    },
}

pub(crate) type WorkerSender = mpsc::UnboundedSender<WorkerEvent>;

/// Commands sent from the frontend to the cache manager
#[derive(Debug, Clone)]
pub enum CacheCommand {
    /// Show the next item
    Advance,
    /// Show the previous item from history
    Back,
    /// Persist the shown item at save quality
    RequestExport,
    /// Cancel every task of a category
    Cancel(CancelCategory),
    /// Cancel one task; a no-op for finished or unknown ids
    CancelTask(TaskId),
    /// Replace the configuration snapshot
    ApplySettings(Settings),
    /// Cancel everything and stop the manager
    Shutdown,
}

/// Notifications pushed to the frontend
#[derive(Debug, Clone)]
pub enum CoreEvent {
    Error(ErrorEvent),
    Exported { task: TaskId, path: PathBuf },
}

/// Frontend side of the cache manager
#[derive(Debug, Clone)]
pub struct CacheHandle {
    commands: async_channel::Sender<CacheCommand>,
    snapshot: watch::Receiver<CoreSnapshot>,
}

impl CacheHandle {
    pub async fn send(&self, command: CacheCommand) -> Result<()> {
        self.commands.send(command).await?;
        Ok(())
    }

    pub async fn advance(&self) -> Result<()> {
        self.send(CacheCommand::Advance).await
    }

    pub async fn back(&self) -> Result<()> {
        self.send(CacheCommand::Back).await
    }

    pub async fn request_export(&self) -> Result<()> {
        self.send(CacheCommand::RequestExport).await
    }

    pub async fn cancel(&self, category: CancelCategory) -> Result<()> {
        self.send(CacheCommand::Cancel(category)).await
    }

    /// Cancel one task. Unknown, finished or already cancelled ids are ignored.
    pub async fn cancel_task(&self, id: TaskId) -> Result<()> {
        self.send(CacheCommand::CancelTask(id)).await
    }

    pub async fn apply_settings(&self, settings: Settings) -> Result<()> {
        self.send(CacheCommand::ApplySettings(settings)).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(CacheCommand::Shutdown).await
    }

    /// Latest published state
    pub fn snapshot(&self) -> CoreSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn current_item(&self) -> Option<ReadyItem> {
        self.snapshot.borrow().current.clone()
    }

    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        self.snapshot.borrow().progress.clone()
    }

    pub fn last_error(&self) -> Option<ErrorEvent> {
        self.snapshot.borrow().last_error.clone()
    }

    /// A receiver that is notified on every state change
    pub fn watch(&self) -> watch::Receiver<CoreSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Builds the cache manager and starts it on the current tokio runtime
pub struct CacheService {
    gallery: Arc<dyn Gallery>,
    settings: Settings,
}

impl CacheService {
    pub fn new(gallery: Arc<dyn Gallery>, settings: Settings) -> Self {
        Self {
            gallery,
            settings: settings.validated(),
        }
    }

    /// Spawn the manager task. Must be called from within a tokio runtime.
    pub fn spawn(self) -> (CacheHandle, async_channel::Receiver<CoreEvent>) {
        let (cmd_sender, cmd_receiver) = async_channel::bounded::<CacheCommand>(100);
        let (ui_sender, ui_receiver) = async_channel::bounded::<CoreEvent>(100);
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CoreSnapshot::default());

        let manager = CacheManager {
            gallery: self.gallery,
            history: History::new(self.settings.keep_num),
            settings: Arc::new(self.settings),
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            registry: TaskRegistry::new(),
            tokens: HashMap::new(),
            fetch: None,
            next_id: 0,
            last_error: None,
            export_slots: Arc::new(Semaphore::new(EXPORT_WORKERS)),
            worker_tx,
            ui_sender,
            snapshot_tx,
        };

        tokio::spawn(manager.run(cmd_receiver, worker_rx));

        let handle = CacheHandle {
            commands: cmd_sender,
            snapshot: snapshot_rx,
        };
        (handle, ui_receiver)
    }
}

struct CacheManager {
    gallery: Arc<dyn Gallery>,
    settings: Arc<Settings>,
    pending: VecDeque<Arc<ItemDescriptor>>,
    ready: VecDeque<ReadyItem>,
    history: History,
    registry: TaskRegistry,
    tokens: HashMap<TaskId, (TaskKind, CancellationToken)>,
    /// The active metadata fetcher, if any
    fetch: Option<(TaskId, CancellationToken)>,
    next_id: u64,
    last_error: Option<ErrorEvent>,
    export_slots: Arc<Semaphore>,
    worker_tx: WorkerSender,
    ui_sender: async_channel::Sender<CoreEvent>,
    snapshot_tx: watch::Sender<CoreSnapshot>,
}

impl CacheManager {
    async fn run(
        mut self,
        cmd_receiver: async_channel::Receiver<CacheCommand>,
        mut worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        log::info!(
            "Cache manager started (cache_num {}, keep_num {})",
            self.settings.cache_num,
            self.settings.keep_num
        );
        self.maybe_start_fetch();
        self.publish();

        loop {
            tokio::select! {
                cmd_result = cmd_receiver.recv() => {
                    match cmd_result {
                        Ok(CacheCommand::Shutdown) => {
                            log::info!("Cache manager shutting down");
                            self.shutdown();
                            break;
                        }
                        Ok(cmd) => self.handle_command(cmd),
                        Err(_) => {
                            log::warn!("Command channel closed");
                            self.shutdown();
                            break;
                        }
                    }
                }

                Some(event) = worker_rx.recv() => {
                    self.handle_worker_event(event);
                }
            }
            self.publish();
        }

        self.publish();
    }

    fn handle_command(&mut self, cmd: CacheCommand) {
        match cmd {
            CacheCommand::Advance => {
                if self.history.advance(&mut self.ready) == Advance::Exhausted {
                    log::debug!("Nothing ready yet, waiting for replenishment");
                }
                self.replenish();
                self.maybe_start_fetch();
            }

            CacheCommand::Back => {
                if let Err(e) = self.history.back() {
                    self.raise(ErrorKind::NoPreviousItem, None, e.to_string());
                }
            }

            CacheCommand::RequestExport => self.request_export(),

            CacheCommand::Cancel(category) => self.cancel(category),

            CacheCommand::CancelTask(id) => {
                if let Some((_, token)) = self.tokens.get(&id) {
                    token.cancel();
                }
            }

            CacheCommand::ApplySettings(settings) => self.apply_settings(settings),

            CacheCommand::Shutdown => {
                // Handled in the main loop
            }
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Progress { id, percent } => {
                self.registry.update(id, percent);
            }

            WorkerEvent::Downloaded { id, item } => {
                let Some(token) = self.finish_task(id) else {
                    return;
                };
                if token.is_cancelled() {
                    log::debug!("{} finished after cancellation, discarding", id);
                } else {
                    log::debug!("{} ready: {}", id, item.descriptor.pid);
                    self.ready.push_back(item);
                    self.history.fill_if_empty(&mut self.ready);
                }
                self.replenish();
            }

            WorkerEvent::Exported { id, path } => {
                if self.finish_task(id).is_some() {
                    self.notify(CoreEvent::Exported { task: id, path });
                }
            }

            WorkerEvent::Stopped { id, unavailable } => {
                let kind = self.tokens.get(&id).map(|(kind, _)| *kind);
                if self.finish_task(id).is_none() {
                    return;
                }
                log::debug!("{} stopped", id);
                if unavailable {
                    self.raise(ErrorKind::ContentUnavailable, Some(id), "");
                }
                if kind == Some(TaskKind::View) {
                    self.replenish();
                }
            }

            WorkerEvent::Failed { id, kind, error } => {
                let Some(token) = self.finish_task(id) else {
                    return;
                };
                if !token.is_cancelled() {
                    self.raise(ErrorKind::ContentFetchFailed(kind), Some(id), error.to_string());
                }
                if kind == TaskKind::View {
                    self.replenish();
                }
            }

            WorkerEvent::Batch { id, items, ack } => {
                if self.fetch.as_ref().map(|(current, _)| *current) != Some(id) {
                    log::debug!("Dropping {} descriptors from stale fetch {}", items.len(), id);
                    let _ = ack.send(usize::MAX);
                    return;
                }
                self.pending.extend(items.into_iter().map(Arc::new));
                self.replenish();
                let _ = ack.send(self.pending.len());
            }

            WorkerEvent::FetchDone { id, outcome } => {
                if self.fetch.as_ref().map(|(current, _)| *current) != Some(id) {
                    return;
                }
                self.fetch = None;
                match outcome {
                    FetchOutcome::Filled | FetchOutcome::Cancelled => {}
                    FetchOutcome::NoMatchingItems => {
                        self.raise(ErrorKind::NoMatchingItems, Some(id), "");
                    }
                    FetchOutcome::Failed(e) => {
                        self.raise(ErrorKind::MetadataFetchFailed, Some(id), e.to_string());
                    }
                }
                self.replenish();
            }
        }
    }

    fn allocate_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    /// Forget a task. Returns its token, or None if it was already gone.
    fn finish_task(&mut self, id: TaskId) -> Option<CancellationToken> {
        self.registry.remove(id);
        self.tokens.remove(&id).map(|(_, token)| token)
    }

    fn in_flight_view(&self) -> usize {
        self.registry.count(TaskKind::View)
    }

    /// Start view downloads while capacity allows and descriptors are pending.
    fn replenish(&mut self) {
        while self.ready.len() + self.in_flight_view() < self.settings.cache_num {
            let Some(descriptor) = self.pending.pop_front() else {
                break;
            };
            self.start_view_download(descriptor);
        }
    }

    fn start_view_download(&mut self, descriptor: Arc<ItemDescriptor>) {
        let id = self.allocate_id();
        let token = CancellationToken::new();
        self.registry.register(id, TaskKind::View);
        self.tokens.insert(id, (TaskKind::View, token.clone()));

        log::debug!("{} downloading {} at {}", id, descriptor.pid, self.settings.view_quality);
        let job = DownloadJob {
            id,
            kind: TaskKind::View,
            descriptor,
            tier: self.settings.view_quality,
            token,
        };
        tokio::spawn(downloader::run_view(
            self.gallery.clone(),
            job,
            self.worker_tx.clone(),
        ));
    }

    fn maybe_start_fetch(&mut self) {
        if self.fetch.is_some() || self.pending.len() > self.settings.cache_num {
            return;
        }

        let id = self.allocate_id();
        let token = CancellationToken::new();
        self.fetch = Some((id, token.clone()));

        let job = FetchJob {
            id,
            settings: self.settings.clone(),
            pending: self.pending.len(),
            token,
        };
        tokio::spawn(fetcher::run(self.gallery.clone(), job, self.worker_tx.clone()));
    }

    fn request_export(&mut self) {
        let Some(item) = self.history.current().cloned() else {
            self.raise(ErrorKind::NothingToExport, None, "");
            return;
        };

        let id = self.allocate_id();
        let token = CancellationToken::new();
        self.registry.register(id, TaskKind::Export);
        self.tokens.insert(id, (TaskKind::Export, token.clone()));

        // Bytes in memory are reusable only if they were fetched at save tier
        let source = if item.tier != self.settings.save_quality {
            log::info!(
                "{} exporting {} at {}",
                id,
                item.descriptor.pid,
                self.settings.save_quality
            );
            ExportSource::Remote(DownloadJob {
                id,
                kind: TaskKind::Export,
                descriptor: item.descriptor,
                tier: self.settings.save_quality,
                token,
            })
        } else {
            log::info!("{} exporting {} from memory", id, item.descriptor.pid);
            ExportSource::Local { id, item, token }
        };

        tokio::spawn(export::run(
            self.gallery.clone(),
            source,
            self.settings.save_dir.clone(),
            self.export_slots.clone(),
            self.worker_tx.clone(),
        ));
    }

    /// Mark matching tasks cancelled. Their entries stay registered until
    /// each worker reports back.
    fn cancel(&mut self, category: CancelCategory) {
        let mut cancelled = 0;
        for (kind, token) in self.tokens.values() {
            if category.matches(*kind) && !token.is_cancelled() {
                token.cancel();
                cancelled += 1;
            }
        }
        if category == CancelCategory::All {
            if let Some((_, token)) = &self.fetch {
                token.cancel();
            }
        }
        log::info!("Cancelled {} task(s) ({:?})", cancelled, category);
    }

    fn apply_settings(&mut self, settings: Settings) {
        let settings = settings.validated();
        let requery = self.settings.changes_query(&settings);
        log::info!(
            "Applying settings (cache_num {}, keep_num {}, requery {})",
            settings.cache_num,
            settings.keep_num,
            requery
        );

        self.settings = Arc::new(settings);
        self.history.set_keep_num(self.settings.keep_num);

        if requery {
            self.cancel(CancelCategory::View);
            if let Some((_, token)) = self.fetch.take() {
                token.cancel();
            }
            self.ready.clear();
            self.pending.clear();
        }

        self.shrink_to_capacity();
        self.history.fill_if_empty(&mut self.ready);
        self.replenish();
        self.maybe_start_fetch();
    }

    /// After `cache_num` shrank: drop the newest ready items, then cancel the
    /// newest view downloads that no longer fit.
    fn shrink_to_capacity(&mut self) {
        let cache_num = self.settings.cache_num;
        self.ready.truncate(cache_num);

        let mut live: Vec<(TaskId, &CancellationToken)> = self
            .tokens
            .iter()
            .filter(|(_, (kind, token))| *kind == TaskKind::View && !token.is_cancelled())
            .map(|(id, (_, token))| (*id, token))
            .collect();
        let room = cache_num.saturating_sub(self.ready.len());
        if live.len() > room {
            live.sort_by_key(|(id, _)| *id);
            for (id, token) in &live[room..] {
                log::debug!("{} no longer fits the cache, cancelling", id);
                token.cancel();
            }
        }
    }

    fn shutdown(&mut self) {
        self.cancel(CancelCategory::All);
        self.fetch = None;
    }

    fn raise(&mut self, kind: ErrorKind, task: Option<TaskId>, detail: impl Into<String>) {
        let event = ErrorEvent::new(kind, task, detail);
        if kind.is_informational() {
            log::info!("{}", event);
        } else {
            log::warn!("{}", event);
        }
        self.last_error = Some(event.clone());
        self.notify(CoreEvent::Error(event));
    }

    fn notify(&self, event: CoreEvent) {
        if let Err(e) = self.ui_sender.try_send(event) {
            log::debug!("Dropping core event: {}", e);
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.settings.cache_num,
            pending: self.pending.len(),
            ready: self.ready.len(),
            in_flight_view: self.registry.count(TaskKind::View),
            in_flight_export: self.registry.count(TaskKind::Export),
            history_len: self.history.len(),
            history_index: self.history.index(),
            fetching: self.fetch.is_some(),
        }
    }

    fn publish(&self) {
        debug_assert!(
            self.ready.len() <= self.settings.cache_num,
            "ready queue exceeds cache_num"
        );
        self.snapshot_tx.send_replace(CoreSnapshot {
            current: self.history.current().cloned(),
            progress: self.registry.snapshot(),
            last_error: self.last_error.clone(),
            stats: self.stats(),
        });
    }
}
