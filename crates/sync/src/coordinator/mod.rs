//! The sync coordinator: one task that owns every write to the mirror.
//!
//! ```text
//!  uninitialized ──► bootstrapping ──► steady ◄──┐
//!        │                 ▲             │       │ retry
//!        └───────► degraded ◄────────────┘───────┘
//! ```
//!
//! Provider events, rebuild requests and retry timers are all funnelled into
//! the coordinator loop, so batches and full syncs never overlap.  Readers go
//! through [`SyncHandle`], which only touches read transactions and the
//! status channels.

mod status;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, error, info, warn};

use markmirror_config::SyncConfig;
use markmirror_store::{BookmarkNode, CursorStatus, MirrorStore, NodeSource, StoreError};

use crate::bootstrap::{BootstrapOptions, run_full_sync};
use crate::error::{Result, SyncError};
use crate::normalizer::Normalizer;
use crate::provider::{BookmarkProvider, RawEvent};
use crate::reconciler::apply_batch;

pub use status::{CoordinatorStatus, StatusMessage, SyncPhase, SyncState};

/// Status broadcast capacity.  Slow subscribers lose the oldest messages.
const STATUS_CAP: usize = 256;

enum Command {
    ForceFullSync,
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable front door to a running coordinator.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    generation: Arc<AtomicU64>,
    status_tx: broadcast::Sender<StatusMessage>,
    snapshot_rx: watch::Receiver<CoordinatorStatus>,
    store_rx: watch::Receiver<Option<Arc<MirrorStore>>>,
}

impl SyncHandle {
    /// Request a full rebuild.  A full sync already in flight is abandoned
    /// at its next batch boundary; concurrent requests collapse into one run.
    pub fn force_full_sync(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.commands
            .send(Command::ForceFullSync)
            .map_err(|_| SyncError::CoordinatorStopped)
    }

    /// Apply every provider event delivered so far, then return.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(tx))
            .map_err(|_| SyncError::CoordinatorStopped)?;
        rx.await.map_err(|_| SyncError::CoordinatorStopped)
    }

    pub fn shutdown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<CoordinatorStatus> {
        self.snapshot_rx.clone()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusMessage> {
        self.status_tx.subscribe()
    }

    /// Wait until the coordinator status satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&CoordinatorStatus) -> bool,
    ) -> Result<CoordinatorStatus> {
        let mut rx = self.snapshot_rx.clone();
        let status = rx
            .wait_for(predicate)
            .await
            .map_err(|_| SyncError::CoordinatorStopped)?;
        Ok(status.clone())
    }

    /// The open mirror, if the coordinator managed to open it.
    pub fn store(&self) -> Result<Arc<MirrorStore>> {
        self.store_rx
            .borrow()
            .clone()
            .ok_or_else(|| StoreError::Unavailable("mirror is not open".into()).into())
    }

    pub fn get_node(&self, id: &str) -> Result<Option<BookmarkNode>> {
        Ok(self.store()?.get_node(id)?)
    }

    pub fn get_children(&self, parent_id: Option<&str>) -> Result<Vec<BookmarkNode>> {
        Ok(self.store()?.get_children(parent_id)?)
    }

    pub fn search(&self, term: &str, limit: usize) -> Result<Vec<BookmarkNode>> {
        Ok(self.store()?.search(term, limit)?)
    }
}

pub struct SyncCoordinator {
    store_path: PathBuf,
    store: Option<Arc<MirrorStore>>,
    provider: Arc<dyn BookmarkProvider>,
    config: SyncConfig,
    normalizer: Normalizer,
    events: Option<mpsc::UnboundedReceiver<RawEvent>>,
    commands: mpsc::UnboundedReceiver<Command>,
    backlog: VecDeque<Command>,
    generation: Arc<AtomicU64>,
    status_tx: broadcast::Sender<StatusMessage>,
    snapshot_tx: watch::Sender<CoordinatorStatus>,
    store_tx: watch::Sender<Option<Arc<MirrorStore>>>,
    state: SyncState,
    needs_full_sync: bool,
    retry_at: Option<Instant>,
    retry_attempt: u32,
    /// Set after a store error no retry can fix (schema too new, failed
    /// migration).
    fatal: bool,
}

impl SyncCoordinator {
    pub fn new(
        store_path: impl Into<PathBuf>,
        provider: Arc<dyn BookmarkProvider>,
        config: SyncConfig,
    ) -> (Self, SyncHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(STATUS_CAP);
        let (snapshot_tx, snapshot_rx) = watch::channel(CoordinatorStatus::default());
        let (store_tx, store_rx) = watch::channel(None);
        let generation = Arc::new(AtomicU64::new(0));

        let handle = SyncHandle {
            commands: command_tx,
            generation: generation.clone(),
            status_tx: status_tx.clone(),
            snapshot_rx,
            store_rx,
        };
        let coordinator = Self {
            store_path: store_path.into(),
            store: None,
            provider,
            normalizer: Normalizer::new(config.coalesce_window()),
            config,
            events: None,
            commands: command_rx,
            backlog: VecDeque::new(),
            generation,
            status_tx,
            snapshot_tx,
            store_tx,
            state: SyncState::Uninitialized,
            needs_full_sync: false,
            retry_at: None,
            retry_attempt: 0,
            fatal: false,
        };
        (coordinator, handle)
    }

    /// Build a coordinator and run it on the current tokio runtime.
    pub fn spawn(
        store_path: impl Into<PathBuf>,
        provider: Arc<dyn BookmarkProvider>,
        config: SyncConfig,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (coordinator, handle) = Self::new(store_path, provider, config);
        (handle, tokio::spawn(coordinator.run()))
    }

    pub async fn run(mut self) {
        self.cold_start().await;
        loop {
            if let Some(command) = self.backlog.pop_front() {
                if !self.handle(command).await {
                    break;
                }
                continue;
            }

            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        warn!(provider = self.provider.name(), "provider event stream closed");
                        self.events = None;
                        self.schedule_retry();
                    }
                },
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.recover().await;
                }
            }
        }
        self.store_tx.send_replace(None);
        info!("sync coordinator stopped");
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    async fn cold_start(&mut self) {
        self.publish_progress(SyncPhase::Initializing, 0, "opening mirror".into());
        if let Err(err) = self.open_store() {
            self.fail(err);
            return;
        }
        self.subscribe_provider();
        match self.inspect_store() {
            Ok(None) => self.enter_steady("mirror ready".into()),
            Ok(Some(reason)) => self.full_sync(&reason).await,
            Err(err) => self.fail(err),
        }
    }

    /// Retry whatever failed last: open the store, re-subscribe, re-sync.
    async fn recover(&mut self) {
        if self.fatal {
            return;
        }
        if self.store.is_none() {
            if let Err(err) = self.open_store() {
                self.fail(err);
                return;
            }
        }
        if self.events.is_none() {
            self.subscribe_provider();
        }
        if self.needs_full_sync || self.state != SyncState::Steady {
            let reason = match self.state {
                SyncState::Degraded => "recovering from store failure",
                _ => "retrying full sync",
            };
            self.full_sync(reason).await;
        }
    }

    fn open_store(&mut self) -> std::result::Result<(), StoreError> {
        let store = Arc::new(MirrorStore::open(&self.store_path)?);
        info!(path = %self.store_path.display(), "mirror opened");
        self.store_tx.send_replace(Some(store.clone()));
        self.store = Some(store);
        Ok(())
    }

    fn subscribe_provider(&mut self) {
        match self.provider.subscribe() {
            Ok(rx) => {
                debug!(provider = self.provider.name(), "subscribed to provider events");
                self.events = Some(rx);
            }
            Err(err) => {
                warn!(provider = self.provider.name(), error = %err, "provider subscription failed");
                self.schedule_retry();
            }
        }
    }

    /// Decide whether the mirror can be trusted as-is.  Returns the reason
    /// for a full sync, or `None` to go straight to steady state.
    fn inspect_store(&mut self) -> std::result::Result<Option<String>, StoreError> {
        let Some(store) = self.store.clone() else {
            return Err(StoreError::Unavailable("mirror is not open".into()));
        };
        let cursor = store.get_cursor()?;
        if let Some(cursor) = &cursor {
            self.normalizer.resume_after(cursor.sequence);
            self.snapshot_tx.send_modify(|s| {
                s.cursor_sequence = cursor.sequence;
                s.last_full_sync_at = cursor.last_full_sync_at;
            });
        }

        if let Some(from) = store.migrated_from() {
            return Ok(Some(format!("schema migrated from version {from}")));
        }
        let Some(cursor) = cursor else {
            return Ok(Some("no sync cursor".into()));
        };
        if !cursor.is_current_schema() {
            return Ok(Some(format!(
                "cursor written under schema {}",
                cursor.schema_version
            )));
        }
        if cursor.status != CursorStatus::Idle {
            return Ok(Some(format!("previous session ended {:?}", cursor.status).to_lowercase()));
        }
        if store.read()?.get_bootstrap_progress()?.is_some() {
            return Ok(Some("interrupted full sync".into()));
        }
        if self.config.verify_on_start {
            let violations = store.verify()?;
            if !violations.is_empty() {
                for violation in violations.iter().take(10) {
                    warn!(%violation, "mirror integrity violation");
                }
                return Ok(Some(format!("{} integrity violations", violations.len())));
            }
        }
        Ok(None)
    }

    // ── full sync ───────────────────────────────────────────────────────────

    async fn full_sync(&mut self, reason: &str) {
        let Some(store) = self.store.clone() else {
            self.schedule_retry();
            return;
        };
        info!(reason, "full sync starting");
        self.set_state(SyncState::Bootstrapping);
        self.publish_progress(SyncPhase::Syncing, 0, format!("full sync: {reason}"));

        let generation = self.generation.load(Ordering::SeqCst);
        let current = self.generation.clone();
        let cancelled = move || current.load(Ordering::SeqCst) != generation;
        let status_tx = self.status_tx.clone();
        let snapshot_tx = self.snapshot_tx.clone();
        let report = move |p: &markmirror_store::BootstrapProgress| {
            let percentage = p.percentage();
            let message = format!(
                "{}/{} changes applied",
                p.mutations_applied, p.mutations_planned
            );
            let _ = status_tx.send(StatusMessage::SyncProgress {
                percentage,
                message: message.clone(),
                phase: SyncPhase::Syncing,
            });
            snapshot_tx.send_modify(|s| {
                s.phase = SyncPhase::Syncing;
                s.percentage = percentage;
                s.message = message;
            });
        };

        let options = BootstrapOptions::from(&self.config);
        let floor = self.normalizer.high_water();
        let result = run_full_sync(
            &store,
            self.provider.as_ref(),
            &options,
            floor,
            &cancelled,
            report,
        )
        .await;

        match result {
            Ok(outcome) => {
                self.needs_full_sync = false;
                self.retry_attempt = 0;
                self.retry_at = None;
                if self.events.is_none() {
                    self.subscribe_provider();
                }
                if let Ok(Some(cursor)) = store.get_cursor() {
                    self.normalizer.resume_after(cursor.sequence);
                    self.snapshot_tx.send_modify(|s| {
                        s.cursor_sequence = cursor.sequence;
                        s.last_full_sync_at = cursor.last_full_sync_at;
                    });
                }
                self.snapshot_tx.send_modify(|s| {
                    s.full_syncs += 1;
                    s.anomalies += outcome.anomalies as u64;
                    s.last_error = None;
                });
                self.enter_steady(format!("mirror in sync ({} nodes)", outcome.nodes));
            }
            Err(SyncError::Superseded) => {
                // The request that bumped the generation is already queued.
                self.needs_full_sync = true;
                info!(reason, "full sync abandoned for a newer request");
            }
            Err(SyncError::Store(err)) => self.fail(err),
            Err(err) => {
                warn!(error = %err, "full sync could not read the provider");
                self.needs_full_sync = true;
                self.set_state(SyncState::Steady);
                let delay = self.schedule_retry();
                self.snapshot_tx
                    .send_modify(|s| s.last_error = Some(err.to_string()));
                self.publish_progress(
                    SyncPhase::Syncing,
                    0,
                    format!(
                        "bookmark provider unavailable; retrying in {}s",
                        delay.as_secs().max(1)
                    ),
                );
            }
        }
    }

    // ── incremental path ────────────────────────────────────────────────────

    async fn on_event(&mut self, first: RawEvent) {
        self.normalizer.push(first);
        let deadline = Instant::now() + self.config.coalesce_window();
        while self.normalizer.pending_len() < self.config.max_batch_events.max(1) {
            let Some(events) = self.events.as_mut() else {
                break;
            };
            match timeout_at(deadline, events.recv()).await {
                Ok(Some(event)) => self.normalizer.push(event),
                Ok(None) => {
                    self.events = None;
                    self.schedule_retry();
                    break;
                }
                Err(_) => break,
            }
        }
        self.apply_pending().await;
    }

    async fn flush_events(&mut self) {
        if let Some(events) = self.events.as_mut() {
            while let Ok(event) = events.try_recv() {
                self.normalizer.push(event);
            }
        }
        self.apply_pending().await;
    }

    async fn apply_pending(&mut self) {
        let mutations = self.normalizer.drain();
        if mutations.is_empty() {
            return;
        }
        if self.state == SyncState::Degraded {
            // The recovery full sync re-reads the whole provider tree, which
            // already reflects these events, and writes its cursor at or above
            // the sequences they were given.
            debug!(
                dropped = mutations.len(),
                "mirror degraded; events left to the recovery full sync"
            );
            self.needs_full_sync = true;
            if self.retry_at.is_none() && !self.fatal {
                self.schedule_retry();
            }
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };
        match apply_batch(&store, mutations) {
            Ok(outcome) => {
                self.retry_attempt = 0;
                self.snapshot_tx.send_modify(|s| {
                    s.batches_applied += 1;
                    s.mutations_applied += outcome.applied as u64;
                    s.anomalies += outcome.anomalies.len() as u64;
                    if let Some(max) = outcome.max_sequence {
                        s.cursor_sequence = s.cursor_sequence.max(max);
                    }
                });
                if outcome.drift_detected {
                    warn!("mirror drifted from provider");
                    self.full_sync("drift detected").await;
                }
            }
            Err(err) => self.fail(err),
        }
    }

    // ── commands ────────────────────────────────────────────────────────────

    /// Returns `false` when the loop should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::ForceFullSync => {
                let mut coalesced = 0;
                while let Ok(next) = self.commands.try_recv() {
                    match next {
                        Command::ForceFullSync => coalesced += 1,
                        other => self.backlog.push_back(other),
                    }
                }
                if coalesced > 0 {
                    debug!(coalesced, "rebuild requests coalesced");
                }
                if self.fatal {
                    self.publish_progress(
                        SyncPhase::Failed,
                        0,
                        "mirror cannot be opened; reset it to rebuild".into(),
                    );
                } else if self.store.is_none() {
                    self.recover().await;
                } else {
                    self.full_sync("rebuild requested").await;
                }
                true
            }
            Command::Flush(reply) => {
                self.flush_events().await;
                let _ = reply.send(());
                true
            }
            Command::Shutdown => false,
        }
    }

    // ── state + status ──────────────────────────────────────────────────────

    fn set_state(&mut self, state: SyncState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "sync state changed");
            self.state = state;
        }
        self.snapshot_tx.send_modify(|s| s.state = state);
    }

    fn enter_steady(&mut self, message: String) {
        self.set_state(SyncState::Steady);
        self.publish_progress(SyncPhase::Completed, 100, message);
        let first = !self.snapshot_tx.borrow().db_ready;
        if first {
            self.snapshot_tx.send_modify(|s| s.db_ready = true);
            let _ = self.status_tx.send(StatusMessage::DbReady);
        }
    }

    fn fail(&mut self, err: StoreError) {
        let fatal = err.is_fatal();
        error!(error = %err, fatal, "mirror store failure");
        self.set_state(SyncState::Degraded);
        self.snapshot_tx
            .send_modify(|s| s.last_error = Some(err.to_string()));

        if let Some(store) = &self.store {
            let marked = store.write().and_then(|mut txn| {
                let mut cursor = txn.get_cursor()?.unwrap_or_default();
                cursor.status = CursorStatus::Degraded;
                txn.put_cursor(&cursor)?;
                txn.commit()
            });
            if let Err(err) = marked {
                debug!(error = %err, "could not persist degraded cursor");
            }
        }

        if fatal {
            self.fatal = true;
            self.publish_progress(SyncPhase::Failed, 0, err.to_string());
            return;
        }
        let delay = self.schedule_retry();
        self.publish_progress(
            SyncPhase::Failed,
            0,
            format!("{err}; retrying in {}s", delay.as_secs().max(1)),
        );
    }

    fn schedule_retry(&mut self) -> std::time::Duration {
        let delay = self.config.retry_delay(self.retry_attempt);
        self.retry_attempt = self.retry_attempt.saturating_add(1);
        let at = Instant::now() + delay;
        self.retry_at = Some(self.retry_at.map_or(at, |existing| existing.min(at)));
        debug!(delay_ms = delay.as_millis() as u64, attempt = self.retry_attempt, "retry scheduled");
        delay
    }

    fn publish_progress(&self, phase: SyncPhase, percentage: u8, message: String) {
        let _ = self.status_tx.send(StatusMessage::SyncProgress {
            percentage,
            message: message.clone(),
            phase,
        });
        self.snapshot_tx.send_modify(|s| {
            s.phase = phase;
            s.percentage = percentage;
            s.message = message;
        });
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<RawEvent>>) -> Option<RawEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
