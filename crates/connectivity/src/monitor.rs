//! Connection monitor: reachability probing, backoff, and outbox draining.
//!
//! One monitor is created at process start and cloned into whatever needs
//! connectivity state. It is the only writer of [`ConnectionState`]:
//!
//! - `check_connection` probes the backend with a hard timeout; only a
//!   successful round trip marks the client connected
//! - a transition into the connected state drains the outbox
//! - network signals are hints that trigger a fresh probe
//! - failed probes stretch the probe interval per the [`BackoffPolicy`]
//!
//! [`BackoffPolicy`]: crate::backoff::BackoffPolicy

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use fastnow_core::{Action, Entity, EntityId, LocalId, OperationId};
use fastnow_events::SyncEvent;
use fastnow_outbox::{FailureOutcome, NewOperation, Outbox, OutboxError, QueuedOperation};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::{Backend, BackendError, ReplayRequest};
use crate::config::MonitorConfig;
use crate::state::{ConnectionState, NetworkSignal};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("connection monitor is already running")]
    AlreadyRunning,
    #[error("connection monitor lock poisoned")]
    Poisoned,
}

/// Why a single operation could not be replayed.
#[derive(Debug, Clone, Error)]
pub enum ReplayError {
    /// The operation targets an entity whose create has not replayed yet.
    #[error("target {0} has no server id yet")]
    UnresolvedLocalId(LocalId),
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The local outbox could not resolve or settle the operation.
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// An operation removed from the outbox without being replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedOperation {
    pub operation_id: OperationId,
    pub entity: Entity,
    pub action: Action,
    pub attempts: u32,
    pub reason: String,
    /// The last failure might have cleared up on its own (outage, timeout).
    pub transient: bool,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Operations replayed and removed.
    pub replayed: usize,
    /// Operations that failed and stay queued.
    pub failed: usize,
    /// Operations skipped because an earlier one on the same target failed.
    pub blocked: usize,
    /// Creates discarded because their entity already has a server id.
    pub already_applied: usize,
    /// Operations removed after exhausting their attempts.
    pub dropped: Vec<DroppedOperation>,
    /// Another drain was already running; nothing was done.
    pub skipped_in_flight: bool,
}

impl DrainReport {
    fn in_flight() -> Self {
        Self {
            skipped_in_flight: true,
            ..Self::default()
        }
    }
}

/// Connectivity monitor handle. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    outbox: Outbox,
    config: MonitorConfig,
    state: RwLock<ConnectionState>,
    drain_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<MonitorTask>>,
}

struct MonitorTask {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionMonitor {
    pub fn new(backend: Arc<dyn Backend>, outbox: Outbox, config: MonitorConfig) -> Self {
        let state = ConnectionState::new(&config.backoff);
        Self {
            inner: Arc::new(Inner {
                backend,
                outbox,
                config,
                state: RwLock::new(state),
                drain_lock: tokio::sync::Mutex::new(()),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Snapshot of the current connection state.
    pub fn state(&self) -> ConnectionState {
        match self.inner.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected
    }

    /// Probe the backend and update the connection state.
    ///
    /// Never fails: errors and timeouts count as "not connected". A
    /// transition into the connected state drains the outbox before
    /// returning.
    pub async fn check_connection(&self) -> bool {
        let (connected, transitioned) = self.probe().await;
        if transitioned {
            self.process_queue().await;
        }
        connected
    }

    /// Reset backoff and probe right away (user-initiated retry).
    pub async fn force_retry(&self) -> bool {
        self.with_state(|s| s.reset_backoff(&self.inner.config.backoff));
        tracing::info!("forced connection retry");
        self.check_connection().await
    }

    /// Queue a write for later replay.
    ///
    /// When the backend is currently reachable a drain is started in the
    /// background, so the write goes out without waiting for the next probe.
    pub async fn queue_operation(&self, new: NewOperation) -> Result<OperationId, OutboxError> {
        let id = self.inner.outbox.enqueue(new).await?;

        if self.is_connected() {
            let monitor = self.clone();
            tokio::spawn(async move {
                monitor.process_queue().await;
            });
        }

        Ok(id)
    }

    /// React to a platform network signal.
    pub async fn handle_signal(&self, signal: NetworkSignal) {
        tracing::debug!(?signal, "network signal");

        match signal {
            NetworkSignal::Offline => {
                if self.with_state(|s| s.go_offline()) {
                    self.announce_connection(false);
                }
            }
            NetworkSignal::Online => {
                self.with_state(|s| s.is_online = true);
                self.check_connection().await;
            }
            NetworkSignal::FocusGained => {
                self.check_connection().await;
            }
        }
    }

    /// Replay queued operations oldest first while the backend is reachable.
    ///
    /// A failed operation stays queued (or is dropped once it exhausted its
    /// attempts) and the pass moves on, except that later operations on the
    /// same target are held back until the failed one goes through. A
    /// connectivity failure ends the pass.
    pub async fn process_queue(&self) -> DrainReport {
        let Ok(_drain) = self.inner.drain_lock.try_lock() else {
            tracing::debug!("drain already in flight");
            return DrainReport::in_flight();
        };

        let mut report = DrainReport::default();
        if !self.is_connected() {
            return report;
        }

        let operations = match self.inner.outbox.list().await {
            Ok(ops) => ops,
            Err(err) => {
                tracing::error!(error = %err, "failed to list queued operations");
                return report;
            }
        };
        if operations.is_empty() {
            return report;
        }

        tracing::info!(pending = operations.len(), "draining outbox");
        self.inner.outbox.publish(SyncEvent::SyncStart {
            pending: operations.len(),
        });

        let mut failed_targets: HashSet<(Entity, EntityId)> = HashSet::new();

        for op in operations {
            if !self.is_connected() {
                tracing::info!("connection lost, stopping drain");
                break;
            }

            let raw_key = op.target.clone().map(|t| (op.entity, t));
            if raw_key.as_ref().is_some_and(|k| failed_targets.contains(k)) {
                self.hold_back(&op, &mut report);
                continue;
            }

            let target = match &op.target {
                Some(target) => match self.inner.outbox.resolve_mapped_id(target).await {
                    Ok(resolved) => Some(resolved),
                    Err(err) => {
                        failed_targets.extend(raw_key);
                        self.settle_failure(&op, &ReplayError::Outbox(err), &mut report)
                            .await;
                        continue;
                    }
                },
                None => None,
            };

            let key = target.clone().map(|t| (op.entity, t));
            if key.as_ref().is_some_and(|k| failed_targets.contains(k)) {
                self.hold_back(&op, &mut report);
                continue;
            }

            // A second create for an entity the server already has.
            if op.action.creates_entity() && target.as_ref().is_some_and(|t| !t.is_local()) {
                match self.inner.outbox.remove(op.id).await {
                    Ok(()) => {
                        tracing::info!(
                            operation_id = %op.id,
                            entity = %op.entity,
                            action = %op.action,
                            "entity already created, discarding operation"
                        );
                        report.already_applied += 1;
                    }
                    Err(err) => {
                        failed_targets.extend(raw_key);
                        failed_targets.extend(key);
                        self.settle_failure(&op, &ReplayError::Outbox(err), &mut report)
                            .await;
                    }
                }
                continue;
            }

            let settled = match self.replay_one(&op, target).await {
                Ok(server_id) => self
                    .inner
                    .outbox
                    .complete(&op, server_id.as_deref())
                    .await
                    .map_err(ReplayError::Outbox),
                Err(err) => Err(err),
            };

            match settled {
                Ok(()) => {
                    tracing::info!(
                        operation_id = %op.id,
                        entity = %op.entity,
                        action = %op.action,
                        "replayed operation"
                    );
                    report.replayed += 1;
                }
                Err(err) => {
                    failed_targets.extend(raw_key);
                    failed_targets.extend(key);
                    self.settle_failure(&op, &err, &mut report).await;
                }
            }
        }

        self.inner.outbox.publish(SyncEvent::SyncComplete {
            replayed: report.replayed,
            failed: report.failed,
            dropped: report.dropped.len(),
            blocked: report.blocked,
        });

        tracing::info!(
            replayed = report.replayed,
            failed = report.failed,
            dropped = report.dropped.len(),
            blocked = report.blocked,
            already_applied = report.already_applied,
            "drain complete"
        );

        report
    }

    /// Start the monitor task.
    ///
    /// The task probes immediately, then again every `current_interval`, and
    /// re-probes on `Online`/`FocusGained` signals. It runs until
    /// [`stop_monitoring`](Self::stop_monitoring), which also drops `signals`.
    pub fn start_monitoring(
        &self,
        signals: mpsc::Receiver<NetworkSignal>,
    ) -> Result<(), MonitorError> {
        let mut task = self.inner.task.lock().map_err(|_| MonitorError::Poisoned)?;
        if task.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(self.clone().run(signals, shutdown.clone()));
        *task = Some(MonitorTask { shutdown, handle });
        Ok(())
    }

    /// Stop the monitor task and wait for it to finish. No-op when stopped.
    pub async fn stop_monitoring(&self) {
        let task = match self.inner.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(task) = task else {
            return;
        };

        task.shutdown.notify_one();
        if let Err(err) = task.handle.await {
            tracing::warn!(error = %err, "connection monitor task ended abnormally");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner
            .task
            .lock()
            .map(|task| task.is_some())
            .unwrap_or(false)
    }

    async fn run(self, mut signals: mpsc::Receiver<NetworkSignal>, shutdown: Arc<Notify>) {
        tracing::info!("connection monitor started");

        let mut signals_open = true;
        let mut next_probe = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    break;
                }
                signal = signals.recv(), if signals_open => {
                    match signal {
                        Some(signal) => self.handle_signal(signal).await,
                        None => {
                            tracing::debug!("network signal source closed");
                            signals_open = false;
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_probe) => {
                    self.tick().await;
                }
            }

            next_probe = Instant::now() + self.state().current_interval;
        }

        tracing::info!("connection monitor stopped");
    }

    /// Periodic probe. While connected, also retries whatever is still queued.
    async fn tick(&self) {
        let was_connected = self.is_connected();
        let connected = self.check_connection().await;

        if was_connected && connected {
            match self.inner.outbox.pending_count().await {
                Ok(0) => {}
                Ok(_) => {
                    self.process_queue().await;
                }
                Err(err) => tracing::warn!(error = %err, "failed to count queued operations"),
            }
        }
    }

    /// Probe with a timeout and fold the result into the state.
    /// Returns `(connected, transitioned_to_connected)`.
    async fn probe(&self) -> (bool, bool) {
        let timeout = self.inner.config.probe_timeout;
        let result = match tokio::time::timeout(timeout, self.inner.backend.probe()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        };

        let policy = self.inner.config.backoff;
        match result {
            Ok(()) => {
                let transitioned = self.with_state(|s| s.record_success(&policy));
                if transitioned {
                    tracing::info!("backend reachable");
                    self.announce_connection(true);
                }
                (true, transitioned)
            }
            Err(err) => {
                let (lost, retry_count, interval) = self.with_state(|s| {
                    let lost = s.record_failure(&policy, err.to_string());
                    (lost, s.retry_count, s.current_interval)
                });
                tracing::debug!(
                    error = %err,
                    retry_count,
                    interval_ms = interval.as_millis() as u64,
                    "probe failed"
                );
                if lost {
                    tracing::warn!(error = %err, "backend unreachable");
                    self.announce_connection(false);
                }
                (false, false)
            }
        }
    }

    /// Send one operation to the backend. Returns the server id it produced.
    async fn replay_one(
        &self,
        op: &QueuedOperation,
        target: Option<EntityId>,
    ) -> Result<Option<String>, ReplayError> {
        let target = match target {
            Some(EntityId::Remote(id)) => Some(id),
            // The server assigns ids to rows created offline.
            Some(EntityId::Local(_)) if op.action.creates_entity() => None,
            Some(EntityId::Local(local)) => return Err(ReplayError::UnresolvedLocalId(local)),
            None => None,
        };

        let request = ReplayRequest {
            operation_id: op.id,
            entity: op.entity,
            action: op.action.clone(),
            user_id: op.user_id,
            target,
            payload: op.payload.clone(),
        };

        let replay = self.inner.backend.replay(&request);
        let outcome = tokio::time::timeout(self.inner.config.replay_timeout, replay)
            .await
            .map_err(|_| BackendError::Timeout)??;

        Ok(outcome.server_id)
    }

    fn hold_back(&self, op: &QueuedOperation, report: &mut DrainReport) {
        tracing::debug!(
            operation_id = %op.id,
            entity = %op.entity,
            action = %op.action,
            "held back behind an earlier failure on the same target"
        );
        report.blocked += 1;
    }

    async fn settle_failure(&self, op: &QueuedOperation, err: &ReplayError, report: &mut DrainReport) {
        let reason = err.to_string();
        let transient = matches!(err, ReplayError::Backend(e) if e.is_transient());
        tracing::warn!(
            operation_id = %op.id,
            entity = %op.entity,
            action = %op.action,
            attempts = op.attempts,
            transient,
            error = %reason,
            "replay failed"
        );

        if let ReplayError::Backend(backend_err) = err {
            if backend_err.is_connectivity() && self.with_state(|s| s.mark_disconnected(Some(reason.clone()))) {
                self.announce_connection(false);
            }
        }

        match self
            .inner
            .outbox
            .record_failure(op, &reason, self.inner.config.max_attempts)
            .await
        {
            Ok(FailureOutcome::Retrying { .. }) => report.failed += 1,
            Ok(FailureOutcome::Dropped { attempts }) => report.dropped.push(DroppedOperation {
                operation_id: op.id,
                entity: op.entity,
                action: op.action.clone(),
                attempts,
                reason,
                transient,
            }),
            Err(outbox_err) => {
                tracing::error!(operation_id = %op.id, error = %outbox_err, "failed to record replay failure");
                report.failed += 1;
            }
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ConnectionState) -> R) -> R {
        match self.inner.state.write() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn announce_connection(&self, connected: bool) {
        self.inner
            .outbox
            .publish(SyncEvent::ConnectionChanged { connected });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReplayOutcome;
    use crate::backoff::BackoffPolicy;
    use crate::state::ConnectionStatus;
    use async_trait::async_trait;
    use fastnow_core::UserId;
    use chrono::{DateTime, Utc};
    use fastnow_events::{EventBus, InMemoryEventBus};
    use fastnow_outbox::{IdMapping, InMemoryOutboxStore, OutboxStore};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scriptable backend.
    #[derive(Default)]
    struct FakeBackend {
        healthy: AtomicBool,
        probe_delay: Mutex<Option<Duration>>,
        replay_delay: Mutex<Option<Duration>>,
        probes: AtomicUsize,
        replays: Mutex<Vec<ReplayRequest>>,
        failures: Mutex<HashMap<(Entity, Action), BackendError>>,
        next_id: AtomicUsize,
    }

    impl FakeBackend {
        fn healthy() -> Arc<Self> {
            let backend = Self::default();
            backend.healthy.store(true, Ordering::SeqCst);
            Arc::new(backend)
        }

        fn down() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        fn fail(&self, entity: Entity, action: Action, err: BackendError) {
            self.failures.lock().unwrap().insert((entity, action), err);
        }

        fn heal(&self, entity: Entity, action: Action) {
            self.failures.lock().unwrap().remove(&(entity, action));
        }

        fn replays(&self) -> Vec<ReplayRequest> {
            self.replays.lock().unwrap().clone()
        }

        fn probes(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }

        fn creates(&self) -> usize {
            self.replays()
                .iter()
                .filter(|r| r.action.creates_entity())
                .count()
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn probe(&self) -> Result<(), BackendError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let delay = *self.probe_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BackendError::Transport("connection refused".into()))
            }
        }

        async fn replay(&self, request: &ReplayRequest) -> Result<ReplayOutcome, BackendError> {
            let delay = *self.replay_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.replays.lock().unwrap().push(request.clone());

            let failure = self
                .failures
                .lock()
                .unwrap()
                .get(&(request.entity, request.action.clone()))
                .cloned();
            if let Some(err) = failure {
                return Err(err);
            }

            if request.action.creates_entity() {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(ReplayOutcome::created(format!("srv-{n}")))
            } else {
                Ok(ReplayOutcome::default())
            }
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            max_attempts: 3,
            probe_timeout: Duration::from_secs(2),
            replay_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(8)),
        }
    }

    fn monitor(backend: Arc<FakeBackend>) -> ConnectionMonitor {
        ConnectionMonitor::new(backend, Outbox::in_memory(), config())
    }

    fn walking(user: UserId, action: Action, session: impl Into<EntityId>) -> NewOperation {
        NewOperation::new(user, Entity::WalkingSession, action)
            .target(session)
            .payload(json!({ "at": "2026-10-18T07:00:00Z" }))
    }

    fn rejected() -> BackendError {
        BackendError::Rejected {
            status: 422,
            message: "violates check constraint".into(),
        }
    }

    #[tokio::test]
    async fn offline_start_replays_once_when_backend_returns() {
        let backend = FakeBackend::down();
        let monitor = monitor(backend.clone());
        let user = UserId::new();
        let session = LocalId::new();

        assert!(!monitor.check_connection().await);
        monitor
            .queue_operation(walking(user, Action::Start, session))
            .await
            .unwrap();
        assert_eq!(monitor.outbox().list().await.unwrap().len(), 1);

        backend.set_healthy(true);
        assert!(monitor.check_connection().await);

        assert!(monitor.outbox().list().await.unwrap().is_empty());
        let replays = backend.replays();
        assert_eq!(replays.len(), 1);
        assert_eq!(replays[0].action, Action::Start);
        assert_eq!(replays[0].target, None);
        assert_eq!(
            monitor.outbox().resolve_mapped_id(&EntityId::Local(session)).await.unwrap(),
            EntityId::remote("srv-1")
        );
    }

    #[tokio::test]
    async fn repeated_checks_do_not_duplicate_replays() {
        let backend = FakeBackend::down();
        let monitor = monitor(backend.clone());
        let user = UserId::new();
        monitor
            .queue_operation(walking(user, Action::Start, LocalId::new()))
            .await
            .unwrap();
        monitor
            .queue_operation(NewOperation::new(user, Entity::FoodEntry, Action::Create))
            .await
            .unwrap();

        backend.set_healthy(true);
        assert!(monitor.check_connection().await);
        assert!(monitor.check_connection().await);

        assert_eq!(backend.replays().len(), 2);
        assert_eq!(monitor.outbox().pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn later_operations_resolve_through_the_new_mapping() {
        let backend = FakeBackend::down();
        let monitor = monitor(backend.clone());
        let user = UserId::new();
        let session = LocalId::new();

        for action in [Action::Start, Action::Pause, Action::Resume, Action::End] {
            monitor
                .queue_operation(walking(user, action, session))
                .await
                .unwrap();
        }

        backend.set_healthy(true);
        monitor.check_connection().await;

        let replays = backend.replays();
        let actions: Vec<_> = replays.iter().map(|r| r.action.clone()).collect();
        assert_eq!(
            actions,
            vec![Action::Start, Action::Pause, Action::Resume, Action::End]
        );
        assert!(replays[1..].iter().all(|r| r.target.as_deref() == Some("srv-1")));
    }

    #[tokio::test]
    async fn failed_start_holds_back_pause_on_the_same_session() {
        let backend = FakeBackend::down();
        backend.fail(Entity::WalkingSession, Action::Start, rejected());
        let monitor = monitor(backend.clone());
        let user = UserId::new();
        let session = LocalId::new();

        monitor.queue_operation(walking(user, Action::Start, session)).await.unwrap();
        monitor.queue_operation(walking(user, Action::Pause, session)).await.unwrap();
        monitor
            .queue_operation(NewOperation::new(user, Entity::FoodEntry, Action::Create))
            .await
            .unwrap();

        backend.set_healthy(true);
        monitor.check_connection().await;

        let replayed: Vec<_> = backend.replays().into_iter().map(|r| (r.entity, r.action)).collect();
        assert_eq!(
            replayed,
            vec![
                (Entity::WalkingSession, Action::Start),
                (Entity::FoodEntry, Action::Create),
            ]
        );

        let queued = monitor.outbox().list().await.unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].action, Action::Start);
        assert_eq!(queued[0].attempts, 1);
        assert!(queued[0].last_error.as_deref().unwrap().contains("422"));
        assert_eq!(queued[1].action, Action::Pause);
        assert_eq!(queued[1].attempts, 0);

        // Once the start goes through, the pause follows in the same pass.
        backend.heal(Entity::WalkingSession, Action::Start);
        let report = monitor.process_queue().await;
        assert_eq!(report.replayed, 2);
        assert!(monitor.outbox().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_operation_is_dropped_and_reported() {
        let backend = FakeBackend::healthy();
        backend.fail(Entity::FoodEntry, Action::Create, rejected());
        let monitor = monitor(backend.clone());
        let events = monitor.outbox().events().subscribe();
        monitor.check_connection().await;

        let id = monitor
            .outbox()
            .enqueue(NewOperation::new(UserId::new(), Entity::FoodEntry, Action::Create))
            .await
            .unwrap();

        for expected_attempts in 1..=3 {
            let report = monitor.process_queue().await;
            assert_eq!(report.failed, 1);
            assert_eq!(monitor.outbox().list().await.unwrap()[0].attempts, expected_attempts);
        }

        let report = monitor.process_queue().await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].operation_id, id);
        assert_eq!(report.dropped[0].attempts, 3);
        assert!(monitor.outbox().list().await.unwrap().is_empty());

        // Does not reappear.
        assert_eq!(monitor.process_queue().await, DrainReport::default());

        let dropped_events = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, SyncEvent::OperationDropped { operation_id, .. } if *operation_id == id))
            .count();
        assert_eq!(dropped_events, 1);
    }

    #[tokio::test]
    async fn update_for_never_created_entity_fails_as_unresolved() {
        let backend = FakeBackend::healthy();
        let monitor = monitor(backend.clone());
        monitor.check_connection().await;

        monitor
            .outbox()
            .enqueue(walking(UserId::new(), Action::Pause, LocalId::new()))
            .await
            .unwrap();
        let report = monitor.process_queue().await;

        assert_eq!(report.failed, 1);
        assert!(backend.replays().is_empty());
        let queued = monitor.outbox().list().await.unwrap();
        assert!(queued[0].last_error.as_deref().unwrap().contains("no server id"));
    }

    #[tokio::test]
    async fn transport_failure_mid_drain_disconnects_and_stops() {
        let backend = FakeBackend::healthy();
        backend.fail(
            Entity::FoodEntry,
            Action::Create,
            BackendError::Transport("connection reset".into()),
        );
        let monitor = monitor(backend.clone());
        let events = monitor.outbox().events().subscribe();
        monitor.check_connection().await;

        let user = UserId::new();
        monitor
            .outbox()
            .enqueue(NewOperation::new(user, Entity::FoodEntry, Action::Create))
            .await
            .unwrap();
        monitor
            .outbox()
            .enqueue(NewOperation::new(user, Entity::Profile, Action::Update).target(EntityId::remote("p1")))
            .await
            .unwrap();

        let report = monitor.process_queue().await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.replayed, 0);
        assert_eq!(backend.replays().len(), 1);
        assert!(!monitor.is_connected());
        assert_eq!(monitor.state().status, ConnectionStatus::Disconnected);
        assert!(events.drain().contains(&SyncEvent::ConnectionChanged { connected: false }));
    }

    #[tokio::test]
    async fn drain_while_disconnected_does_nothing() {
        let backend = FakeBackend::down();
        let monitor = monitor(backend.clone());
        monitor
            .outbox()
            .enqueue(NewOperation::new(UserId::new(), Entity::FoodEntry, Action::Create))
            .await
            .unwrap();

        assert_eq!(monitor.process_queue().await, DrainReport::default());
        assert!(backend.replays().is_empty());
    }

    #[tokio::test]
    async fn drain_publishes_start_and_complete() {
        let backend = FakeBackend::down();
        let monitor = monitor(backend.clone());
        monitor
            .queue_operation(NewOperation::new(UserId::new(), Entity::FoodEntry, Action::Create))
            .await
            .unwrap();
        let events = monitor.outbox().events().subscribe();

        backend.set_healthy(true);
        monitor.check_connection().await;

        let names: Vec<_> = events.drain().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["connection_changed", "sync_start", "queue_changed", "sync_complete"]
        );
    }

    #[tokio::test]
    async fn failed_probes_back_off_and_success_resets() {
        let backend = FakeBackend::down();
        let monitor = monitor(backend.clone());

        for _ in 0..3 {
            assert!(!monitor.check_connection().await);
        }
        let state = monitor.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.retry_count, 3);
        assert_eq!(state.current_interval, Duration::from_secs(8));
        assert!(state.last_error.is_some());

        backend.set_healthy(true);
        assert!(monitor.check_connection().await);
        let state = monitor.state();
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.current_interval, Duration::from_secs(1));
        assert!(state.last_connected_at.is_some());
    }

    #[tokio::test]
    async fn force_retry_resets_backoff_before_probing() {
        let backend = FakeBackend::down();
        let monitor = monitor(backend.clone());
        monitor.check_connection().await;
        monitor.check_connection().await;
        assert_eq!(monitor.state().retry_count, 2);

        assert!(!monitor.force_retry().await);
        let state = monitor.state();
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.current_interval, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_times_out_as_disconnected() {
        let backend = FakeBackend::healthy();
        *backend.probe_delay.lock().unwrap() = Some(Duration::from_secs(30));
        let monitor = monitor(backend.clone());

        assert!(!monitor.check_connection().await);
        assert_eq!(monitor.state().last_error.as_deref(), Some("request timed out"));
    }

    #[tokio::test]
    async fn offline_signal_disconnects_without_probing() {
        let backend = FakeBackend::healthy();
        let monitor = monitor(backend.clone());
        monitor.check_connection().await;
        let probes = backend.probes();

        monitor.handle_signal(NetworkSignal::Offline).await;

        assert_eq!(backend.probes(), probes);
        let state = monitor.state();
        assert!(!state.is_online);
        assert!(!state.is_connected);

        monitor.handle_signal(NetworkSignal::Online).await;
        assert_eq!(backend.probes(), probes + 1);
        assert!(monitor.is_connected());
    }

    #[tokio::test]
    async fn online_signal_alone_never_means_connected() {
        let backend = FakeBackend::down();
        let monitor = monitor(backend.clone());

        monitor.handle_signal(NetworkSignal::Online).await;

        let state = monitor.state();
        assert!(state.is_online);
        assert!(!state.is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_probes_on_start_and_on_schedule() {
        let backend = FakeBackend::down();
        let monitor = monitor(backend.clone());
        let (signals_tx, signals_rx) = mpsc::channel(8);

        monitor.start_monitoring(signals_rx).unwrap();
        assert!(matches!(
            monitor.start_monitoring(mpsc::channel(1).1),
            Err(MonitorError::AlreadyRunning)
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.probes(), 1);

        // First retry after 2s (1s doubled once).
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(backend.probes(), 2);

        backend.set_healthy(true);
        signals_tx.send(NetworkSignal::FocusGained).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(monitor.is_connected());

        monitor.stop_monitoring().await;
        assert!(!monitor.is_monitoring());
        assert!(signals_tx.is_closed());

        let probes = backend.probes();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.probes(), probes);

        // Stopping twice is fine, and the monitor can be restarted.
        monitor.stop_monitoring().await;
        monitor.start_monitoring(mpsc::channel(1).1).unwrap();
        monitor.stop_monitoring().await;
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_drains_replay_once() {
        let backend = FakeBackend::healthy();
        *backend.replay_delay.lock().unwrap() = Some(Duration::from_millis(50));
        let monitor = monitor(backend.clone());
        monitor.check_connection().await;
        let user = UserId::new();
        for _ in 0..5 {
            monitor
                .outbox()
                .enqueue(NewOperation::new(user, Entity::FoodEntry, Action::Create))
                .await
                .unwrap();
        }

        let (a, b) = tokio::join!(monitor.process_queue(), monitor.process_queue());

        let skipped = [&a, &b].iter().filter(|r| r.skipped_in_flight).count();
        assert_eq!(skipped, 1);
        assert_eq!(a.replayed + b.replayed, 5);
        assert_eq!(backend.replays().len(), 5);
        assert_eq!(monitor.outbox().pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_create_is_discarded_not_reinserted() {
        let backend = FakeBackend::healthy();
        let monitor = monitor(backend.clone());
        monitor.check_connection().await;
        let user = UserId::new();
        let session = LocalId::new();
        for _ in 0..2 {
            monitor
                .outbox()
                .enqueue(walking(user, Action::Start, session))
                .await
                .unwrap();
        }

        let report = monitor.process_queue().await;
        assert_eq!(report.replayed, 1);
        assert_eq!(report.already_applied, 1);
        assert_eq!(report.failed, 0);
        assert!(monitor.outbox().list().await.unwrap().is_empty());

        for _ in 0..3 {
            monitor.process_queue().await;
        }
        assert_eq!(backend.creates(), 1);
    }

    /// In-memory store whose mapping table can be made to fail.
    #[derive(Default)]
    struct FlakyMappings {
        inner: InMemoryOutboxStore,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl FlakyMappings {
        fn check(&self, flag: &AtomicBool) -> Result<(), OutboxError> {
            if flag.load(Ordering::SeqCst) {
                Err(OutboxError::Storage("mapping table unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl OutboxStore for FlakyMappings {
        async fn insert(&self, op: &QueuedOperation) -> Result<(), OutboxError> {
            self.inner.insert(op).await
        }

        async fn list(&self, user_id: Option<UserId>) -> Result<Vec<QueuedOperation>, OutboxError> {
            self.inner.list(user_id).await
        }

        async fn get(&self, id: OperationId) -> Result<Option<QueuedOperation>, OutboxError> {
            self.inner.get(id).await
        }

        async fn update(&self, op: &QueuedOperation) -> Result<(), OutboxError> {
            self.inner.update(op).await
        }

        async fn remove(&self, id: OperationId) -> Result<bool, OutboxError> {
            self.inner.remove(id).await
        }

        async fn remove_user(&self, user_id: UserId) -> Result<usize, OutboxError> {
            self.inner.remove_user(user_id).await
        }

        async fn count(&self) -> Result<usize, OutboxError> {
            self.inner.count().await
        }

        async fn get_mapping(&self, local_id: LocalId) -> Result<Option<IdMapping>, OutboxError> {
            self.check(&self.fail_reads)?;
            self.inner.get_mapping(local_id).await
        }

        async fn put_mapping(&self, mapping: &IdMapping) -> Result<(), OutboxError> {
            self.check(&self.fail_writes)?;
            self.inner.put_mapping(mapping).await
        }

        async fn purge_mappings_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OutboxError> {
            self.inner.purge_mappings_before(cutoff).await
        }
    }

    fn flaky_monitor(backend: Arc<FakeBackend>, store: Arc<FlakyMappings>) -> ConnectionMonitor {
        let outbox = Outbox::new(store, Arc::new(InMemoryEventBus::<SyncEvent>::new()));
        ConnectionMonitor::new(backend, outbox, config())
    }

    #[tokio::test]
    async fn unsettled_replay_counts_attempts_until_dropped() {
        let backend = FakeBackend::healthy();
        let store = Arc::new(FlakyMappings::default());
        store.fail_writes.store(true, Ordering::SeqCst);
        let monitor = flaky_monitor(backend.clone(), store);
        monitor.check_connection().await;
        let user = UserId::new();
        let session = LocalId::new();
        monitor.outbox().enqueue(walking(user, Action::Start, session)).await.unwrap();
        monitor.outbox().enqueue(walking(user, Action::Pause, session)).await.unwrap();

        for expected_attempts in 1..=3 {
            let report = monitor.process_queue().await;
            assert_eq!(report.failed, 1);
            assert_eq!(report.blocked, 1);
            assert_eq!(monitor.outbox().list().await.unwrap()[0].attempts, expected_attempts);
        }

        let report = monitor.process_queue().await;
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].action, Action::Start);
        assert!(!report.dropped[0].transient);
        assert!(report.dropped[0].reason.contains("mapping table unavailable"));
        assert_eq!(backend.creates(), 4);

        let queued = monitor.outbox().list().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, Action::Pause);
        assert_eq!(queued[0].attempts, 0);
    }

    #[tokio::test]
    async fn unresolvable_target_fails_and_holds_back_followers() {
        let backend = FakeBackend::healthy();
        let store = Arc::new(FlakyMappings::default());
        store.fail_reads.store(true, Ordering::SeqCst);
        let monitor = flaky_monitor(backend.clone(), store);
        monitor.check_connection().await;
        let user = UserId::new();
        let session = LocalId::new();
        monitor.outbox().enqueue(walking(user, Action::Pause, session)).await.unwrap();
        monitor.outbox().enqueue(walking(user, Action::End, session)).await.unwrap();

        let report = monitor.process_queue().await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.blocked, 1);
        assert!(backend.replays().is_empty());
        let queued = monitor.outbox().list().await.unwrap();
        assert_eq!(queued[0].attempts, 1);
        assert_eq!(queued[1].attempts, 0);
    }
}
