//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Rehydrate: latest snapshot (if any) + events after it, folded by the engine
//!   ↓
//! 2. Check the caller's expected version (strict `submit` only)
//!   ↓
//! 3. Decide (pure, produces events)
//!   ↓
//! 4. Append with optimistic concurrency at the rehydrated version
//!   ↓
//! 5. Wake the relay, which publishes in global order
//!   ↓
//! 6. Write a snapshot every N versions (best effort)
//! ```
//!
//! Every store call runs under the configured command timeout. Expiry surfaces
//! as `StoreError::Timeout`.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use eventide_core::{AggregateRef, DomainError};
use eventide_events::{AggregateEngine, EngineError, Event, Versioned};

use crate::event_store::{EventStore, Snapshot, StoreError};
use crate::relay::CommitNotifier;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum CommandError {
    /// Deterministic domain rejection; never retried.
    #[error("command rejected: {0}")]
    Rejected(DomainError),

    /// Optimistic concurrency failure.
    #[error("version conflict on {aggregate_ref}: expected {expected}, actual {actual}")]
    VersionConflict {
        aggregate_ref: AggregateRef,
        expected: u64,
        actual: u64,
    },

    /// The aggregate's stream cannot be folded; the operation is halted.
    #[error("event stream corrupted for {aggregate_ref}: {detail}")]
    Corrupted {
        aggregate_ref: AggregateRef,
        detail: String,
    },

    /// Storage failed or timed out.
    #[error("storage error: {0}")]
    Storage(StoreError),

    /// Encoding decided events failed.
    #[error("aggregate engine error: {0}")]
    Engine(EngineError),
}

impl CommandError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::VersionConflict { .. } => true,
            Self::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::VersionConflict {
                aggregate_ref,
                expected,
                actual,
            } => Self::VersionConflict {
                aggregate_ref,
                expected,
                actual,
            },
            StoreError::Corrupted {
                aggregate_ref,
                detail,
            } => Self::Corrupted {
                aggregate_ref,
                detail,
            },
            other => Self::Storage(other),
        }
    }
}

impl From<DomainError> for CommandError {
    fn from(value: DomainError) -> Self {
        Self::Rejected(value)
    }
}

impl From<EngineError> for CommandError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::Domain(err) => Self::Rejected(err),
            EngineError::Decode { ref aggregate_ref, .. }
            | EngineError::OutOfOrder { ref aggregate_ref, .. } => Self::Corrupted {
                aggregate_ref: aggregate_ref.clone(),
                detail: value.to_string(),
            },
            other => Self::Engine(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for each individual store call.
    pub command_timeout: Duration,
    /// Snapshot when a commit crosses a multiple of this version; 0 disables.
    pub snapshot_every: u64,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            snapshot_every: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// The orchestrator never publishes to the bus itself; after a successful
/// append it wakes the [`crate::relay::EventRelay`], which owns global ordering.
///
/// ## Error Semantics
///
/// - domain rejection → `CommandError::Rejected`, nothing appended
/// - stale version → `CommandError::VersionConflict`, nothing appended
/// - gap or undecodable history → `CommandError::Corrupted`, logged at `error`
/// - backend failure or timeout → `CommandError::Storage`
pub struct CommandOrchestrator<S, E> {
    store: S,
    notifier: CommitNotifier,
    config: OrchestratorConfig,
    _engine: PhantomData<fn() -> E>,
}

impl<S: Clone, E> Clone for CommandOrchestrator<S, E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
            _engine: PhantomData,
        }
    }
}

impl<S, E> CommandOrchestrator<S, E> {
    pub fn new(store: S, notifier: CommitNotifier) -> Self {
        Self::with_config(store, notifier, OrchestratorConfig::default())
    }

    pub fn with_config(store: S, notifier: CommitNotifier, config: OrchestratorConfig) -> Self {
        Self {
            store,
            notifier,
            config,
            _engine: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}

impl<S, E> CommandOrchestrator<S, E>
where
    S: EventStore,
    E: AggregateEngine,
{
    /// Strict submission: fails with `VersionConflict` unless the aggregate is
    /// exactly at `expected_version`. Never retried.
    #[instrument(skip(self, aggregate_ref, command), fields(aggregate = %aggregate_ref))]
    pub async fn submit(
        &self,
        aggregate_ref: &AggregateRef,
        expected_version: u64,
        command: E::Command,
    ) -> Result<Vec<Arc<Event>>, CommandError> {
        let outcome = self
            .attempt(aggregate_ref, Some(expected_version), &command, true)
            .await;
        self.report(aggregate_ref, outcome)
    }

    /// Execute against whatever the current version is, retrying version
    /// conflicts under the configured [`RetryPolicy`]. Retries reload the full
    /// history rather than trusting a snapshot.
    #[instrument(skip(self, aggregate_ref, command), fields(aggregate = %aggregate_ref))]
    pub async fn execute(
        &self,
        aggregate_ref: &AggregateRef,
        command: E::Command,
    ) -> Result<Vec<Arc<Event>>, CommandError> {
        let policy = self.config.retry;
        let mut attempt = 1;
        loop {
            match self.attempt(aggregate_ref, None, &command, attempt == 1).await {
                Err(CommandError::VersionConflict {
                    expected, actual, ..
                }) if policy.allows_retry_after(attempt) => {
                    let delay = policy.delay_for(attempt);
                    debug!(
                        attempt,
                        expected,
                        actual,
                        delay_ms = delay.as_millis() as u64,
                        "version conflict; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                outcome => return self.report(aggregate_ref, outcome),
            }
        }
    }

    /// Current folded state and version.
    pub async fn load_state(
        &self,
        aggregate_ref: &AggregateRef,
    ) -> Result<Versioned<E>, CommandError> {
        let outcome = self.rehydrate(aggregate_ref, true).await;
        if let Err(CommandError::Corrupted { detail, .. }) = &outcome {
            error!(aggregate = %aggregate_ref, detail, "event stream corrupted");
        }
        outcome
    }

    async fn attempt(
        &self,
        aggregate_ref: &AggregateRef,
        expected_version: Option<u64>,
        command: &E::Command,
        use_snapshot: bool,
    ) -> Result<Vec<Arc<Event>>, CommandError> {
        let current = self.rehydrate(aggregate_ref, use_snapshot).await?;
        if let Some(expected) = expected_version {
            if expected != current.version {
                return Err(CommandError::VersionConflict {
                    aggregate_ref: aggregate_ref.clone(),
                    expected,
                    actual: current.version,
                });
            }
        }

        let decided = current.state.decide(command)?;
        if decided.is_empty() {
            return Ok(vec![]);
        }

        let committed = self
            .timed(
                "append",
                self.store.append(aggregate_ref, current.version, decided),
            )
            .await?;
        self.notifier.notify();
        self.maybe_snapshot(current, &committed).await;
        Ok(committed)
    }

    fn report(
        &self,
        aggregate_ref: &AggregateRef,
        outcome: Result<Vec<Arc<Event>>, CommandError>,
    ) -> Result<Vec<Arc<Event>>, CommandError> {
        match &outcome {
            Ok(events) => {
                if let Some(last) = events.last() {
                    info!(
                        events = events.len(),
                        version = last.local_sequence,
                        global_sequence = last.global_sequence,
                        "command committed"
                    );
                }
            }
            Err(CommandError::Rejected(reason)) => debug!(reason = %reason, "command rejected"),
            Err(CommandError::Corrupted { detail, .. }) => {
                error!(aggregate = %aggregate_ref, detail, "event stream corrupted")
            }
            Err(err) => warn!(error = %err, "command failed"),
        }
        outcome
    }

    async fn rehydrate(
        &self,
        aggregate_ref: &AggregateRef,
        use_snapshot: bool,
    ) -> Result<Versioned<E>, CommandError> {
        if use_snapshot {
            if let Some(base) = self.snapshot_base(aggregate_ref).await {
                if let Some(state) = self.continue_from(base).await? {
                    return Ok(state);
                }
            }
        }

        let history = self
            .timed("load", self.store.load(aggregate_ref, 0))
            .await?;
        let mut state = Versioned::<E>::initial(aggregate_ref.clone())?;
        state.fold(history.iter().map(Arc::as_ref))?;
        Ok(state)
    }

    /// Fold the events after a snapshot. `None` means the snapshot is ahead of
    /// the stream and must be ignored.
    async fn continue_from(
        &self,
        mut base: Versioned<E>,
    ) -> Result<Option<Versioned<E>>, CommandError> {
        let tail = self
            .timed("load", self.store.load(&base.aggregate_ref, base.version))
            .await?;
        if tail.is_empty() {
            let head = self
                .timed("current_version", self.store.current_version(&base.aggregate_ref))
                .await?;
            if head != base.version {
                warn!(
                    aggregate = %base.aggregate_ref,
                    snapshot_version = base.version,
                    head,
                    "snapshot is ahead of the event stream; ignoring it"
                );
                return Ok(None);
            }
        }
        base.fold(tail.iter().map(Arc::as_ref))?;
        Ok(Some(base))
    }

    async fn snapshot_base(&self, aggregate_ref: &AggregateRef) -> Option<Versioned<E>> {
        let snapshot = match self
            .timed("get_snapshot", self.store.get_snapshot(aggregate_ref))
            .await
        {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(err) => {
                warn!(aggregate = %aggregate_ref, error = %err, "snapshot lookup failed; replaying full history");
                return None;
            }
        };

        match E::restore(aggregate_ref, &snapshot.state_blob) {
            Ok(state) => Some(Versioned::at(aggregate_ref.clone(), state, snapshot.version)),
            Err(err) => {
                warn!(aggregate = %aggregate_ref, error = %err, "unusable snapshot; replaying full history");
                None
            }
        }
    }

    async fn maybe_snapshot(&self, mut current: Versioned<E>, committed: &[Arc<Event>]) {
        let every = self.config.snapshot_every;
        let Some(last) = committed.last() else {
            return;
        };
        if every == 0 || current.version / every == last.local_sequence / every {
            return;
        }

        if let Err(err) = current.fold(committed.iter().map(Arc::as_ref)) {
            warn!(aggregate = %current.aggregate_ref, error = %err, "cannot fold committed events for snapshot");
            return;
        }
        let state_blob = match current.state.snapshot() {
            Ok(blob) => blob,
            Err(err) => {
                warn!(aggregate = %current.aggregate_ref, error = %err, "cannot encode snapshot");
                return;
            }
        };

        let snapshot = Snapshot {
            aggregate_ref: current.aggregate_ref.clone(),
            version: current.version,
            state_blob,
        };
        match self
            .timed("put_snapshot", self.store.put_snapshot(snapshot))
            .await
        {
            Ok(()) => debug!(aggregate = %current.aggregate_ref, version = current.version, "snapshot written"),
            Err(err) => warn!(aggregate = %current.aggregate_ref, error = %err, "snapshot write failed"),
        }
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let after = self.config.command_timeout;
        match tokio::time::timeout(after, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout { operation, after }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use eventide_domain::{CounterCommand, DomainAggregate, DomainCommand};
    use eventide_events::NewEvent;

    use crate::event_store::InMemoryEventStore;

    type Orchestrator<S> = CommandOrchestrator<S, DomainAggregate>;

    fn counter(id: &str) -> AggregateRef {
        AggregateRef::new("counter", id).unwrap()
    }

    fn inc(by: u64) -> DomainCommand {
        CounterCommand::Increment { by }.into()
    }

    fn orchestrator(config: OrchestratorConfig) -> Orchestrator<Arc<InMemoryEventStore>> {
        CommandOrchestrator::with_config(
            Arc::new(InMemoryEventStore::new()),
            CommitNotifier::new(),
            config,
        )
    }

    #[tokio::test]
    async fn stale_submit_conflicts_and_fresh_submit_commits() {
        let orch = orchestrator(OrchestratorConfig::default());
        let c = counter("c1");
        for version in 0..5 {
            orch.submit(&c, version, inc(1)).await.unwrap();
        }

        let err = orch.submit(&c, 4, inc(1)).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::VersionConflict { expected: 4, actual: 5, .. }
        ));

        let committed = orch.submit(&c, 5, inc(1)).await.unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].local_sequence, 6);
    }

    #[tokio::test]
    async fn rejected_command_appends_nothing() {
        let orch = orchestrator(OrchestratorConfig::default());
        let c = counter("c");
        let err = orch
            .execute(&c, CounterCommand::Decrement { by: 1 }.into())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Rejected(DomainError::InvariantViolation(_))));
        assert!(!err.is_retryable());
        assert_eq!(orch.store().last_global_sequence().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_aggregate_type_is_rejected() {
        let orch = orchestrator(OrchestratorConfig::default());
        let r = AggregateRef::new("spaceship", "s").unwrap();
        let err = orch.execute(&r, inc(1)).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Rejected(DomainError::UnknownAggregateType(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn execute_retries_conflicts_until_every_command_lands() {
        let orch = Arc::new(orchestrator(OrchestratorConfig {
            retry: RetryPolicy {
                max_attempts: 50,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..OrchestratorConfig::default()
        }));
        let c = counter("hot");

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let orch = Arc::clone(&orch);
                let c = c.clone();
                tokio::spawn(async move { orch.execute(&c, inc(1)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let state = orch.load_state(&c).await.unwrap();
        assert_eq!(state.version, 10);
        assert_eq!(state.state.view()["value"], 10);
    }

    #[tokio::test]
    async fn snapshot_path_equals_full_fold() {
        let orch = orchestrator(OrchestratorConfig {
            snapshot_every: 3,
            ..OrchestratorConfig::default()
        });
        let c = counter("snap");
        for by in 1..=7 {
            orch.execute(&c, inc(by)).await.unwrap();
        }

        let snapshot = orch.store().get_snapshot(&c).await.unwrap().unwrap();
        assert_eq!(snapshot.version, 6);

        let via_snapshot = orch.load_state(&c).await.unwrap();
        let full = orch.rehydrate(&c, false).await.unwrap();
        assert_eq!(via_snapshot, full);
        assert_eq!(full.version, 7);
        assert_eq!(full.state.view()["value"], 28);
    }

    #[tokio::test]
    async fn snapshot_ahead_of_stream_is_ignored() {
        let orch = orchestrator(OrchestratorConfig::default());
        let c = counter("bogus");
        orch.execute(&c, inc(2)).await.unwrap();

        let mut ahead = DomainAggregate::initial(&c).unwrap();
        let decided = ahead.decide(&inc(40)).unwrap();
        let fake = Event::commit(c.clone(), 1, 99, decided[0].clone(), chrono::Utc::now());
        ahead.apply(&fake).unwrap();
        orch.store()
            .put_snapshot(Snapshot {
                aggregate_ref: c.clone(),
                version: 9,
                state_blob: ahead.snapshot().unwrap(),
            })
            .await
            .unwrap();

        let state = orch.load_state(&c).await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.state.view()["value"], 2);
    }

    #[tokio::test]
    async fn garbage_snapshot_falls_back_to_history() {
        let orch = orchestrator(OrchestratorConfig::default());
        let c = counter("garbage");
        orch.execute(&c, inc(3)).await.unwrap();
        orch.store()
            .put_snapshot(Snapshot {
                aggregate_ref: c.clone(),
                version: 1,
                state_blob: b"not a snapshot".to_vec(),
            })
            .await
            .unwrap();

        let state = orch.load_state(&c).await.unwrap();
        assert_eq!(state.state.view()["value"], 3);
    }

    /// Store double whose loads drop the first of several events, simulating a gap.
    struct GappyStore(InMemoryEventStore);

    #[async_trait]
    impl EventStore for GappyStore {
        async fn append(
            &self,
            aggregate_ref: &AggregateRef,
            expected_version: u64,
            events: Vec<NewEvent>,
        ) -> Result<Vec<Arc<Event>>, StoreError> {
            self.0.append(aggregate_ref, expected_version, events).await
        }

        async fn load(
            &self,
            aggregate_ref: &AggregateRef,
            from_version: u64,
        ) -> Result<Vec<Arc<Event>>, StoreError> {
            let mut events = self.0.load(aggregate_ref, from_version).await?;
            if events.len() > 1 {
                events.remove(0);
            }
            Ok(events)
        }

        async fn load_since_batch(
            &self,
            after: u64,
            limit: usize,
        ) -> Result<Vec<Arc<Event>>, StoreError> {
            self.0.load_since_batch(after, limit).await
        }

        async fn current_version(&self, aggregate_ref: &AggregateRef) -> Result<u64, StoreError> {
            self.0.current_version(aggregate_ref).await
        }

        async fn last_global_sequence(&self) -> Result<u64, StoreError> {
            self.0.last_global_sequence().await
        }

        async fn get_snapshot(
            &self,
            aggregate_ref: &AggregateRef,
        ) -> Result<Option<Snapshot>, StoreError> {
            self.0.get_snapshot(aggregate_ref).await
        }

        async fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
            self.0.put_snapshot(snapshot).await
        }
    }

    #[tokio::test]
    async fn gap_in_history_halts_with_corruption() {
        let orch: Orchestrator<GappyStore> = CommandOrchestrator::new(
            GappyStore(InMemoryEventStore::new()),
            CommitNotifier::new(),
        );
        let c = counter("gap");
        orch.execute(&c, inc(1)).await.unwrap();
        orch.execute(&c, inc(1)).await.unwrap();

        let err = orch.load_state(&c).await.unwrap_err();
        assert!(matches!(err, CommandError::Corrupted { .. }));

        let err = orch.execute(&c, inc(1)).await.unwrap_err();
        assert!(matches!(err, CommandError::Corrupted { .. }));
        assert!(!err.is_retryable());
    }

    /// Store double whose loads never finish in time.
    struct SlowStore(InMemoryEventStore);

    #[async_trait]
    impl EventStore for SlowStore {
        async fn append(
            &self,
            aggregate_ref: &AggregateRef,
            expected_version: u64,
            events: Vec<NewEvent>,
        ) -> Result<Vec<Arc<Event>>, StoreError> {
            self.0.append(aggregate_ref, expected_version, events).await
        }

        async fn load(
            &self,
            aggregate_ref: &AggregateRef,
            from_version: u64,
        ) -> Result<Vec<Arc<Event>>, StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            self.0.load(aggregate_ref, from_version).await
        }

        async fn load_since_batch(
            &self,
            after: u64,
            limit: usize,
        ) -> Result<Vec<Arc<Event>>, StoreError> {
            self.0.load_since_batch(after, limit).await
        }

        async fn current_version(&self, aggregate_ref: &AggregateRef) -> Result<u64, StoreError> {
            self.0.current_version(aggregate_ref).await
        }

        async fn last_global_sequence(&self) -> Result<u64, StoreError> {
            self.0.last_global_sequence().await
        }

        async fn get_snapshot(
            &self,
            aggregate_ref: &AggregateRef,
        ) -> Result<Option<Snapshot>, StoreError> {
            self.0.get_snapshot(aggregate_ref).await
        }

        async fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
            self.0.put_snapshot(snapshot).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_surfaces_a_retryable_timeout() {
        let orch: Orchestrator<SlowStore> = CommandOrchestrator::with_config(
            SlowStore(InMemoryEventStore::new()),
            CommitNotifier::new(),
            OrchestratorConfig {
                command_timeout: Duration::from_millis(50),
                ..OrchestratorConfig::default()
            },
        );
        let err = orch.execute(&counter("slow"), inc(1)).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Storage(StoreError::Timeout { operation: "load", .. })
        ));
        assert!(err.is_retryable());
    }
}
