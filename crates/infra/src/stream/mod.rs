//! Reconnection-safe event streaming for external consumers.
//!
//! Every connection follows the same protocol:
//!
//! 1. subscribe to the bus for the requested pattern
//! 2. only then read history from the store: after the client's resume token,
//!    or after the position of a current-state snapshot sent up front
//! 3. replay history, then switch to the live subscription and drop every event
//!    whose global sequence was already delivered
//! 4. when the subscription lags, tell the client where to resume and end
//!
//! Subscribing before reading history means an event committed during replay
//! is found either in the store or in the subscription buffer (often in both,
//! hence the dedupe). It can never fall between the two.

mod session;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use eventide_events::{Event, EventBus, SubscriptionPattern, TopicResolver};

use crate::event_store::{EventStore, StoreError};

pub use session::StreamSession;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// A heartbeat is sent when nothing else was sent for this long.
    pub heartbeat_interval: Duration,
    /// Events read from the store per replay page.
    pub replay_batch_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            replay_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub pattern: SubscriptionPattern,
    /// Last global sequence the client has seen (SSE `Last-Event-ID`).
    pub resume_from: Option<u64>,
}

impl StreamRequest {
    pub fn fresh(pattern: SubscriptionPattern) -> Self {
        Self {
            pattern,
            resume_from: None,
        }
    }

    pub fn resume(pattern: SubscriptionPattern, last_event_id: u64) -> Self {
        Self {
            pattern,
            resume_from: Some(last_event_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ReconnectReason {
    /// The live subscription overflowed; `skipped` events never reached it.
    Lagged { skipped: u64 },
    /// History could not be read.
    StoreUnavailable,
}

/// One unit sent to a streaming client.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Current state of everything the pattern covers, as of global sequence `id`.
    Snapshot { id: u64, body: serde_json::Value },
    Event { id: u64, event: Arc<Event> },
    Heartbeat,
    /// Final frame: reconnect with `last_event_id` as the resume token.
    Reconnect {
        last_event_id: u64,
        reason: ReconnectReason,
    },
}

impl StreamFrame {
    /// Resume token carried by the frame, if any.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Snapshot { id, .. } | Self::Event { id, .. } => Some(*id),
            Self::Reconnect { last_event_id, .. } => Some(*last_event_id),
            Self::Heartbeat => None,
        }
    }
}

/// Read model state handed to clients that connect without a resume token.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentState {
    /// Global sequence the state is consistent with; replay continues after it.
    pub position: u64,
    pub body: serde_json::Value,
}

/// Source of the full current-state snapshot frame.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn current_state(
        &self,
        pattern: &SubscriptionPattern,
    ) -> Result<CurrentState, StoreError>;
}

/// Opens stream sessions against one store and bus.
pub struct StreamManager<S, B> {
    store: S,
    bus: B,
    topics: Arc<dyn TopicResolver>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    config: StreamConfig,
}

impl<S, B> StreamManager<S, B>
where
    S: EventStore + Clone + 'static,
    B: EventBus,
{
    pub fn new(store: S, bus: B, topics: Arc<dyn TopicResolver>, config: StreamConfig) -> Self {
        Self {
            store,
            bus,
            topics,
            snapshots: None,
            config,
        }
    }

    /// Serve clients without a resume token a snapshot from `source`.
    ///
    /// Without a source such clients replay the whole log.
    pub fn with_snapshots(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.snapshots = Some(source);
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub async fn open(&self, request: StreamRequest) -> Result<StreamSession<S>, StoreError> {
        let StreamRequest {
            pattern,
            resume_from,
        } = request;

        // Subscribe before touching history.
        let subscription = self.bus.subscribe(pattern.clone());

        let (start_after, snapshot) = match (resume_from, &self.snapshots) {
            (Some(token), _) => (token, None),
            (None, Some(source)) => {
                let state = source.current_state(&pattern).await?;
                let frame = StreamFrame::Snapshot {
                    id: state.position,
                    body: state.body,
                };
                (state.position, Some(frame))
            }
            (None, None) => (0, None),
        };

        debug!(
            pattern = %pattern,
            resume_from,
            start_after,
            snapshot = snapshot.is_some(),
            "stream session opened"
        );

        Ok(StreamSession::new(
            self.store.clone(),
            subscription,
            Arc::clone(&self.topics),
            self.config.clone(),
            start_after,
            snapshot,
        ))
    }
}
