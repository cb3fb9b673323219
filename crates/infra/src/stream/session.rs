use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use tokio::time::Instant;
use tracing::{debug, warn};

use eventide_events::{Event, RecvError, Subscription, TopicResolver};

use super::{ReconnectReason, StreamConfig, StreamFrame};
use crate::event_store::EventStore;

#[derive(Debug)]
enum SessionState {
    Replaying {
        buffer: VecDeque<Arc<Event>>,
        cursor: u64,
        exhausted: bool,
    },
    Tailing,
    AwaitingReconnect(ReconnectReason),
    Closed,
}

/// One client's stream: replay from the store, then tail the live subscription.
///
/// ```text
/// Replaying ──(history exhausted)──▶ Tailing
///     │                                 │
///     └──(lag / store error)──▶ AwaitingReconnect ──▶ Closed
/// ```
///
/// Dropping the session drops its subscription, which deregisters it from the bus.
pub struct StreamSession<S> {
    store: S,
    subscription: Subscription,
    topics: Arc<dyn TopicResolver>,
    config: StreamConfig,
    state: SessionState,
    pending_snapshot: Option<StreamFrame>,
    last_sent: u64,
    last_frame_at: Instant,
}

impl<S> core::fmt::Debug for StreamSession<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamSession")
            .field("subscription", &self.subscription)
            .field("state", &self.state)
            .field("last_sent", &self.last_sent)
            .finish()
    }
}

impl<S> StreamSession<S>
where
    S: EventStore + 'static,
{
    pub(super) fn new(
        store: S,
        subscription: Subscription,
        topics: Arc<dyn TopicResolver>,
        config: StreamConfig,
        start_after: u64,
        snapshot: Option<StreamFrame>,
    ) -> Self {
        Self {
            store,
            subscription,
            topics,
            config,
            state: SessionState::Replaying {
                buffer: VecDeque::new(),
                cursor: start_after,
                exhausted: false,
            },
            pending_snapshot: snapshot,
            last_sent: start_after,
            last_frame_at: Instant::now(),
        }
    }

    /// Global sequence of the last event delivered (or covered by the snapshot).
    pub fn last_event_id(&self) -> u64 {
        self.last_sent
    }

    pub fn is_tailing(&self) -> bool {
        matches!(self.state, SessionState::Tailing)
    }

    /// Next frame, or `None` once the stream has ended.
    ///
    /// Not cancel-safe: a future dropped mid-way leaves the session closed.
    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        if let Some(snapshot) = self.pending_snapshot.take() {
            return Some(self.sent(snapshot));
        }

        loop {
            let frame = match std::mem::replace(&mut self.state, SessionState::Closed) {
                SessionState::Replaying {
                    buffer,
                    cursor,
                    exhausted,
                } => self.replay(buffer, cursor, exhausted).await,
                SessionState::Tailing => self.tail().await,
                SessionState::AwaitingReconnect(reason) => {
                    debug!(last_event_id = self.last_sent, ?reason, "stream asks client to reconnect");
                    Some(StreamFrame::Reconnect {
                        last_event_id: self.last_sent,
                        reason,
                    })
                }
                SessionState::Closed => return None,
            };
            if let Some(frame) = frame {
                return Some(self.sent(frame));
            }
        }
    }

    /// Consume the session as a pull-based stream of frames.
    pub fn into_stream(self) -> impl Stream<Item = StreamFrame> + Send {
        futures::stream::unfold(self, |mut session| async move {
            let frame = session.next_frame().await?;
            Some((frame, session))
        })
    }

    async fn replay(
        &mut self,
        mut buffer: VecDeque<Arc<Event>>,
        mut cursor: u64,
        mut exhausted: bool,
    ) -> Option<StreamFrame> {
        while let Some(event) = buffer.pop_front() {
            if let Some(frame) = self.deliver(event, true) {
                self.state = SessionState::Replaying {
                    buffer,
                    cursor,
                    exhausted,
                };
                return Some(frame);
            }
        }

        if exhausted {
            debug!(last_event_id = self.last_sent, "replay finished; tailing");
            self.state = SessionState::Tailing;
            return None;
        }

        if let Some(skipped) = self.subscription.pending_lag() {
            self.state = SessionState::AwaitingReconnect(ReconnectReason::Lagged { skipped });
            return None;
        }

        let limit = self.config.replay_batch_size.max(1);
        match self.store.load_since_batch(cursor, limit).await {
            Ok(page) => {
                exhausted = page.len() < limit;
                if let Some(last) = page.last() {
                    cursor = last.global_sequence;
                }
                buffer.extend(page);
                self.state = SessionState::Replaying {
                    buffer,
                    cursor,
                    exhausted,
                };
            }
            Err(err) => {
                warn!(cursor, error = %err, "stream replay failed");
                self.state = SessionState::AwaitingReconnect(ReconnectReason::StoreUnavailable);
            }
        }
        None
    }

    async fn tail(&mut self) -> Option<StreamFrame> {
        let heartbeat_at = self.last_frame_at + self.config.heartbeat_interval;
        let received = tokio::select! {
            received = self.subscription.recv() => Some(received),
            _ = tokio::time::sleep_until(heartbeat_at) => None,
        };

        match received {
            None => {
                self.state = SessionState::Tailing;
                Some(StreamFrame::Heartbeat)
            }
            Some(Ok(event)) => {
                self.state = SessionState::Tailing;
                self.deliver(event, false)
            }
            Some(Err(RecvError::Lagged { skipped })) => {
                warn!(
                    skipped,
                    last_event_id = self.last_sent,
                    pattern = %self.subscription.pattern(),
                    "stream subscription lagged"
                );
                self.state = SessionState::AwaitingReconnect(ReconnectReason::Lagged { skipped });
                None
            }
            Some(Err(RecvError::Closed)) => {
                debug!("event bus closed; ending stream");
                None
            }
        }
    }

    /// Turn an event into a frame unless it was already delivered.
    ///
    /// Replayed history is filtered by pattern here; live events were already
    /// matched by the bus.
    fn deliver(&mut self, event: Arc<Event>, filter: bool) -> Option<StreamFrame> {
        if event.global_sequence <= self.last_sent {
            return None;
        }
        if filter && !self.subscription.pattern().matches(&self.topics.topic_of(&event)) {
            return None;
        }
        self.last_sent = event.global_sequence;
        Some(StreamFrame::Event {
            id: event.global_sequence,
            event,
        })
    }

    fn sent(&mut self, frame: StreamFrame) -> StreamFrame {
        self.last_frame_at = Instant::now();
        frame
    }
}
