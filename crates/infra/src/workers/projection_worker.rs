use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use eventide_events::{Event, EventBus, SubscriptionPattern};

use super::WorkerHandle;
use crate::event_store::EventStore;
use crate::stream::{StreamFrame, StreamManager, StreamRequest};

/// Delay before reopening a stream that could not be opened.
const REOPEN_DELAY: Duration = Duration::from_millis(500);

/// A read model that can be fed from a live stream.
///
/// Implementations use interior mutability; they are shared with readers.
pub trait LiveProjection: Send + Sync + 'static {
    /// Global sequence of the last applied event.
    fn checkpoint(&self) -> u64;

    /// Apply one event; returns `false` when it was already applied.
    fn apply_event(&self, event: &Event) -> bool;
}

enum SessionEnd {
    Shutdown,
    Resync,
    BusClosed,
}

/// Keeps a [`LiveProjection`] current.
///
/// The worker is an ordinary stream client: it resumes from the projection's
/// checkpoint, so it gets the same catch-up and lag guarantees as external
/// consumers. A reconnect directive reopens the stream from the checkpoint.
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    pub fn spawn<S, B, P>(
        name: &'static str,
        streams: Arc<StreamManager<S, B>>,
        pattern: SubscriptionPattern,
        projection: Arc<P>,
    ) -> WorkerHandle
    where
        S: EventStore + Clone + 'static,
        B: EventBus + 'static,
        P: LiveProjection,
    {
        WorkerHandle::spawn(name, move |mut shutdown| async move {
            info!(worker = name, pattern = %pattern, "projection worker starting");

            loop {
                let request = StreamRequest::resume(pattern.clone(), projection.checkpoint());
                let mut session = match streams.open(request).await {
                    Ok(session) => session,
                    Err(err) => {
                        warn!(worker = name, error = %err, "cannot open stream; retrying");
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(REOPEN_DELAY) => continue,
                        }
                    }
                };

                let end = loop {
                    let frame = tokio::select! {
                        _ = &mut shutdown => break SessionEnd::Shutdown,
                        frame = session.next_frame() => frame,
                    };
                    match frame {
                        Some(StreamFrame::Event { event, .. }) => {
                            if !projection.apply_event(&event) {
                                debug!(worker = name, global_sequence = event.global_sequence, "skipped redelivered event");
                            }
                        }
                        Some(StreamFrame::Reconnect { last_event_id, reason }) => {
                            warn!(worker = name, last_event_id, ?reason, "projection worker resynchronizing");
                            break SessionEnd::Resync;
                        }
                        Some(StreamFrame::Snapshot { .. } | StreamFrame::Heartbeat) => {}
                        None => break SessionEnd::BusClosed,
                    }
                };

                match end {
                    SessionEnd::Resync => continue,
                    SessionEnd::Shutdown | SessionEnd::BusClosed => break,
                }
            }

            info!(worker = name, checkpoint = projection.checkpoint(), "projection worker stopped");
        })
    }
}
