use crate::{ControlResult, RunEvent, SharedControlStore, now_rfc3339};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Recognized run event types. The stream is open-ended: engine node events
/// use the `Node.<id>.<phase>` form.
pub mod event_types {
    pub const RUN_QUEUED: &str = "RunQueued";
    pub const RUN_STARTED: &str = "RunStarted";
    pub const RUN_CANCELED: &str = "RunCanceled";
    pub const RUN_COMPLETED: &str = "RunCompleted";
    pub const RUN_FAILED: &str = "RunFailed";
    pub const ENVIRONMENT_RESOLVED: &str = "EnvironmentResolved";
    pub const ATTRACTOR_CONTENT_RESOLVED: &str = "AttractorContentResolved";
    pub const HUMAN_QUESTION_PENDING: &str = "HumanQuestionPending";
    pub const HUMAN_QUESTION_ANSWERED: &str = "HumanQuestionAnswered";
    pub const HUMAN_QUESTION_TIMED_OUT: &str = "HumanQuestionTimedOut";
    pub const IMPLEMENTATION_PATCH_EXTRACTED: &str = "ImplementationPatchExtracted";
    pub const IMPLEMENTATION_PATCH_APPLIED: &str = "ImplementationPatchApplied";
    pub const IMPLEMENTATION_PATCH_MISSING: &str = "ImplementationPatchMissing";
    pub const MODEL_FALLBACK_APPLIED: &str = "ModelFallbackApplied";
}

const CHANNEL_CAPACITY: usize = 1024;

/// Append-only per-run event log with pub/sub fan-out.
///
/// Appends are durable before publication: the store write completes before
/// the broadcast send, so a subscriber that replays the persisted prefix and
/// then follows the live channel never observes a gap.
#[derive(Clone)]
pub struct EventLog {
    store: SharedControlStore,
    channels: Arc<Mutex<BTreeMap<String, broadcast::Sender<RunEvent>>>>,
}

/// One element of a streaming subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamItem {
    Event(RunEvent),
    /// Emitted periodically so idle subscribers can detect disconnection.
    Heartbeat,
    /// The subscriber fell behind the broadcast channel and lost `skipped`
    /// events; a fresh subscription replays the persisted log.
    Lagged { skipped: u64 },
}

impl EventLog {
    pub fn new(store: SharedControlStore) -> Self {
        Self {
            store,
            channels: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn channel(&self, run_id: &str) -> broadcast::Sender<RunEvent> {
        let mut channels = self.channels.lock().expect("event channel mutex");
        channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Durably append an event, then publish it on `run.events.<runId>`.
    pub async fn append(
        &self,
        run_id: &str,
        event_type: &str,
        payload: Value,
    ) -> ControlResult<RunEvent> {
        let event = RunEvent {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            ts: now_rfc3339(),
            event_type: event_type.to_string(),
            payload,
        };
        let stored = self.store.append_event(event).await?;
        let _ = self.channel(run_id).send(stored.clone());
        Ok(stored)
    }

    pub async fn events_for_run(&self, run_id: &str) -> ControlResult<Vec<RunEvent>> {
        self.store.events_for_run(run_id).await
    }

    /// Subscribe with replay: the persisted prefix is delivered first, then
    /// live events, with heartbeats at `heartbeat_interval` while idle.
    pub async fn subscribe(
        &self,
        run_id: &str,
        heartbeat_interval: Duration,
    ) -> ControlResult<mpsc::UnboundedReceiver<StreamItem>> {
        // Register the live receiver before reading the prefix so nothing
        // appended in between is lost; duplicates are filtered by id.
        let mut live = self.channel(run_id).subscribe();
        let replay = self.store.events_for_run(run_id).await?;
        let mut seen: Vec<String> = replay.iter().map(|event| event.id.clone()).collect();

        let (tx, rx) = mpsc::unbounded_channel();
        for event in replay {
            let _ = tx.send(StreamItem::Event(event));
        }

        tokio::spawn(async move {
            loop {
                let next = tokio::time::timeout(heartbeat_interval, live.recv()).await;
                match next {
                    Ok(Ok(event)) => {
                        if seen.contains(&event.id) {
                            continue;
                        }
                        seen.push(event.id.clone());
                        if tx.send(StreamItem::Event(event)).is_err() {
                            return;
                        }
                    }
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        if tx.send(StreamItem::Lagged { skipped }).is_err() {
                            return;
                        }
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => return,
                    Err(_) => {
                        if tx.send(StreamItem::Heartbeat).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
