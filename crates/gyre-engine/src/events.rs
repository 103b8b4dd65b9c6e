use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Engine-side event. The lifecycle layer wraps these into run events,
/// stamping ids and timestamps when they are durably appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub sequence_no: u64,
    pub kind: EngineEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEventKind {
    Started {
        run_id: String,
        graph_id: String,
        resumed: bool,
    },
    NodeRunning {
        node_id: String,
        attempt: u32,
    },
    ModelDelta {
        node_id: String,
        text: String,
    },
    NodeSucceeded {
        node_id: String,
        attempt: u32,
        output_bytes: u64,
    },
    NodeFailed {
        node_id: String,
        attempt: u32,
        reason: String,
        will_retry: bool,
    },
    NodeRetrying {
        node_id: String,
        attempt: u32,
        next_attempt: u32,
        delay_ms: u64,
    },
    ParallelStarted {
        node_id: String,
        branch_count: usize,
    },
    ParallelBranchCompleted {
        node_id: String,
        branch_label: String,
        succeeded: bool,
    },
    HumanQuestionPending {
        node_id: String,
        prompt: String,
    },
    HumanQuestionAnswered {
        node_id: String,
        answer: String,
    },
    HumanQuestionTimedOut {
        node_id: String,
    },
    CheckpointSaved {
        node_id: String,
        step: u64,
    },
    Completed {
        final_node: Option<String>,
    },
    Failed {
        reason: String,
    },
}

pub trait EngineEventObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EngineEventObserver for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event);
    }
}

pub type SharedEngineEventObserver = Arc<dyn EngineEventObserver>;
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Fan-out point for engine events: an optional synchronous observer plus an
/// optional channel sender, either or both.
#[derive(Clone, Default)]
pub struct EngineEventSink {
    observer: Option<SharedEngineEventObserver>,
    sender: Option<EngineEventSender>,
}

impl EngineEventSink {
    pub fn with_observer(observer: SharedEngineEventObserver) -> Self {
        Self {
            observer: Some(observer),
            sender: None,
        }
    }

    pub fn with_sender(sender: EngineEventSender) -> Self {
        Self {
            observer: None,
            sender: Some(sender),
        }
    }

    pub fn observer(mut self, observer: SharedEngineEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: EngineEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn engine_event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn sink_fans_out_to_observer_and_sender() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer_seen = Arc::clone(&seen);
        let observer: SharedEngineEventObserver = Arc::new(move |event: &EngineEvent| {
            observer_seen
                .lock()
                .expect("observer mutex should lock")
                .push(event.sequence_no);
        });

        let (tx, mut rx) = engine_event_channel();
        let sink = EngineEventSink::with_observer(observer).sender(tx);
        sink.emit(EngineEvent {
            sequence_no: 3,
            kind: EngineEventKind::Completed { final_node: None },
        });

        assert_eq!(rx.try_recv().expect("event should stream").sequence_no, 3);
        assert_eq!(seen.lock().expect("mutex should lock").as_slice(), &[3]);
    }
}
