//! Progress broadcaster: fan-out of macro lifecycle and notification events.
//!
//! Publishing never fails from the caller's point of view. With nobody
//! subscribed the event is simply dropped.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Lifecycle stage of a macro run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MacroStatus {
    /// Run accepted, no step dispatched yet.
    Started,
    /// A step is about to be dispatched.
    InProgress,
    /// Every step succeeded or was skipped.
    Completed,
    /// Aborted.
    Failed,
}

/// Payload of the `macro:progress` topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MacroProgress {
    /// Macro key.
    #[serde(rename = "macro")]
    pub macro_key: String,
    /// Macro label.
    pub label: String,
    /// Stage.
    pub status: MacroStatus,
    /// Who triggered the run (tablet id or `Schedule:<name>`).
    pub actor: String,
    /// Steps in this macro (not counting nested children).
    pub steps_total: usize,
    /// Steps finished so far.
    pub steps_completed: usize,
    /// Step being dispatched (`in_progress` only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Abort reason (`failed` only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything pushed to panels.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", content = "payload")]
pub enum GatewayEvent {
    /// Macro lifecycle transition.
    #[serde(rename = "macro:progress")]
    Progress(MacroProgress),
    /// Message from a `notify` step.
    #[serde(rename = "notification")]
    Notification {
        /// Text to show.
        message: String,
    },
}

impl GatewayEvent {
    /// Topic name used by transports.
    pub fn topic(&self) -> &'static str {
        match self {
            GatewayEvent::Progress(_) => "macro:progress",
            GatewayEvent::Notification { .. } => "notification",
        }
    }
}

/// In-process broadcaster built on a tokio broadcast channel.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<GatewayEvent>,
}

impl ProgressBroadcaster {
    /// New broadcaster; slow subscribers lag past `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Push an event to every live subscriber.
    pub fn publish(&self, event: GatewayEvent) {
        if self.tx.send(event).is_err() {
            trace!("no subscribers; event dropped");
        }
    }

    /// New receiver seeing events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self { Self::new(256) }
}
