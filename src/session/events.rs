//! Session event stream types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Usage;

use super::turn::{TurnId, TurnKind};

/// Callback used for streaming session events.
pub type SessionEventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Concrete event payloads emitted by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventPayload {
    SessionStarted {
        room: String,
    },
    TurnStarted {
        turn_id: TurnId,
        kind: TurnKind,
        input: String,
    },
    TurnQueued {
        text: String,
        queue_len: usize,
    },
    AssistantDelta {
        turn_id: TurnId,
        text: String,
    },
    TtsStarted {
        turn_id: TurnId,
        streaming: bool,
    },
    TurnCompleted {
        turn_id: TurnId,
        response: String,
        frames: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    TurnInterrupted {
        turn_id: TurnId,
        partial: String,
    },
    TurnFailed {
        turn_id: TurnId,
        error: String,
    },
    SessionEnded {
        reason: String,
    },
}

/// Envelope for session events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: SessionEventPayload,
}

pub(crate) struct SessionEventEmitter {
    session_id: Uuid,
    seq: AtomicU64,
    sink: Option<SessionEventSink>,
}

impl SessionEventEmitter {
    pub(crate) fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            seq: AtomicU64::new(1),
            sink: None,
        }
    }

    pub(crate) fn set_sink(&mut self, sink: SessionEventSink) {
        self.sink = Some(sink);
    }

    pub(crate) fn emit(&self, payload: SessionEventPayload) {
        let Some(sink) = &self.sink else { return };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        (sink)(SessionEvent {
            session_id: self.session_id,
            seq,
            timestamp: Utc::now(),
            payload,
        });
    }
}
