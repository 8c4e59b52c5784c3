//! One user-utterance to assistant-audio cycle.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ParleyError;
use crate::tts::SynthesisInput;
use crate::types::{AudioFrame, Usage};

/// Per-session, monotonically increasing turn number.
pub type TurnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// Model reply to a transcript.
    Reply,
    /// Scripted speech; no model request.
    Say,
}

/// Progress reported by a turn's tasks, tagged with the turn it belongs to.
#[derive(Debug)]
pub(crate) struct TurnSignal {
    pub turn_id: TurnId,
    pub event: TurnEvent,
}

#[derive(Debug)]
pub(crate) enum TurnEvent {
    LlmToken(String),
    LlmComplete(Option<Usage>),
    AudioFrame(AudioFrame),
    TtsComplete,
    Failed(ParleyError),
}

/// The in-flight turn. Dropping it cancels its tasks.
pub(crate) struct Turn {
    pub id: TurnId,
    pub kind: TurnKind,
    pub input: String,
    pub response: String,
    pub llm_done: bool,
    pub tts_done: bool,
    /// Streaming-mode TTS input, opened on the first non-blank token.
    pub tts_input: Option<SynthesisInput>,
    pub frames_played: usize,
    /// Synthesis is over but queued audio is still playing.
    pub playout_pending: bool,
    pub usage: Option<Usage>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Turn {
    pub fn new(id: TurnId, kind: TurnKind, input: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            input: input.into(),
            response: String::new(),
            llm_done: false,
            tts_done: false,
            tts_input: None,
            frames_played: 0,
            playout_pending: false,
            usage: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// The reply has been generated, synthesized and heard.
    pub fn is_finished(&self) -> bool {
        self.llm_done && self.tts_done && !self.playout_pending
    }

    /// Run `task` until it finishes or the turn is dropped.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = task => {}
            }
        }));
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_turn_cancels_its_tasks() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let mut turn = Turn::new(1, TurnKind::Reply, "hi");
        turn.spawn(async move {
            std::future::pending::<()>().await;
            let _ = tx.send(());
        });
        drop(turn);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn finished_needs_both_halves_and_drained_playout() {
        let mut turn = Turn::new(1, TurnKind::Reply, "hi");
        turn.llm_done = true;
        assert!(!turn.is_finished());
        turn.tts_done = true;
        turn.playout_pending = true;
        assert!(!turn.is_finished());
        turn.playout_pending = false;
        assert!(turn.is_finished());
    }
}
