//! In-memory transport driven through a handle.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ParleyError;
use crate::types::AudioFrame;

use super::{Transport, TransportEvent};

/// What the transport was asked to do with audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Frame(AudioFrame),
    /// [`Transport::mark_playout_end`] was called with this marker.
    PlayoutMarked(u64),
    Cleared,
    Closed,
}

/// When a [`ChannelTransport`] reports playout as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayoutMode {
    /// Frames count as played the moment they are queued.
    #[default]
    Immediate,
    /// The peer decides, through [`ChannelTransportHandle::finish_playout`].
    Manual,
}

/// Transport backed by channels; the peer side is a [`ChannelTransportHandle`].
pub struct ChannelTransport {
    room_name: String,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    playback_tx: mpsc::UnboundedSender<PlaybackEvent>,
    playout: PlayoutMode,
    finished_playouts: VecDeque<TransportEvent>,
    disconnected: Option<String>,
}

/// Peer side of a [`ChannelTransport`]: inject user events, observe playback.
#[derive(Debug)]
pub struct ChannelTransportHandle {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
}

impl ChannelTransport {
    pub fn new(room_name: impl Into<String>) -> (Self, ChannelTransportHandle) {
        Self::with_playout(room_name, PlayoutMode::Immediate)
    }

    pub fn with_playout(
        room_name: impl Into<String>,
        playout: PlayoutMode,
    ) -> (Self, ChannelTransportHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        (
            Self {
                room_name: room_name.into(),
                events_rx,
                playback_tx,
                playout,
                finished_playouts: VecDeque::new(),
                disconnected: None,
            },
            ChannelTransportHandle {
                events_tx,
                playback_rx,
            },
        )
    }

    fn emit(&self, event: PlaybackEvent) -> Result<(), ParleyError> {
        self.playback_tx
            .send(event)
            .map_err(|_| ParleyError::Transport("playback receiver dropped".into()))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn room_name(&self) -> &str {
        &self.room_name
    }

    async fn recv(&mut self) -> TransportEvent {
        if let Some(reason) = &self.disconnected {
            return TransportEvent::Disconnected {
                reason: reason.clone(),
            };
        }
        if let Some(event) = self.finished_playouts.pop_front() {
            return event;
        }
        let event = self
            .events_rx
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::Disconnected {
                reason: "peer handle dropped".into(),
            });
        if let TransportEvent::Disconnected { reason } = &event {
            self.disconnected = Some(reason.clone());
        }
        event
    }

    async fn play(&mut self, frame: AudioFrame) -> Result<(), ParleyError> {
        self.emit(PlaybackEvent::Frame(frame))
    }

    async fn mark_playout_end(&mut self, marker: u64) -> Result<(), ParleyError> {
        self.emit(PlaybackEvent::PlayoutMarked(marker))?;
        if self.playout == PlayoutMode::Immediate {
            self.finished_playouts
                .push_back(TransportEvent::PlayoutFinished { marker });
        }
        Ok(())
    }

    async fn clear_playback(&mut self) -> Result<(), ParleyError> {
        self.finished_playouts.clear();
        self.emit(PlaybackEvent::Cleared)
    }

    async fn close(&mut self) -> Result<(), ParleyError> {
        self.events_rx.close();
        // The peer may already be gone when the session closes.
        let _ = self.playback_tx.send(PlaybackEvent::Closed);
        Ok(())
    }
}

impl ChannelTransportHandle {
    pub fn send(&self, event: TransportEvent) -> Result<(), ParleyError> {
        self.events_tx
            .send(event)
            .map_err(|_| ParleyError::Transport("session side closed".into()))
    }

    pub fn utterance(&self, text: impl Into<String>) -> Result<(), ParleyError> {
        self.send(TransportEvent::UtteranceFinalized { text: text.into() })
    }

    pub fn speech_started(&self) -> Result<(), ParleyError> {
        self.send(TransportEvent::UserSpeechStarted)
    }

    pub fn interim(&self, text: impl Into<String>) -> Result<(), ParleyError> {
        self.send(TransportEvent::InterimTranscript { text: text.into() })
    }

    /// Report that audio up to `marker` has been played (manual playout).
    pub fn finish_playout(&self, marker: u64) -> Result<(), ParleyError> {
        self.send(TransportEvent::PlayoutFinished { marker })
    }

    pub fn disconnect(&self, reason: impl Into<String>) -> Result<(), ParleyError> {
        self.send(TransportEvent::Disconnected {
            reason: reason.into(),
        })
    }

    /// Next playback event; `None` once the transport is dropped.
    pub async fn next_playback(&mut self) -> Option<PlaybackEvent> {
        self.playback_rx.recv().await
    }

    /// Everything played so far, without waiting.
    pub fn drain_playback(&mut self) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.playback_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_flow_both_ways() {
        let (mut transport, mut handle) = ChannelTransport::new("test-room");
        assert_eq!(transport.room_name(), "test-room");

        handle.utterance("hello").unwrap();
        assert_eq!(
            transport.recv().await,
            TransportEvent::UtteranceFinalized {
                text: "hello".into()
            }
        );

        let frame = AudioFrame::new(vec![1, 2, 3], 24_000, 1);
        transport.play(frame.clone()).await.unwrap();
        transport.clear_playback().await.unwrap();
        assert_eq!(
            handle.drain_playback(),
            vec![PlaybackEvent::Frame(frame), PlaybackEvent::Cleared]
        );
    }

    #[tokio::test]
    async fn immediate_playout_finishes_on_mark() {
        let (mut transport, mut handle) = ChannelTransport::new("room");
        transport.play(AudioFrame::new(vec![1], 16_000, 1)).await.unwrap();
        transport.mark_playout_end(7).await.unwrap();
        assert_eq!(
            transport.recv().await,
            TransportEvent::PlayoutFinished { marker: 7 }
        );
        assert_eq!(handle.drain_playback().last(), Some(&PlaybackEvent::PlayoutMarked(7)));
    }

    #[tokio::test]
    async fn manual_playout_waits_for_peer_and_clear_drops_marks() {
        let (mut transport, handle) = ChannelTransport::with_playout("room", PlayoutMode::Manual);
        transport.mark_playout_end(1).await.unwrap();
        handle.utterance("first").unwrap();
        assert!(matches!(
            transport.recv().await,
            TransportEvent::UtteranceFinalized { .. }
        ));

        handle.finish_playout(1).unwrap();
        assert_eq!(
            transport.recv().await,
            TransportEvent::PlayoutFinished { marker: 1 }
        );

        let (mut transport, handle) = ChannelTransport::new("room");
        transport.mark_playout_end(2).await.unwrap();
        transport.clear_playback().await.unwrap();
        handle.utterance("after clear").unwrap();
        assert!(matches!(
            transport.recv().await,
            TransportEvent::UtteranceFinalized { .. }
        ));
    }

    #[tokio::test]
    async fn dropped_handle_reads_as_disconnect_forever() {
        let (mut transport, handle) = ChannelTransport::new("room");
        drop(handle);
        for _ in 0..2 {
            assert!(matches!(
                transport.recv().await,
                TransportEvent::Disconnected { .. }
            ));
        }
        assert!(transport.play(AudioFrame::new(vec![0], 16_000, 1)).await.is_err());
    }
}
