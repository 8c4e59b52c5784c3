//! Shared test helpers: scripted model and speech clients, and a session harness.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use parley::error::ParleyError;
use parley::provider::{ModelProvider, ProviderRequest, TextDeltaStream};
use parley::session::{
    Session, SessionEvent, SessionEventPayload, SessionSettings, SessionSummary,
};
use parley::transport::{ChannelTransport, ChannelTransportHandle, PlaybackEvent, PlayoutMode};
use parley::tts::{
    AudioFrameStream, SpeechSynthesizer, SynthesisCommand, SynthesisInput, SynthesisStream,
    TtsCapabilities,
};
use parley::types::{AudioFrame, ChatMessage, FinishReason, TextStreamDelta, Usage};

/// What the mock model does for one request.
#[derive(Debug, Clone)]
pub enum LlmScript {
    Tokens(Vec<&'static str>),
    /// Tokens with a pause before each one.
    Slow(Vec<&'static str>, Duration),
    /// Tokens, then the stream stays open forever.
    TokensThenHang(Vec<&'static str>),
    /// Never produces anything.
    Hang,
    /// The request is rejected before streaming starts.
    Fail(&'static str),
}

/// A model provider that plays back queued scripts and records requests.
pub struct MockLlm {
    scripts: Mutex<VecDeque<LlmScript>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl MockLlm {
    pub fn new(scripts: Vec<LlmScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> Vec<ChatMessage> {
        self.requests.lock().unwrap()[index].messages.clone()
    }
}

/// Usage the mock reports: a fixed prompt size and one token per piece.
pub fn mock_usage(pieces: usize) -> Usage {
    let output_tokens = pieces as u32;
    Usage {
        input_tokens: 10,
        output_tokens,
        total_tokens: 10 + output_tokens,
    }
}

fn deltas(tokens: Vec<&'static str>) -> Vec<Result<TextStreamDelta, ParleyError>> {
    let usage = mock_usage(tokens.len());
    tokens
        .into_iter()
        .map(|token| Ok(TextStreamDelta::text(token)))
        .chain(std::iter::once(Ok(TextStreamDelta::done(
            FinishReason::Stop,
            Some(usage),
        ))))
        .collect()
}

#[async_trait]
impl ModelProvider for MockLlm {
    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }

    async fn stream_text(&self, request: &ProviderRequest) -> Result<TextDeltaStream, ParleyError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(LlmScript::Tokens(vec!["Mock ", "response."]));

        Ok(match script {
            LlmScript::Tokens(tokens) => stream::iter(deltas(tokens)).boxed(),
            LlmScript::Slow(tokens, pause) => stream::iter(deltas(tokens))
                .then(move |delta| async move {
                    tokio::time::sleep(pause).await;
                    delta
                })
                .boxed(),
            LlmScript::TokensThenHang(tokens) => stream::iter(
                tokens
                    .into_iter()
                    .map(|token| Ok(TextStreamDelta::text(token)))
                    .collect::<Vec<_>>(),
            )
            .chain(stream::pending())
            .boxed(),
            LlmScript::Hang => stream::pending::<Result<TextStreamDelta, ParleyError>>().boxed(),
            LlmScript::Fail(message) => {
                return Err(ParleyError::Provider {
                    provider: "mock".into(),
                    message: message.into(),
                })
            }
        })
    }
}

/// A synthesizer that emits one numbered frame per text piece.
///
/// Frame payloads are a global counter, so playback order is checkable.
pub struct MockTts {
    streaming: bool,
    fail: bool,
    record: Arc<TtsRecord>,
}

#[derive(Default)]
struct TtsRecord {
    counter: AtomicI16,
    stream_opens: AtomicUsize,
    streamed: Mutex<Vec<String>>,
    full_texts: Mutex<Vec<String>>,
}

impl TtsRecord {
    fn frame(&self) -> AudioFrame {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        AudioFrame::new(vec![n; 4], 24_000, 1)
    }
}

impl MockTts {
    fn build(streaming: bool, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            streaming,
            fail,
            record: Arc::new(TtsRecord::default()),
        })
    }

    pub fn streaming() -> Arc<Self> {
        Self::build(true, false)
    }

    pub fn full_text() -> Arc<Self> {
        Self::build(false, false)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(true, true)
    }

    pub fn stream_opens(&self) -> usize {
        self.record.stream_opens.load(Ordering::SeqCst)
    }

    /// Concatenation of every piece pushed into streaming inputs.
    pub fn streamed_text(&self) -> String {
        self.record.streamed.lock().unwrap().concat()
    }

    pub fn full_texts(&self) -> Vec<String> {
        self.record.full_texts.lock().unwrap().clone()
    }

    fn failure() -> ParleyError {
        ParleyError::Provider {
            provider: "mock-tts".into(),
            message: "synthesis unavailable".into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for MockTts {
    fn provider_name(&self) -> &str {
        "mock-tts"
    }

    fn capabilities(&self) -> TtsCapabilities {
        TtsCapabilities {
            streaming_input: self.streaming,
            sample_rate: 24_000,
            num_channels: 1,
        }
    }

    async fn synthesize(&self, text: &str) -> Result<AudioFrameStream, ParleyError> {
        if self.fail {
            return Err(MockTts::failure());
        }
        self.record.full_texts.lock().unwrap().push(text.to_string());
        let frames: Vec<_> = text
            .split_whitespace()
            .map(|_| Ok(self.record.frame()))
            .collect();
        Ok(stream::iter(frames).boxed())
    }

    async fn stream(&self) -> Result<SynthesisStream, ParleyError> {
        if !self.streaming {
            return Err(ParleyError::UnsupportedOperation("mock".into()));
        }
        self.record.stream_opens.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MockTts::failure());
        }

        let (input, mut commands) = SynthesisInput::channel();
        let (frames_tx, frames_rx) = tokio::sync::mpsc::unbounded_channel();
        let record = Arc::clone(&self.record);
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    SynthesisCommand::Text(text) => {
                        record.streamed.lock().unwrap().push(text);
                        if frames_tx.send(Ok(record.frame())).is_err() {
                            return;
                        }
                    }
                    SynthesisCommand::Flush => {}
                    SynthesisCommand::Finish => return,
                }
            }
        });
        Ok(SynthesisStream::new(
            input,
            UnboundedReceiverStream::new(frames_rx).boxed(),
        ))
    }
}

pub type Events = Arc<Mutex<Vec<SessionEvent>>>;

/// A running session on an in-memory transport.
pub struct Harness {
    pub handle: ChannelTransportHandle,
    pub events: Events,
    pub task: JoinHandle<Result<SessionSummary, ParleyError>>,
}

pub fn quiet_settings() -> SessionSettings {
    SessionSettings {
        system_prompt: "You are a test assistant.".into(),
        greeting: None,
        ..SessionSettings::default()
    }
}

pub fn start(llm: Arc<MockLlm>, tts: Arc<MockTts>, settings: SessionSettings) -> Harness {
    start_with(llm, tts, settings, |session| session)
}

pub fn start_with(
    llm: Arc<MockLlm>,
    tts: Arc<MockTts>,
    settings: SessionSettings,
    configure: impl FnOnce(Session) -> Session,
) -> Harness {
    launch(PlayoutMode::Immediate, llm, tts, settings, configure)
}

/// Like [`start`], but playout only finishes when the test says so.
pub fn start_with_manual_playout(
    llm: Arc<MockLlm>,
    tts: Arc<MockTts>,
    settings: SessionSettings,
) -> Harness {
    launch(PlayoutMode::Manual, llm, tts, settings, |session| session)
}

fn launch(
    playout: PlayoutMode,
    llm: Arc<MockLlm>,
    tts: Arc<MockTts>,
    settings: SessionSettings,
    configure: impl FnOnce(Session) -> Session,
) -> Harness {
    let (transport, handle) = ChannelTransport::with_playout("test-room", playout);
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let session = Session::new(Box::new(transport), llm, tts, settings)
        .with_event_sink(Arc::new(move |event| sink_events.lock().unwrap().push(event)));
    let session = configure(session);
    Harness {
        handle,
        events,
        task: tokio::spawn(session.run()),
    }
}

impl Harness {
    /// Wait until the recorded events satisfy `done`.
    pub async fn wait_for(&self, what: &str, done: impl Fn(&[SessionEventPayload]) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let reached = done(&self.payloads());
                if reached {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}: {:#?}", self.payloads());
    }

    pub async fn wait_for_count(&self, what: &str, n: usize, matches: fn(&SessionEventPayload) -> bool) {
        self.wait_for(what, |events| events.iter().filter(|e| matches(e)).count() >= n)
            .await;
    }

    /// Read playback until the session marks the end of a reply's audio.
    ///
    /// Returns the marker and everything played before it.
    pub async fn next_playout_mark(&mut self) -> (u64, Vec<PlaybackEvent>) {
        let mut seen = Vec::new();
        let marked = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(event) = self.handle.next_playback().await {
                if let PlaybackEvent::PlayoutMarked(marker) = event {
                    return Some(marker);
                }
                seen.push(event);
            }
            None
        })
        .await;
        let marker = marked
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("no playout mark after {seen:#?}"));
        (marker, seen)
    }

    pub fn payloads(&self) -> Vec<SessionEventPayload> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.payload.clone())
            .collect()
    }

    /// Disconnect and collect the summary.
    pub async fn finish(self) -> (SessionSummary, ChannelTransportHandle, Vec<SessionEventPayload>) {
        let _ = self.handle.disconnect("test finished");
        let summary = tokio::time::timeout(Duration::from_secs(3), self.task)
            .await
            .expect("session should end")
            .expect("session task should not panic")
            .expect("session should end cleanly");
        let payloads = self
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.payload.clone())
            .collect();
        (summary, self.handle, payloads)
    }
}

pub fn is_completed(event: &SessionEventPayload) -> bool {
    matches!(event, SessionEventPayload::TurnCompleted { .. })
}

pub fn is_failed(event: &SessionEventPayload) -> bool {
    matches!(event, SessionEventPayload::TurnFailed { .. })
}

pub fn is_interrupted(event: &SessionEventPayload) -> bool {
    matches!(event, SessionEventPayload::TurnInterrupted { .. })
}

pub fn is_started(event: &SessionEventPayload) -> bool {
    matches!(event, SessionEventPayload::TurnStarted { .. })
}

pub fn is_delta(event: &SessionEventPayload) -> bool {
    matches!(event, SessionEventPayload::AssistantDelta { .. })
}

/// Frame payload markers in playback order.
pub fn played_markers(playback: &[PlaybackEvent]) -> Vec<i16> {
    playback
        .iter()
        .filter_map(|event| match event {
            PlaybackEvent::Frame(frame) => frame.data.first().copied(),
            _ => None,
        })
        .collect()
}

/// A turn only starts once the previous one has ended.
pub fn assert_one_active_turn(events: &[SessionEventPayload]) {
    let mut active = false;
    for event in events {
        match event {
            SessionEventPayload::TurnStarted { turn_id, .. } => {
                assert!(!active, "turn {turn_id} started while another was active");
                active = true;
            }
            SessionEventPayload::TurnCompleted { .. }
            | SessionEventPayload::TurnFailed { .. }
            | SessionEventPayload::TurnInterrupted { .. } => active = false,
            _ => {}
        }
    }
}
