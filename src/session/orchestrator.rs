//! The session event loop that turns transcripts into spoken replies.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{OverlapPolicy, ParleyConfig};
use crate::error::ParleyError;
use crate::provider::{ModelProvider, ProviderRequest};
use crate::transport::{Transport, TransportEvent};
use crate::tts::{SpeechSynthesizer, SynthesisCommand, SynthesisInput};
use crate::types::{
    AudioFrame, ChatContext, ChatMessage, GenerationSettings, StreamEventType, Usage,
};
use crate::util::timeout::with_timeout;

use super::events::{SessionEventEmitter, SessionEventPayload, SessionEventSink};
use super::hooks::BeforeLlmHook;
use super::turn::{Turn, TurnEvent, TurnId, TurnKind, TurnSignal};

/// Behavior knobs for a [`Session`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub system_prompt: String,
    pub greeting: Option<String>,
    pub overlap_policy: OverlapPolicy,
    pub interrupt_min_words: usize,
    pub llm_timeout: Duration,
    pub tts_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&ParleyConfig::default())
    }
}

impl SessionSettings {
    pub fn from_config(config: &ParleyConfig) -> Self {
        Self {
            system_prompt: config.agent.system_prompt.clone(),
            greeting: config.agent.greeting.clone(),
            overlap_policy: config.agent.overlap_policy,
            interrupt_min_words: config.agent.interrupt_min_words,
            llm_timeout: Duration::from_millis(config.llm.timeout_ms),
            tts_timeout: Duration::from_millis(config.tts.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Responding,
}

/// What a finished session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub turns_completed: usize,
    pub turns_interrupted: usize,
    pub turns_failed: usize,
    /// Token usage summed over completed turns, as reported by the model.
    pub usage: Usage,
    pub end_reason: String,
}

enum LoopInput {
    Shutdown,
    Turn(TurnSignal),
    Transport(TransportEvent),
}

/// One connected voice conversation.
///
/// Owns the transport and the model and speech clients. At most one turn is
/// active; signals from turns that are no longer active are discarded.
pub struct Session {
    id: Uuid,
    transport: Box<dyn Transport>,
    llm: Arc<dyn ModelProvider>,
    tts: Arc<dyn SpeechSynthesizer>,
    settings: SessionSettings,
    generation: GenerationSettings,
    hook: Option<Arc<dyn BeforeLlmHook>>,
    context: ChatContext,
    active: Option<Turn>,
    queue: VecDeque<String>,
    next_turn_id: TurnId,
    signals_tx: mpsc::UnboundedSender<TurnSignal>,
    signals_rx: mpsc::UnboundedReceiver<TurnSignal>,
    events: SessionEventEmitter,
    shutdown: CancellationToken,
    summary: SessionSummary,
}

impl Session {
    pub fn new(
        transport: Box<dyn Transport>,
        llm: Arc<dyn ModelProvider>,
        tts: Arc<dyn SpeechSynthesizer>,
        settings: SessionSettings,
    ) -> Self {
        let id = Uuid::new_v4();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            id,
            transport,
            llm,
            tts,
            context: ChatContext::with_system_prompt(settings.system_prompt.clone()),
            settings,
            generation: GenerationSettings::default(),
            hook: None,
            active: None,
            queue: VecDeque::new(),
            next_turn_id: 1,
            signals_tx,
            signals_rx,
            events: SessionEventEmitter::new(id),
            shutdown: CancellationToken::new(),
            summary: SessionSummary {
                session_id: id,
                turns_completed: 0,
                turns_interrupted: 0,
                turns_failed: 0,
                usage: Usage::default(),
                end_reason: String::new(),
            },
        }
    }

    pub fn with_event_sink(mut self, sink: SessionEventSink) -> Self {
        self.events.set_sink(sink);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn BeforeLlmHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_generation_settings(mut self, settings: GenerationSettings) -> Self {
        self.generation = settings;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn room_name(&self) -> &str {
        self.transport.room_name()
    }

    pub fn state(&self) -> SessionState {
        if self.active.is_some() {
            SessionState::Responding
        } else {
            SessionState::Idle
        }
    }

    pub fn context(&self) -> &ChatContext {
        &self.context
    }

    /// Cancelling this token ends [`run`](Session::run).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Drive the conversation until the transport disconnects or shutdown is requested.
    ///
    /// Turn failures are absorbed; transport failures end the session with an error.
    pub async fn run(mut self) -> Result<SessionSummary, ParleyError> {
        info!(session_id = %self.id, room = %self.room_name(), "session started");
        self.events.emit(SessionEventPayload::SessionStarted {
            room: self.room_name().to_string(),
        });

        if let Some(greeting) = self.settings.greeting.clone() {
            self.say(greeting).await?;
        }

        let outcome = self.event_loop().await;

        // Cancels whatever is still in flight.
        self.active = None;
        if let Err(error) = self.transport.close().await {
            warn!(session_id = %self.id, %error, "transport close failed");
        }

        let reason = match &outcome {
            Ok(reason) => reason.clone(),
            Err(error) => error.to_string(),
        };
        info!(session_id = %self.id, %reason, "session ended");
        self.events.emit(SessionEventPayload::SessionEnded {
            reason: reason.clone(),
        });

        outcome.map(|_| {
            self.summary.end_reason = reason;
            self.summary.clone()
        })
    }

    async fn event_loop(&mut self) -> Result<String, ParleyError> {
        loop {
            let input = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => LoopInput::Shutdown,
                Some(signal) = self.signals_rx.recv() => LoopInput::Turn(signal),
                event = self.transport.recv() => LoopInput::Transport(event),
            };

            match input {
                LoopInput::Shutdown => return Ok("shutdown requested".to_string()),
                LoopInput::Turn(signal) => self.handle_signal(signal).await?,
                LoopInput::Transport(event) => match event {
                    TransportEvent::UtteranceFinalized { text } => {
                        self.on_user_utterance_finalized(&text).await?
                    }
                    TransportEvent::UserSpeechStarted => self.on_user_speech_started().await?,
                    TransportEvent::InterimTranscript { text } => {
                        self.on_interim_transcript(&text).await?
                    }
                    TransportEvent::PlayoutFinished { marker } => {
                        self.on_playout_finished(marker).await?
                    }
                    TransportEvent::Disconnected { reason } => return Ok(reason),
                },
            }
        }
    }

    async fn handle_signal(&mut self, signal: TurnSignal) -> Result<(), ParleyError> {
        let TurnSignal { turn_id, event } = signal;
        if self.active.as_ref().map(|turn| turn.id) != Some(turn_id) {
            debug!(session_id = %self.id, turn_id, "dropping signal from stale turn");
            return Ok(());
        }
        match event {
            TurnEvent::LlmToken(token) => {
                self.on_llm_token_received(token);
                Ok(())
            }
            TurnEvent::LlmComplete(usage) => self.on_llm_response_complete(usage).await,
            TurnEvent::AudioFrame(frame) => self.on_tts_audio_frame(frame).await,
            TurnEvent::TtsComplete => self.on_tts_stream_complete().await,
            TurnEvent::Failed(error) => self.on_turn_failed(error).await,
        }
    }

    /// A finalized transcript arrived from the recognizer.
    pub async fn on_user_utterance_finalized(&mut self, text: &str) -> Result<(), ParleyError> {
        let text = text.trim();
        if text.is_empty() {
            debug!(session_id = %self.id, "ignoring empty transcript");
            return Ok(());
        }

        if self.active.is_some() {
            match self.settings.overlap_policy {
                OverlapPolicy::Interrupt => self.interrupt("new utterance").await?,
                OverlapPolicy::Queue => {
                    self.queue.push_back(text.to_string());
                    debug!(session_id = %self.id, queued = self.queue.len(), "utterance queued");
                    self.events.emit(SessionEventPayload::TurnQueued {
                        text: text.to_string(),
                        queue_len: self.queue.len(),
                    });
                    return Ok(());
                }
            }
        }

        self.begin_reply(text.to_string());
        Ok(())
    }

    /// Speak `text` without asking the model. Cancels the active turn.
    pub async fn say(&mut self, text: impl Into<String>) -> Result<(), ParleyError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Ok(());
        }
        if self.active.is_some() {
            self.interrupt("scripted speech").await?;
        }

        let text = text.trim().to_string();
        let mut turn = self.new_turn(TurnKind::Say, text.clone());
        turn.llm_done = true;
        turn.response = text.clone();
        self.context.push(ChatMessage::assistant(text.clone()));

        info!(session_id = %self.id, turn_id = turn.id, "saying scripted text");
        self.events.emit(SessionEventPayload::TurnStarted {
            turn_id: turn.id,
            kind: TurnKind::Say,
            input: text.clone(),
        });
        self.start_full_text_tts(&mut turn, text);
        self.active = Some(turn);
        Ok(())
    }

    fn begin_reply(&mut self, text: String) {
        self.context.push(ChatMessage::user(text.clone()));
        let mut turn = self.new_turn(TurnKind::Reply, text.clone());

        info!(session_id = %self.id, turn_id = turn.id, transcript = %text, "turn started");
        self.events.emit(SessionEventPayload::TurnStarted {
            turn_id: turn.id,
            kind: TurnKind::Reply,
            input: text,
        });

        turn.spawn(run_llm(
            turn.id,
            Arc::clone(&self.llm),
            self.hook.clone(),
            ProviderRequest::new(self.context.messages().to_vec())
                .with_settings(self.generation.clone()),
            self.settings.llm_timeout,
            self.signals_tx.clone(),
        ));
        self.active = Some(turn);
    }

    fn new_turn(&mut self, kind: TurnKind, input: String) -> Turn {
        let id = self.next_turn_id;
        self.next_turn_id += 1;
        Turn::new(id, kind, input)
    }

    fn on_llm_token_received(&mut self, token: String) {
        let streaming = self.tts.capabilities().streaming_input;
        let tts = Arc::clone(&self.tts);
        let tts_timeout = self.settings.tts_timeout;
        let signals = self.signals_tx.clone();
        let Some(turn) = self.active.as_mut() else {
            return;
        };

        turn.response.push_str(&token);
        self.events.emit(SessionEventPayload::AssistantDelta {
            turn_id: turn.id,
            text: token.clone(),
        });

        if !streaming {
            return;
        }
        match &turn.tts_input {
            Some(input) => {
                // A closed input means the TTS task failed; its error signal follows.
                let _ = input.push_text(token);
            }
            None if !turn.response.trim().is_empty() => {
                let (input, commands) = SynthesisInput::channel();
                let _ = input.push_text(turn.response.clone());
                turn.spawn(run_streaming_tts(
                    turn.id,
                    tts,
                    commands,
                    tts_timeout,
                    signals,
                ));
                turn.tts_input = Some(input);
                debug!(session_id = %self.id, turn_id = turn.id, "streaming synthesis opened");
                self.events.emit(SessionEventPayload::TtsStarted {
                    turn_id: turn.id,
                    streaming: true,
                });
            }
            None => {}
        }
    }

    async fn on_llm_response_complete(&mut self, usage: Option<Usage>) -> Result<(), ParleyError> {
        let Some(mut turn) = self.active.take() else {
            return Ok(());
        };
        turn.llm_done = true;
        turn.usage = usage;

        let response = turn.response.trim().to_string();
        debug!(session_id = %self.id, turn_id = turn.id, chars = response.len(), "model response complete");
        if response.is_empty() {
            turn.tts_done = true;
        } else {
            self.context.push(ChatMessage::assistant(response.clone()));
            match &turn.tts_input {
                Some(input) => {
                    let _ = input.finish();
                }
                None => self.start_full_text_tts(&mut turn, response),
            }
        }

        self.active = Some(turn);
        self.finish_if_done().await
    }

    async fn on_tts_audio_frame(&mut self, frame: AudioFrame) -> Result<(), ParleyError> {
        let Some(turn) = self.active.as_mut() else {
            return Ok(());
        };
        turn.frames_played += 1;
        self.transport.play(frame).await
    }

    /// Synthesis is over. The turn stays active until its audio has played out.
    async fn on_tts_stream_complete(&mut self) -> Result<(), ParleyError> {
        let Some(turn) = self.active.as_mut() else {
            return Ok(());
        };
        turn.tts_done = true;
        if turn.frames_played > 0 && !turn.playout_pending {
            turn.playout_pending = true;
            let marker = turn.id;
            debug!(session_id = %self.id, turn_id = marker, "waiting for playout");
            self.transport.mark_playout_end(marker).await?;
        }
        self.finish_if_done().await
    }

    async fn on_playout_finished(&mut self, marker: u64) -> Result<(), ParleyError> {
        match self.active.as_mut() {
            Some(turn) if turn.id == marker => turn.playout_pending = false,
            _ => {
                debug!(session_id = %self.id, marker, "ignoring playout mark from stale turn");
                return Ok(());
            }
        }
        self.finish_if_done().await
    }

    async fn on_turn_failed(&mut self, error: ParleyError) -> Result<(), ParleyError> {
        let Some(turn) = self.active.take() else {
            return Ok(());
        };
        warn!(
            session_id = %self.id,
            turn_id = turn.id,
            category = ?error.category(),
            %error,
            "turn failed"
        );
        self.summary.turns_failed += 1;
        self.events.emit(SessionEventPayload::TurnFailed {
            turn_id: turn.id,
            error: error.to_string(),
        });
        drop(turn);
        self.transport.clear_playback().await?;
        self.start_next_queued();
        Ok(())
    }

    async fn on_user_speech_started(&mut self) -> Result<(), ParleyError> {
        if self.settings.interrupt_min_words == 0 {
            self.barge_in("user started speaking").await?;
        }
        Ok(())
    }

    async fn on_interim_transcript(&mut self, text: &str) -> Result<(), ParleyError> {
        let words = text.split_whitespace().count();
        if words > 0 && words >= self.settings.interrupt_min_words {
            self.barge_in("interim transcript").await?;
        }
        Ok(())
    }

    async fn barge_in(&mut self, reason: &str) -> Result<(), ParleyError> {
        if self.settings.overlap_policy == OverlapPolicy::Interrupt && self.active.is_some() {
            self.interrupt(reason).await?;
        }
        Ok(())
    }

    /// Cancel the active turn and silence its audio. A partial reply stays in the context.
    async fn interrupt(&mut self, reason: &str) -> Result<(), ParleyError> {
        let Some(turn) = self.active.take() else {
            return Ok(());
        };
        let partial = turn.response.trim().to_string();
        if turn.kind == TurnKind::Reply && !turn.llm_done && !partial.is_empty() {
            self.context.push(ChatMessage::assistant(partial.clone()));
        }

        info!(
            session_id = %self.id,
            turn_id = turn.id,
            reason,
            input = %turn.input,
            frames = turn.frames_played,
            "turn interrupted"
        );
        self.summary.turns_interrupted += 1;
        self.events.emit(SessionEventPayload::TurnInterrupted {
            turn_id: turn.id,
            partial,
        });
        drop(turn);
        self.transport.clear_playback().await
    }

    async fn finish_if_done(&mut self) -> Result<(), ParleyError> {
        if !self.active.as_ref().is_some_and(Turn::is_finished) {
            return Ok(());
        }
        if let Some(turn) = self.active.take() {
            let usage = turn.usage.clone();
            info!(
                session_id = %self.id,
                turn_id = turn.id,
                frames = turn.frames_played,
                input_tokens = usage.as_ref().map(|u| u.input_tokens),
                output_tokens = usage.as_ref().map(|u| u.output_tokens),
                "turn completed"
            );
            self.summary.turns_completed += 1;
            if let Some(usage) = &usage {
                self.summary.usage.merge(usage);
            }
            self.events.emit(SessionEventPayload::TurnCompleted {
                turn_id: turn.id,
                response: turn.response.trim().to_string(),
                frames: turn.frames_played,
                usage,
            });
        }
        self.start_next_queued();
        Ok(())
    }

    fn start_next_queued(&mut self) {
        if self.active.is_none() {
            if let Some(text) = self.queue.pop_front() {
                self.begin_reply(text);
            }
        }
    }

    fn start_full_text_tts(&self, turn: &mut Turn, text: String) {
        self.events.emit(SessionEventPayload::TtsStarted {
            turn_id: turn.id,
            streaming: false,
        });
        turn.spawn(run_full_text_tts(
            turn.id,
            Arc::clone(&self.tts),
            text,
            self.settings.tts_timeout,
            self.signals_tx.clone(),
        ));
    }
}

fn send(signals: &mpsc::UnboundedSender<TurnSignal>, turn_id: TurnId, event: TurnEvent) -> bool {
    signals.send(TurnSignal { turn_id, event }).is_ok()
}

async fn run_llm(
    turn_id: TurnId,
    llm: Arc<dyn ModelProvider>,
    hook: Option<Arc<dyn BeforeLlmHook>>,
    mut request: ProviderRequest,
    timeout: Duration,
    signals: mpsc::UnboundedSender<TurnSignal>,
) {
    if let Some(hook) = hook {
        let original = request.messages.clone();
        if let Err(error) = hook.before_llm(&mut request.messages).await {
            warn!(turn_id, %error, "before-llm hook failed; sending request unchanged");
            request.messages = original;
        }
    }

    let result = with_timeout(timeout, async {
        let mut stream = llm.stream_text(&request).await?;
        let mut usage = None;
        while let Some(delta) = stream.next().await {
            let delta = delta?;
            match delta.event_type {
                StreamEventType::TextDelta if !delta.text.is_empty() => {
                    if !send(&signals, turn_id, TurnEvent::LlmToken(delta.text)) {
                        return Ok(None);
                    }
                }
                StreamEventType::TextDelta => {}
                StreamEventType::Done => {
                    usage = delta.usage;
                    break;
                }
                StreamEventType::Error => {
                    return Err(ParleyError::Stream(if delta.text.is_empty() {
                        "model stream error".to_string()
                    } else {
                        delta.text
                    }));
                }
            }
        }
        Ok(usage)
    })
    .await;

    let event = match result {
        Ok(usage) => TurnEvent::LlmComplete(usage),
        Err(error) => TurnEvent::Failed(error),
    };
    send(&signals, turn_id, event);
}

async fn run_streaming_tts(
    turn_id: TurnId,
    tts: Arc<dyn SpeechSynthesizer>,
    mut commands: mpsc::UnboundedReceiver<SynthesisCommand>,
    timeout: Duration,
    signals: mpsc::UnboundedSender<TurnSignal>,
) {
    let stream = match with_timeout(timeout, tts.stream()).await {
        Ok(stream) => stream,
        Err(error) => {
            send(&signals, turn_id, TurnEvent::Failed(error));
            return;
        }
    };
    let (input, mut frames) = stream.into_parts();
    let mut commands_open = true;

    loop {
        tokio::select! {
            command = commands.recv(), if commands_open => {
                let forwarded = match command {
                    Some(SynthesisCommand::Text(text)) => input.push_text(text),
                    Some(SynthesisCommand::Flush) => input.flush(),
                    Some(SynthesisCommand::Finish) | None => {
                        commands_open = false;
                        input.finish()
                    }
                };
                if let Err(error) = forwarded {
                    send(&signals, turn_id, TurnEvent::Failed(error));
                    return;
                }
            }
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    if !send(&signals, turn_id, TurnEvent::AudioFrame(frame)) {
                        return;
                    }
                }
                Some(Err(error)) => {
                    send(&signals, turn_id, TurnEvent::Failed(error));
                    return;
                }
                None => {
                    send(&signals, turn_id, TurnEvent::TtsComplete);
                    return;
                }
            },
        }
    }
}

async fn run_full_text_tts(
    turn_id: TurnId,
    tts: Arc<dyn SpeechSynthesizer>,
    text: String,
    timeout: Duration,
    signals: mpsc::UnboundedSender<TurnSignal>,
) {
    let mut frames = match with_timeout(timeout, tts.synthesize(&text)).await {
        Ok(frames) => frames,
        Err(error) => {
            send(&signals, turn_id, TurnEvent::Failed(error));
            return;
        }
    };
    while let Some(frame) = frames.next().await {
        let event = match frame {
            Ok(frame) => TurnEvent::AudioFrame(frame),
            Err(error) => {
                send(&signals, turn_id, TurnEvent::Failed(error));
                return;
            }
        };
        if !send(&signals, turn_id, event) {
            return;
        }
    }
    send(&signals, turn_id, TurnEvent::TtsComplete);
}
