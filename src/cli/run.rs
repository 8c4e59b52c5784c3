//! Mode runners behind the `parley` binary.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hound::{SampleFormat, WavSpec, WavWriter};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ParleyConfig;
use crate::error::ParleyError;
use crate::models::LanguageModel;
use crate::provider::create_provider;
use crate::session::{Session, SessionEventPayload, SessionSettings, SessionSummary, TurnKind};
use crate::transport::{ChannelTransport, PlaybackEvent, Transport};
use crate::tts::create_synthesizer;
use crate::types::{AudioFrame, GenerationSettings};

use super::{AgentArgs, Cli, Commands};

/// Dispatch the parsed command line.
pub async fn run(cli: Cli) -> Result<SessionSummary, ParleyError> {
    let config = prepare_config(cli.config.as_deref(), cli.command.agent_args())?;
    match cli.command {
        Commands::Dev(args) | Commands::Start(args) => run_room(config, args.room).await,
        Commands::Console(args) => run_console(config, args.wav).await,
    }
}

/// Load the layered configuration and apply command-line overrides.
pub fn prepare_config(path: Option<&Path>, args: &AgentArgs) -> Result<ParleyConfig, ParleyError> {
    let mut config = ParleyConfig::load(path)?;
    apply_agent_args(&mut config, args)?;
    config.validate()?;
    Ok(config)
}

fn apply_agent_args(config: &mut ParleyConfig, args: &AgentArgs) -> Result<(), ParleyError> {
    if let Some(model) = &args.model {
        config.override_model(model.parse::<LanguageModel>()?);
    }
    if args.no_greeting {
        config.agent.greeting = None;
    }
    Ok(())
}

/// Wire the configured clients around a transport.
pub fn build_session(
    config: &ParleyConfig,
    transport: Box<dyn Transport>,
) -> Result<Session, ParleyError> {
    let llm = create_provider(&config.llm)?;
    let tts = create_synthesizer(&config.tts)?;
    info!(
        llm = %config.llm.model,
        tts = tts.provider_name(),
        streaming_tts = tts.capabilities().streaming_input,
        "clients ready"
    );

    let generation = GenerationSettings::builder()
        .maybe_temperature(config.llm.temperature)
        .maybe_max_tokens(config.llm.max_tokens)
        .build();

    Ok(
        Session::new(transport, llm, tts, SessionSettings::from_config(config))
            .with_generation_settings(generation),
    )
}

/// Join a LiveKit room and converse until the participant leaves or Ctrl-C.
#[cfg(feature = "livekit")]
pub async fn run_room(
    mut config: ParleyConfig,
    room: Option<String>,
) -> Result<SessionSummary, ParleyError> {
    use crate::session::LatestFrameHook;
    use crate::stt::DeepgramStt;
    use crate::transport::LiveKitTransport;

    if room.is_some() {
        config.livekit.room = room;
    }
    let stt = DeepgramStt::new(&config.stt)?;
    let transport =
        LiveKitTransport::connect(&config.livekit, stt, config.tts.sample_rate).await?;
    let camera = LatestFrameHook::new(transport.camera_frames());
    let session = build_session(&config, Box::new(transport))?.with_hook(Arc::new(camera));
    run_until_ctrl_c(session).await
}

#[cfg(not(feature = "livekit"))]
pub async fn run_room(
    _config: ParleyConfig,
    _room: Option<String>,
) -> Result<SessionSummary, ParleyError> {
    Err(ParleyError::Configuration(
        "room modes need a build with the `livekit` feature; use `parley console` instead".into(),
    ))
}

#[cfg_attr(not(feature = "livekit"), allow(dead_code))]
async fn run_until_ctrl_c(session: Session) -> Result<SessionSummary, ParleyError> {
    let shutdown = session.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, leaving room");
            shutdown.cancel();
        }
    });
    session.run().await
}

#[derive(Debug, Clone, Copy, Default)]
struct ConsoleProgress {
    replies_started: usize,
    busy: bool,
}

/// Terminal conversation: stdin lines are utterances, replies are printed.
pub async fn run_console(
    config: ParleyConfig,
    wav: Option<PathBuf>,
) -> Result<SessionSummary, ParleyError> {
    let (transport, mut handle) = ChannelTransport::new("console");
    let (progress_tx, mut progress_rx) = watch::channel(ConsoleProgress::default());

    let session = build_session(&config, Box::new(transport))?.with_event_sink(Arc::new(
        move |event| {
            let mut stdout = std::io::stdout();
            match event.payload {
                SessionEventPayload::TurnStarted { kind, input, .. } => {
                    progress_tx.send_modify(|p| {
                        p.busy = true;
                        if kind == TurnKind::Reply {
                            p.replies_started += 1;
                        }
                    });
                    // Scripted speech never streams deltas.
                    let _ = match kind {
                        TurnKind::Say => write!(stdout, "agent> {input}"),
                        TurnKind::Reply => write!(stdout, "agent> "),
                    };
                }
                SessionEventPayload::AssistantDelta { text, .. } => {
                    let _ = write!(stdout, "{text}");
                }
                SessionEventPayload::TurnCompleted { .. } => {
                    let _ = writeln!(stdout);
                    progress_tx.send_modify(|p| p.busy = false);
                }
                SessionEventPayload::TurnInterrupted { .. } => {
                    let _ = writeln!(stdout, " [interrupted]");
                    progress_tx.send_modify(|p| p.busy = false);
                }
                SessionEventPayload::TurnFailed { error, .. } => {
                    let _ = writeln!(stdout);
                    eprintln!("turn failed: {error}");
                    progress_tx.send_modify(|p| p.busy = false);
                }
                _ => {}
            }
            let _ = stdout.flush();
        },
    ));

    let session_task = tokio::spawn(session.run());
    let mut wav_sink = WavSink::new(wav);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent = 0usize;
    let mut stdin_open = true;
    let mut progress_open = true;
    let mut disconnect_sent = false;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if !line.trim().is_empty() => {
                    sent += 1;
                    handle.utterance(line)?;
                }
                Some(_) => {}
                None => stdin_open = false,
            },
            changed = progress_rx.changed(), if !stdin_open && progress_open => {
                progress_open = changed.is_ok();
            }
            playback = handle.next_playback() => match playback {
                Some(PlaybackEvent::Frame(frame)) => wav_sink.write(&frame)?,
                Some(PlaybackEvent::PlayoutMarked(_) | PlaybackEvent::Cleared) => {}
                Some(PlaybackEvent::Closed) | None => break,
            },
        }

        if !stdin_open && !disconnect_sent {
            let progress = *progress_rx.borrow();
            if progress.replies_started >= sent && !progress.busy {
                // The session may already be gone.
                let _ = handle.disconnect("console input closed");
                disconnect_sent = true;
            }
        }
    }

    wav_sink.finish()?;
    session_task
        .await
        .map_err(|e| ParleyError::InvalidState(format!("session task failed: {e}")))?
}

struct WavSink {
    path: Option<PathBuf>,
    writer: Option<WavWriter<BufWriter<File>>>,
}

impl WavSink {
    fn new(path: Option<PathBuf>) -> Self {
        Self { path, writer: None }
    }

    fn write(&mut self, frame: &AudioFrame) -> Result<(), ParleyError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if self.writer.is_none() {
            let spec = WavSpec {
                channels: frame.num_channels,
                sample_rate: frame.sample_rate,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            };
            self.writer = Some(WavWriter::create(path, spec).map_err(wav_error)?);
            info!(path = %path.display(), "writing agent audio");
        }
        if let Some(writer) = self.writer.as_mut() {
            for &sample in &frame.data {
                writer.write_sample(sample).map_err(wav_error)?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<(), ParleyError> {
        match self.writer {
            Some(writer) => writer.finalize().map_err(wav_error),
            None => {
                if let Some(path) = self.path {
                    warn!(path = %path.display(), "no audio was synthesized; WAV file not written");
                }
                Ok(())
            }
        }
    }
}

fn wav_error(error: hound::Error) -> ParleyError {
    match error {
        hound::Error::IoError(io) => ParleyError::Io(io),
        other => ParleyError::InvalidArgument(format!("WAV output: {other}")),
    }
}
