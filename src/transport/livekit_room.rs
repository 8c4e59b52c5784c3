//! LiveKit room transport: remote microphone to Deepgram, agent audio to a published track.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use livekit::options::TrackPublishOptions;
use livekit::prelude::*;
use livekit::webrtc::audio_frame::AudioFrame as RtcAudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_source::{AudioSourceOptions, RtcAudioSource};
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use livekit::webrtc::video_frame::{BoxVideoBuffer, VideoBuffer, VideoFormatType, VideoFrame};
use livekit::webrtc::video_stream::native::NativeVideoStream;
use livekit_api::access_token::{AccessToken, VideoGrants};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::LiveKitSettings;
use crate::error::ParleyError;
use crate::session::VideoSnapshot;
use crate::stt::{DeepgramStt, SttStream};
use crate::types::AudioFrame;
use crate::util::ws::AbortOnDrop;

use super::{Transport, TransportEvent};

const PLAYOUT_QUEUE_MS: u32 = 1000;
/// Camera frames are converted at most this often.
const CAMERA_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

enum PlayoutItem {
    Frame(AudioFrame),
    Mark(u64),
}

/// A joined LiveKit room with one remote participant.
pub struct LiveKitTransport {
    room: Room,
    room_name: String,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    playout_tx: mpsc::UnboundedSender<(u64, PlayoutItem)>,
    source: NativeAudioSource,
    generation: Arc<AtomicU64>,
    camera: watch::Receiver<Option<VideoSnapshot>>,
    disconnected: Option<String>,
    _input: AbortOnDrop,
    _playout: AbortOnDrop,
}

impl LiveKitTransport {
    /// Join the room, publish the agent track, and wait for a participant's microphone.
    pub async fn connect(
        settings: &LiveKitSettings,
        stt: DeepgramStt,
        output_sample_rate: u32,
    ) -> Result<Self, ParleyError> {
        let url = settings
            .url
            .clone()
            .ok_or_else(|| ParleyError::Configuration("LIVEKIT_URL is not set".into()))?;
        let token = resolve_token(settings)?;

        let (room, mut room_events) = Room::connect(&url, &token, RoomOptions::default())
            .await
            .map_err(|e| ParleyError::Transport(format!("LiveKit connect failed: {e}")))?;
        let room_name = room.name();
        info!(room = %room_name, identity = ?room.local_participant().identity(), "joined room");

        let source = NativeAudioSource::new(
            AudioSourceOptions::default(),
            output_sample_rate,
            1,
            PLAYOUT_QUEUE_MS,
        );
        let track = LocalAudioTrack::create_audio_track(
            "agent-voice",
            RtcAudioSource::Native(source.clone()),
        );
        room.local_participant()
            .publish_track(LocalTrack::Audio(track), TrackPublishOptions::default())
            .await
            .map_err(|e| ParleyError::Transport(format!("publishing agent track failed: {e}")))?;

        let mut early_video = Vec::new();
        let (remote_track, participant) = loop {
            match room_events.recv().await {
                Some(RoomEvent::TrackSubscribed {
                    track: RemoteTrack::Audio(track),
                    participant,
                    ..
                }) => break (track, participant.identity()),
                Some(RoomEvent::TrackSubscribed {
                    track: RemoteTrack::Video(track),
                    participant,
                    ..
                }) => early_video.push((track, participant.identity())),
                Some(RoomEvent::Disconnected { reason }) => {
                    return Err(ParleyError::Transport(format!(
                        "room closed before a participant joined: {reason:?}"
                    )))
                }
                Some(_) => continue,
                None => {
                    return Err(ParleyError::Transport(
                        "room event stream ended before a participant joined".into(),
                    ))
                }
            }
        };
        info!(participant = ?participant, "subscribed to participant microphone");

        let microphone = NativeAudioStream::new(
            remote_track.rtc_track(),
            stt.sample_rate() as i32,
            1,
        );
        let recognizer = stt.connect().await?;

        let (camera_tx, camera) = watch::channel(None);
        let camera_task = early_video
            .into_iter()
            .find(|(_, owner)| *owner == participant)
            .map(|(track, _)| spawn_camera_capture(track, camera_tx.clone()));
        if camera_task.is_none() {
            info!(participant = ?participant, "no camera track yet; requests go out text-only");
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let input = tokio::spawn(run_input_pump(
            room_events,
            microphone,
            recognizer,
            participant,
            events_tx.clone(),
            CameraFeed {
                frames: camera_tx,
                task: camera_task,
            },
        ));

        let generation = Arc::new(AtomicU64::new(0));
        let (playout_tx, playout_rx) = mpsc::unbounded_channel();
        let playout = tokio::spawn(run_playout(
            source.clone(),
            playout_rx,
            Arc::clone(&generation),
            events_tx,
        ));

        Ok(Self {
            room,
            room_name,
            events_rx,
            playout_tx,
            source,
            generation,
            camera,
            disconnected: None,
            _input: AbortOnDrop(input),
            _playout: AbortOnDrop(playout),
        })
    }
}

impl LiveKitTransport {
    /// Latest frame of the participant's camera, if they share one.
    pub fn camera_frames(&self) -> watch::Receiver<Option<VideoSnapshot>> {
        self.camera.clone()
    }

    fn enqueue(&self, item: PlayoutItem) -> Result<(), ParleyError> {
        let generation = self.generation.load(Ordering::SeqCst);
        self.playout_tx
            .send((generation, item))
            .map_err(|_| ParleyError::Transport("playout task stopped".into()))
    }
}

#[async_trait]
impl Transport for LiveKitTransport {
    fn room_name(&self) -> &str {
        &self.room_name
    }

    async fn recv(&mut self) -> TransportEvent {
        if let Some(reason) = &self.disconnected {
            return TransportEvent::Disconnected {
                reason: reason.clone(),
            };
        }
        let event = self
            .events_rx
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::Disconnected {
                reason: "room input closed".into(),
            });
        if let TransportEvent::Disconnected { reason } = &event {
            self.disconnected = Some(reason.clone());
        }
        event
    }

    async fn play(&mut self, frame: AudioFrame) -> Result<(), ParleyError> {
        self.enqueue(PlayoutItem::Frame(frame))
    }

    async fn mark_playout_end(&mut self, marker: u64) -> Result<(), ParleyError> {
        self.enqueue(PlayoutItem::Mark(marker))
    }

    async fn clear_playback(&mut self) -> Result<(), ParleyError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.source.clear_buffer();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ParleyError> {
        self.room
            .close()
            .await
            .map_err(|e| ParleyError::Transport(format!("leaving room failed: {e}")))
    }
}

fn resolve_token(settings: &LiveKitSettings) -> Result<String, ParleyError> {
    if let Some(token) = settings.token.clone() {
        return Ok(token);
    }
    let (Some(key), Some(secret)) = (&settings.api_key, &settings.api_secret) else {
        return Err(ParleyError::MissingCredential {
            provider: "livekit".into(),
        });
    };
    let room = settings
        .room
        .clone()
        .ok_or_else(|| ParleyError::Configuration("LIVEKIT_ROOM or --room is required".into()))?;

    AccessToken::with_api_key(key, secret)
        .with_identity(&settings.identity)
        .with_name(&settings.identity)
        .with_ttl(Duration::from_secs(settings.token_ttl_secs))
        .with_grants(VideoGrants {
            room_join: true,
            room,
            ..Default::default()
        })
        .to_jwt()
        .map_err(|e| ParleyError::Configuration(format!("cannot mint LiveKit token: {e}")))
}

async fn run_input_pump(
    mut room_events: mpsc::UnboundedReceiver<RoomEvent>,
    mut microphone: NativeAudioStream,
    mut recognizer: SttStream,
    participant: ParticipantIdentity,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    mut camera: CameraFeed,
) {
    let reason = loop {
        tokio::select! {
            event = room_events.recv() => match event {
                Some(RoomEvent::ParticipantDisconnected(remote)) if remote.identity() == participant => {
                    break "participant left".to_string();
                }
                Some(RoomEvent::TrackSubscribed {
                    track: RemoteTrack::Video(track),
                    participant: remote,
                    ..
                }) if remote.identity() == participant => {
                    camera.task = Some(spawn_camera_capture(track, camera.frames.clone()));
                }
                Some(RoomEvent::TrackUnsubscribed {
                    track: RemoteTrack::Video(_),
                    participant: remote,
                    ..
                }) if remote.identity() == participant => {
                    info!("participant camera unsubscribed");
                    camera.task = None;
                    camera.frames.send_replace(None);
                }
                Some(RoomEvent::Disconnected { reason }) => break format!("room disconnected: {reason:?}"),
                Some(_) => {}
                None => break "room event stream ended".to_string(),
            },
            frame = microphone.next() => match frame {
                Some(frame) => {
                    if let Err(error) = recognizer.push_frame(&from_rtc_frame(&frame)) {
                        break error.to_string();
                    }
                }
                None => break "participant microphone ended".to_string(),
            },
            speech = recognizer.next_event() => match speech {
                Some(Ok(speech)) => {
                    debug!(?speech, "recognizer event");
                    if events_tx.send(speech.into()).is_err() {
                        return;
                    }
                }
                Some(Err(error)) => break error.to_string(),
                None => break "recognizer closed".to_string(),
            },
        }
    };

    warn!(%reason, "room input ended");
    recognizer.close();
    let _ = events_tx.send(TransportEvent::Disconnected { reason });
}

struct CameraFeed {
    frames: watch::Sender<Option<VideoSnapshot>>,
    task: Option<AbortOnDrop>,
}

fn spawn_camera_capture(
    track: RemoteVideoTrack,
    frames: watch::Sender<Option<VideoSnapshot>>,
) -> AbortOnDrop {
    info!(track = ?track.sid(), "capturing participant camera");
    AbortOnDrop(tokio::spawn(run_camera_capture(track, frames)))
}

/// Keep the newest camera frame, sampled at [`CAMERA_SAMPLE_INTERVAL`].
async fn run_camera_capture(track: RemoteVideoTrack, frames: watch::Sender<Option<VideoSnapshot>>) {
    let mut stream = NativeVideoStream::new(track.rtc_track());
    let mut last_sample: Option<Instant> = None;

    while let Some(frame) = stream.next().await {
        if last_sample.is_some_and(|at| at.elapsed() < CAMERA_SAMPLE_INTERVAL) {
            continue;
        }
        last_sample = Some(Instant::now());
        frames.send_replace(Some(snapshot_from_rtc(&frame)));
    }
    debug!("participant camera stream ended");
}

fn snapshot_from_rtc(frame: &VideoFrame<BoxVideoBuffer>) -> VideoSnapshot {
    let width = frame.buffer.width();
    let height = frame.buffer.height();
    let mut rgba = vec![0u8; width as usize * height as usize * 4];
    // libyuv names formats by word order; ABGR is RGBA in memory.
    frame.buffer.to_argb(
        VideoFormatType::ABGR,
        &mut rgba,
        width * 4,
        width as i32,
        height as i32,
    );
    VideoSnapshot::from_rgba(width, height, &rgba)
}

/// Feeds the agent track in real time. A mark is reported once the audio
/// captured ahead of it should have finished playing.
async fn run_playout(
    source: NativeAudioSource,
    mut items: mpsc::UnboundedReceiver<(u64, PlayoutItem)>,
    generation: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut buffered_until = Instant::now();
    let mut current_generation = 0;

    while let Some((item_generation, item)) = items.recv().await {
        if item_generation < generation.load(Ordering::SeqCst) {
            continue;
        }
        if item_generation != current_generation {
            // The source buffer was cleared.
            current_generation = item_generation;
            buffered_until = Instant::now();
        }
        match item {
            PlayoutItem::Frame(frame) => {
                let duration = frame_duration(&frame);
                let rtc_frame = RtcAudioFrame {
                    data: frame.data.into(),
                    sample_rate: frame.sample_rate,
                    num_channels: u32::from(frame.num_channels),
                    samples_per_channel: frame.samples_per_channel,
                };
                if let Err(error) = source.capture_frame(&rtc_frame).await {
                    warn!(%error, "dropping agent audio frame");
                    continue;
                }
                buffered_until = buffered_until.max(Instant::now()) + duration;
            }
            PlayoutItem::Mark(marker) => {
                tokio::time::sleep_until(buffered_until.into()).await;
                // A clear while waiting discards the mark.
                if item_generation < generation.load(Ordering::SeqCst) {
                    continue;
                }
                debug!(marker, "agent playout finished");
                if events_tx
                    .send(TransportEvent::PlayoutFinished { marker })
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

fn frame_duration(frame: &AudioFrame) -> Duration {
    if frame.sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(f64::from(frame.samples_per_channel) / f64::from(frame.sample_rate))
}

fn from_rtc_frame(frame: &RtcAudioFrame<'_>) -> AudioFrame {
    AudioFrame::new(
        frame.data.to_vec(),
        frame.sample_rate,
        frame.num_channels as u16,
    )
}
