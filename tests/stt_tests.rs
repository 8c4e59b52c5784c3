//! Deepgram live client against a local WebSocket server.

use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use parley::config::SttSettings;
use parley::error::ParleyError;
use parley::stt::{DeepgramStt, SpeechEvent};
use parley::transport::TransportEvent;
use parley::types::AudioFrame;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{Request, Response},
        Message,
    },
};

#[derive(Debug, Default)]
struct Observation {
    auth: String,
    query: String,
    audio_bytes: usize,
    close_stream_seen: bool,
}

fn settings(url: String) -> SttSettings {
    SttSettings {
        api_key: Some("dg-key".into()),
        url: Some(url),
        ..SttSettings::default()
    }
}

fn results(transcript: &str, is_final: bool, speech_final: bool) -> Value {
    json!({
        "type": "Results",
        "channel_index": [0, 1],
        "duration": 1.2,
        "start": 0.0,
        "is_final": is_final,
        "speech_final": speech_final,
        "channel": {"alternatives": [{"transcript": transcript, "confidence": 0.98, "words": []}]}
    })
}

/// Wait for the first audio frame, send `replies`, then wait for `CloseStream`.
async fn spawn_deepgram_server(replies: Vec<Value>) -> (String, oneshot::Receiver<Observation>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let (observed_tx, observed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let observation = Arc::new(Mutex::new(Observation::default()));
        let capture = Arc::clone(&observation);
        let mut ws = accept_hdr_async(stream, move |req: &Request, response: Response| {
            let mut seen = capture.lock().unwrap();
            seen.auth = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            seen.query = req.uri().query().unwrap_or_default().to_string();
            Ok(response)
        })
        .await
        .unwrap();

        let mut replied = false;
        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Binary(bytes) => {
                    observation.lock().unwrap().audio_bytes += bytes.len();
                    if !replied {
                        replied = true;
                        for reply in &replies {
                            ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                        }
                    }
                }
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == "CloseStream" {
                        observation.lock().unwrap().close_stream_seen = true;
                        let _ = ws.send(Message::Close(None)).await;
                        break;
                    }
                }
                _ => {}
            }
        }

        let observed = std::mem::take(&mut *observation.lock().unwrap());
        let _ = observed_tx.send(observed);
    });

    (format!("ws://{address}/v1/listen"), observed_rx)
}

async fn next_event(stream: &mut parley::stt::SttStream) -> Option<Result<SpeechEvent, ParleyError>> {
    timeout(Duration::from_secs(3), stream.next_event())
        .await
        .expect("recognizer event should arrive")
}

#[tokio::test]
async fn audio_goes_out_and_utterances_come_back() {
    let (url, observed) = spawn_deepgram_server(vec![
        json!({"type": "Metadata", "request_id": "abc"}),
        json!({"type": "SpeechStarted", "channel": [0, 1], "timestamp": 0.2}),
        results("what's the", false, false),
        results("What's the weather?", true, true),
    ])
    .await;

    let stt = DeepgramStt::new(&settings(url)).unwrap();
    let mut stream = stt.connect().await.expect("recognizer should connect");
    stream
        .push_frame(&AudioFrame::new(vec![0; 160], 16_000, 1))
        .unwrap();

    assert_eq!(next_event(&mut stream).await.unwrap().unwrap(), SpeechEvent::StartOfSpeech);
    assert_eq!(
        next_event(&mut stream).await.unwrap().unwrap(),
        SpeechEvent::InterimTranscript("what's the".into())
    );
    let last = next_event(&mut stream).await.unwrap().unwrap();
    assert_eq!(last, SpeechEvent::FinalTranscript("What's the weather?".into()));
    assert_eq!(
        TransportEvent::from(last),
        TransportEvent::UtteranceFinalized {
            text: "What's the weather?".into()
        }
    );

    stream.close();
    assert!(next_event(&mut stream).await.is_none());

    let observed = timeout(Duration::from_secs(3), observed).await.unwrap().unwrap();
    assert_eq!(observed.auth, "Token dg-key");
    assert!(observed.query.contains("model=nova-2-general"));
    assert!(observed.query.contains("encoding=linear16"));
    assert!(observed.query.contains("sample_rate=16000"));
    assert!(observed.query.contains("interim_results=true"));
    assert!(observed.query.contains("endpointing=500"));
    assert_eq!(observed.audio_bytes, 320);
    assert!(observed.close_stream_seen);
}

#[tokio::test]
async fn utterance_end_flushes_final_segments() {
    let (url, _observed) = spawn_deepgram_server(vec![
        results("tell me", true, false),
        results("a story", true, false),
        json!({"type": "UtteranceEnd", "channel": [0, 1], "last_word_end": 2.1}),
    ])
    .await;

    let stt = DeepgramStt::new(&settings(url)).unwrap();
    let mut stream = stt.connect().await.unwrap();
    stream
        .push_frame(&AudioFrame::new(vec![1; 320], 16_000, 1))
        .unwrap();

    assert_eq!(next_event(&mut stream).await.unwrap().unwrap(), SpeechEvent::StartOfSpeech);
    assert_eq!(
        next_event(&mut stream).await.unwrap().unwrap(),
        SpeechEvent::FinalTranscript("tell me a story".into())
    );
    stream.close();
}

#[test]
fn missing_key_is_missing_credential() {
    let err = DeepgramStt::new(&SttSettings::default())
        .err()
        .expect("no key configured");
    assert!(matches!(err, ParleyError::MissingCredential { provider } if provider == "deepgram"));
}

#[tokio::test]
async fn refused_connection_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let stt = DeepgramStt::new(&settings(format!("ws://{address}/v1/listen"))).unwrap();
    assert!(stt.connect().await.is_err());
}
