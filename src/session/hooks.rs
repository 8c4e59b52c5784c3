//! Hooks run around the model request.

use async_trait::async_trait;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tokio::sync::watch;
use tracing::debug;

use crate::error::ParleyError;
use crate::types::ChatMessage;

const CAMERA_JPEG_QUALITY: u8 = 80;

/// Runs right before each completion request.
///
/// The hook sees the exact messages about to be sent and may append to them,
/// for example the latest camera frame as an image part. On error the request
/// goes out with the messages as they were before the hook ran.
#[async_trait]
pub trait BeforeLlmHook: Send + Sync {
    async fn before_llm(&self, messages: &mut Vec<ChatMessage>) -> Result<(), ParleyError>;
}

/// Appends a fixed image to every request.
pub struct StaticImageHook {
    data: String,
    mime_type: String,
}

impl StaticImageHook {
    /// `data` is base64-encoded image bytes.
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }
}

#[async_trait]
impl BeforeLlmHook for StaticImageHook {
    async fn before_llm(&self, messages: &mut Vec<ChatMessage>) -> Result<(), ParleyError> {
        messages.push(ChatMessage::user_image(
            self.data.clone(),
            self.mime_type.clone(),
        ));
        Ok(())
    }
}

/// One camera frame as packed 8-bit RGB, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSnapshot {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl VideoSnapshot {
    /// Drop the alpha channel of a packed RGBA buffer.
    pub fn from_rgba(width: u32, height: u32, rgba: &[u8]) -> Self {
        let rgb = rgba
            .chunks_exact(4)
            .flat_map(|pixel| [pixel[0], pixel[1], pixel[2]])
            .collect();
        Self { width, height, rgb }
    }

    /// Base64 JPEG, ready for an image content part.
    pub fn to_jpeg_base64(&self) -> Result<String, ParleyError> {
        let expected = self.width as usize * self.height as usize * 3;
        if expected == 0 || self.rgb.len() != expected {
            return Err(ParleyError::InvalidArgument(format!(
                "camera frame is {}x{} but carries {} bytes",
                self.width,
                self.height,
                self.rgb.len()
            )));
        }
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, CAMERA_JPEG_QUALITY)
            .encode(&self.rgb, self.width, self.height, ExtendedColorType::Rgb8)
            .map_err(|e| ParleyError::InvalidArgument(format!("camera frame encoding failed: {e}")))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
    }
}

/// Appends the participant's latest camera frame to every request.
///
/// The transport publishes frames into the watch channel; without a frame
/// the request goes out text-only.
pub struct LatestFrameHook {
    frames: watch::Receiver<Option<VideoSnapshot>>,
}

impl LatestFrameHook {
    pub fn new(frames: watch::Receiver<Option<VideoSnapshot>>) -> Self {
        Self { frames }
    }
}

#[async_trait]
impl BeforeLlmHook for LatestFrameHook {
    async fn before_llm(&self, messages: &mut Vec<ChatMessage>) -> Result<(), ParleyError> {
        let latest = self.frames.borrow().clone();
        let Some(snapshot) = latest else {
            debug!("no camera frame available; sending request without an image");
            return Ok(());
        };
        let (width, height) = (snapshot.width, snapshot.height);
        let data = tokio::task::spawn_blocking(move || snapshot.to_jpeg_base64())
            .await
            .map_err(|e| ParleyError::InvalidState(format!("camera frame encoder stopped: {e}")))??;
        messages.push(ChatMessage::user_image(data, "image/jpeg"));
        debug!(width, height, "added latest camera frame to the request");
        Ok(())
    }
}
