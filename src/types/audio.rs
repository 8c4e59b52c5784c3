//! Audio frames exchanged between the synthesizer and the transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A chunk of interleaved signed 16-bit PCM audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFrame {
    pub data: Vec<i16>,
    pub sample_rate: u32,
    pub num_channels: u16,
    pub samples_per_channel: u32,
}

impl AudioFrame {
    /// Build a frame from interleaved samples.
    pub fn new(data: Vec<i16>, sample_rate: u32, num_channels: u16) -> Self {
        let channels = u32::from(num_channels.max(1));
        let samples_per_channel = data.len() as u32 / channels;
        Self {
            data,
            sample_rate,
            num_channels,
            samples_per_channel,
        }
    }

    /// Decode little-endian PCM16 bytes. A trailing odd byte is dropped.
    pub fn from_pcm16_le(bytes: &[u8], sample_rate: u32, num_channels: u16) -> Self {
        let data = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(data, sample_rate, num_channels)
    }

    /// Encode the samples as little-endian PCM16 bytes.
    pub fn to_pcm16_le(&self) -> Vec<u8> {
        self.data.iter().flat_map(|sample| sample.to_le_bytes()).collect()
    }

    /// Playback duration of this frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(f64::from(self.samples_per_channel) / f64::from(self.sample_rate))
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_bytes_decode_little_endian() {
        let frame = AudioFrame::from_pcm16_le(&[0x01, 0x00, 0xff, 0xff, 0x7f], 16_000, 1);
        assert_eq!(frame.data, vec![1, -1]);
        assert_eq!(frame.samples_per_channel, 2);
        assert_eq!(frame.to_pcm16_le(), vec![0x01, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn stereo_frames_count_samples_per_channel() {
        let frame = AudioFrame::new(vec![0; 480], 24_000, 2);
        assert_eq!(frame.samples_per_channel, 240);
        assert_eq!(frame.duration().as_millis(), 10);
    }
}
