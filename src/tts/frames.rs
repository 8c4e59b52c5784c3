//! Re-chunking raw PCM into fixed-size frames.

use crate::types::AudioFrame;

/// Splits a PCM16 little-endian byte stream into frames of a fixed size.
///
/// Network chunks rarely align with sample or frame boundaries; leftovers are
/// carried into the next `push`.
#[derive(Debug)]
pub struct AudioByteStream {
    sample_rate: u32,
    num_channels: u16,
    bytes_per_frame: usize,
    buf: Vec<u8>,
}

impl AudioByteStream {
    pub fn new(sample_rate: u32, num_channels: u16, samples_per_channel: u32) -> Self {
        let bytes_per_frame = samples_per_channel.max(1) as usize * num_channels.max(1) as usize * 2;
        Self {
            sample_rate,
            num_channels: num_channels.max(1),
            bytes_per_frame,
            buf: Vec::with_capacity(bytes_per_frame),
        }
    }

    /// 50 ms frames.
    pub fn with_default_frame_size(sample_rate: u32, num_channels: u16) -> Self {
        Self::new(sample_rate, num_channels, sample_rate / 20)
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<AudioFrame> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        while self.buf.len() >= self.bytes_per_frame {
            let chunk: Vec<u8> = self.buf.drain(..self.bytes_per_frame).collect();
            frames.push(AudioFrame::from_pcm16_le(
                &chunk,
                self.sample_rate,
                self.num_channels,
            ));
        }
        frames
    }

    /// Emit whatever whole samples remain as a final, shorter frame.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        let sample_bytes = 2 * self.num_channels as usize;
        let usable = self.buf.len() - self.buf.len() % sample_bytes;
        let tail = std::mem::take(&mut self.buf);
        if usable == 0 {
            return None;
        }
        Some(AudioFrame::from_pcm16_le(
            &tail[..usable],
            self.sample_rate,
            self.num_channels,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_partial_samples_across_pushes() {
        let mut stream = AudioByteStream::new(8_000, 1, 2);
        assert!(stream.push(&[1, 0, 2]).is_empty());
        let frames = stream.push(&[0, 3, 0, 4, 0, 5]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, vec![1, 2]);
        assert_eq!(frames[1].data, vec![3, 4]);
        assert_eq!(frames[1].samples_per_channel, 2);
    }

    #[test]
    fn flush_emits_short_tail_and_drops_odd_byte() {
        let mut stream = AudioByteStream::new(8_000, 1, 4);
        assert!(stream.push(&[7, 0, 9]).is_empty());
        let tail = stream.flush().unwrap();
        assert_eq!(tail.data, vec![7]);
        assert!(stream.flush().is_none());
    }

    #[test]
    fn default_frame_is_fifty_milliseconds() {
        let mut stream = AudioByteStream::with_default_frame_size(24_000, 1);
        let frames = stream.push(&vec![0u8; 2_400 * 2]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples_per_channel, 1_200);
    }
}
