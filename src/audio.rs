//! # Audio Payload Handling
//!
//! Holds the uploaded audio bytes and decodes them into the mono 32-bit float
//! samples the local Whisper engine consumes.
//!
//! ## Supported inputs:
//! - **WAV containers**: parsed with the `wav` crate (8/16/24-bit PCM and
//!   32-bit float), any channel count (averaged down to mono)
//! - **Raw PCM**: payloads without a RIFF header are treated as 16-bit
//!   little-endian mono at 16kHz, the format the streaming frontend produces
//!
//! ## Sharing:
//! The bytes live behind an `Arc` so a dual-provider job can hand the same
//! payload to two concurrent adapter tasks without copying it.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::sync::Arc;

/// Sample rate Whisper models expect.
pub const WHISPER_SAMPLE_RATE: u32 = 16_000;

/// An uploaded audio payload, cheap to clone.
#[derive(Debug, Clone)]
pub struct AudioPayload {
    data: Arc<Vec<u8>>,
    pub file_name: String,
}

impl AudioPayload {
    pub fn new(bytes: Vec<u8>, file_name: impl Into<String>) -> Self {
        Self {
            data: Arc::new(bytes),
            file_name: file_name.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode into mono f32 samples.
    pub fn decode(&self) -> Result<DecodedAudio, String> {
        if self.data.starts_with(b"RIFF") {
            decode_wav(&self.data)
        } else {
            // No container: assume raw 16-bit mono PCM at the Whisper rate
            let samples = pcm16_to_f32(&self.data)?;
            Ok(DecodedAudio {
                samples,
                sample_rate: WHISPER_SAMPLE_RATE,
            })
        }
    }

    /// Audio duration in seconds, if the payload decodes.
    ///
    /// Used by the cloud adapter, which never needs the samples themselves
    /// but must report the duration for cost computation.
    pub fn probe_duration_seconds(&self) -> Option<f64> {
        self.decode().ok().map(|d| d.duration_seconds())
    }
}

/// Decoded audio ready for inference.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Mono samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Parse a WAV container and mix it down to mono f32.
fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio, String> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor).map_err(|e| format!("Invalid WAV file: {}", e))?;

    let channels = header.channel_count.max(1) as usize;

    // Normalize every supported bit depth to f32 in [-1.0, 1.0]
    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 32768.0)
            .collect(),
        wav::BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    if interleaved.is_empty() {
        return Err("WAV file contains no samples".to_string());
    }

    // Average interleaved channels down to mono
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: header.sampling_rate,
    })
}

/// Convert raw 16-bit little-endian PCM bytes to normalized f32 samples.
fn pcm16_to_f32(data: &[u8]) -> Result<Vec<f32>, String> {
    if data.is_empty() {
        return Err("No audio data provided".to_string());
    }
    if data.len() % 2 != 0 {
        return Err("Audio data length must be even for 16-bit samples".to_string());
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);

    // Read each 16-bit sample (little-endian format)
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an in-memory 16-bit mono WAV for tests.
    fn make_wav(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, sample_rate, 16);
        let mut out = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut out).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_wav_decode_duration() {
        // 2 seconds of silence at 16kHz
        let bytes = make_wav(WHISPER_SAMPLE_RATE, &vec![0i16; 32_000]);
        let payload = AudioPayload::new(bytes, "silence.wav");

        let decoded = payload.decode().unwrap();
        assert_eq!(decoded.sample_rate, WHISPER_SAMPLE_RATE);
        assert_eq!(decoded.samples.len(), 32_000);
        assert!((decoded.duration_seconds() - 2.0).abs() < 1e-9);
        assert_eq!(payload.probe_duration_seconds(), Some(2.0));
    }

    #[test]
    fn test_raw_pcm_decode() {
        // Two samples: 0 and max positive
        let payload = AudioPayload::new(vec![0x00, 0x00, 0xFF, 0x7F], "raw.pcm");
        let decoded = payload.decode().unwrap();
        assert_eq!(decoded.samples.len(), 2);
        assert_eq!(decoded.samples[0], 0.0);
        assert!((decoded.samples[1] - (32767.0 / 32768.0)).abs() < 1e-6);
    }

    #[test]
    fn test_odd_length_pcm_rejected() {
        let payload = AudioPayload::new(vec![0x00, 0x01, 0x02], "bad.pcm");
        assert!(payload.decode().is_err());
    }

    #[test]
    fn test_payload_sharing() {
        let payload = AudioPayload::new(vec![1, 2, 3, 4], "clip.pcm");
        let clone = payload.clone();
        // Both handles see the same bytes without copying
        assert_eq!(payload.bytes().as_ptr(), clone.bytes().as_ptr());
        assert_eq!(clone.size_bytes(), 4);
    }
}
