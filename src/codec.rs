//! PCM codec
//!
//! Converts between in-process `f32` samples in `[-1.0, 1.0]` and the
//! 16-bit signed little-endian PCM the Gemini APIs speak, and wraps raw
//! byte chunks into playable mono buffers.

/// Sample rate of synthesized and model response speech.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Sample rate of captured microphone audio sent to the live model.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// MIME type attached to every outgoing microphone chunk.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Error produced when a byte chunk cannot become a playable buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("PCM chunk has odd length ({0} bytes)")]
    OddLength(usize),

    #[error("PCM chunk contains no samples")]
    Empty,

    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),
}

/// A decoded mono buffer ready to be handed to an audio output.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Wrap already decoded samples.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Result<Self, DecodeError> {
        if sample_rate == 0 {
            return Err(DecodeError::InvalidSampleRate(sample_rate));
        }
        if samples.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(Self {
            samples,
            sample_rate,
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Encode float samples as 16-bit little-endian PCM.
///
/// Samples are clamped to `[-1, 1]` first, so the output is always exactly
/// `2 * samples.len()` bytes.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
    }
    bytes
}

/// Interpret `bytes` as little-endian `i16` samples.
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<i16>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// Decode a raw PCM chunk into a mono buffer tagged with `sample_rate`.
pub fn decode_to_playable_buffer(bytes: &[u8], sample_rate: u32) -> Result<AudioBuffer, DecodeError> {
    let samples = decode_samples(bytes)?;
    AudioBuffer::new(samples_to_f32(&samples), sample_rate)
}

pub fn samples_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

fn f32_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let scaled = (sample.clamp(-1.0, 1.0) * 32768.0).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_encode_length_and_layout() {
        let bytes = encode(&[0.0, 1.0, -1.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[0..2], &0i16.to_le_bytes());
        assert_eq!(&bytes[2..4], &i16::MAX.to_le_bytes());
        assert_eq!(&bytes[4..6], &i16::MIN.to_le_bytes());
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let bytes = encode(&[4.0, -7.5]);
        let samples = decode_samples(&bytes).unwrap();
        assert_eq!(samples, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_round_trip_within_one_step() {
        let mut rng = rand::rng();
        let input: Vec<f32> = (0..2048).map(|_| rng.random_range(-1.0f32..=1.0)).collect();

        let buffer = decode_to_playable_buffer(&encode(&input), OUTPUT_SAMPLE_RATE).unwrap();
        assert_eq!(buffer.len(), input.len());
        for (original, decoded) in input.iter().zip(buffer.samples()) {
            assert!(
                (original - decoded).abs() <= 1.0 / 32768.0,
                "{original} decoded as {decoded}"
            );
        }
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        assert_eq!(
            decode_to_playable_buffer(&[1, 2, 3], OUTPUT_SAMPLE_RATE),
            Err(DecodeError::OddLength(3))
        );
    }

    #[test]
    fn test_decode_rejects_empty_chunk() {
        assert_eq!(
            decode_to_playable_buffer(&[], OUTPUT_SAMPLE_RATE),
            Err(DecodeError::Empty)
        );
    }

    #[test]
    fn test_duration_follows_sample_rate() {
        let bytes = vec![0u8; 24_000 * 2];
        let buffer = decode_to_playable_buffer(&bytes, OUTPUT_SAMPLE_RATE).unwrap();
        assert!((buffer.duration() - 1.0).abs() < f64::EPSILON);

        let buffer = decode_to_playable_buffer(&bytes, INPUT_SAMPLE_RATE).unwrap();
        assert!((buffer.duration() - 1.5).abs() < f64::EPSILON);
    }
}
