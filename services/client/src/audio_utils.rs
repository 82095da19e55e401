use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::ProtocolDecodeFault;

// Wire formats agreed with the backend: mono PCM16 little-endian in both directions.
pub const BACKEND_INPUT_PCM16_SAMPLE_RATE: u32 = 16_000;
pub const AGENT_OUTPUT_PCM16_SAMPLE_RATE: u32 = 24_000;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: u32,
    out_sampling_rate: u32,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, rubato::ResamplerConstructionError> {
    FastFixedIn::<f32>::new(
        out_sampling_rate as f64 / in_sampling_rate as f64,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
}

/// Resamples an unbounded mono stream delivered in arbitrarily sized blocks.
///
/// The underlying resampler only accepts fixed-size chunks, so leftovers are
/// carried over to the next call. Equal rates pass samples through untouched.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(
        in_sampling_rate: u32,
        out_sampling_rate: u32,
        chunk_size: usize,
    ) -> Result<Self, rubato::ResamplerConstructionError> {
        let inner = if in_sampling_rate == out_sampling_rate {
            None
        } else {
            Some(create_resampler(
                in_sampling_rate,
                out_sampling_rate,
                chunk_size,
            )?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return samples.to_vec();
        };
        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(res) => out.extend_from_slice(&res[0]),
                Err(e) => tracing::warn!("Dropping audio chunk that failed to resample: {}", e),
            }
        }
        out
    }
}

/// Averages interleaved channels down to mono.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Converts normalized samples into the binary PCM16 little-endian wire payload.
pub fn encode_pcm16_le(pcm32: &[f32]) -> Vec<u8> {
    pcm32
        .iter()
        .flat_map(|&sample| {
            let v = (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// Parses a binary PCM16 little-endian payload.
pub fn decode_pcm16_le(bytes: &[u8]) -> Result<Vec<i16>, ProtocolDecodeFault> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolDecodeFault::OddByteCount(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(48000, 16000, 480).is_ok());
        assert!(create_resampler(16000, 24000, 1024).is_ok());
    }

    #[test]
    fn test_stream_resampler_passthrough() {
        let mut resampler = StreamResampler::new(16000, 16000, 256).unwrap();
        assert_eq!(resampler.process(&[0.1, 0.2]), vec![0.1, 0.2]);
    }

    #[test]
    fn test_stream_resampler_buffers_partial_chunks() {
        let mut resampler = StreamResampler::new(48000, 16000, 480).unwrap();
        // Less than one chunk: everything stays pending.
        assert!(resampler.process(&[0.0; 100]).is_empty());

        // Feeding a steady stream should yield roughly a third of the input.
        let mut produced = 0;
        for _ in 0..20 {
            produced += resampler.process(&[0.0; 480]).len();
        }
        let expected = (100 + 20 * 480) / 3;
        assert!(
            produced > expected - 480 && produced <= expected,
            "produced {produced}, expected about {expected}"
        );
    }

    #[test]
    fn test_downmix() {
        assert_eq!(downmix(&[0.5, -0.5, 1.0, 0.0], 2), vec![0.0, 0.5]);
        assert_eq!(downmix(&[0.3, 0.4], 1), vec![0.3, 0.4]);
    }

    #[test]
    fn test_encode_pcm16_le() {
        let bytes = encode_pcm16_le(&[1.0, -1.0, 0.0, 2.0]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), 0);
        // Out-of-range input is clamped.
        assert_eq!(i16::from_le_bytes([bytes[6], bytes[7]]), i16::MAX);
    }

    #[test]
    fn test_decode_pcm16_le() {
        // 16384 = 0x4000 in little endian is [0x00, 0x40].
        let decoded = decode_pcm16_le(&[0x00, 0x40, 0x00, 0x80]).unwrap();
        assert_eq!(decoded, vec![16384, i16::MIN]);

        let as_f32 = convert_i16_to_f32(&decoded);
        assert_abs_diff_eq!(as_f32[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(as_f32[1], -1.0, epsilon = 0.0001);

        assert!(decode_pcm16_le(&[]).unwrap().is_empty());
        assert!(matches!(
            decode_pcm16_le(&[0x00, 0x40, 0x01]),
            Err(ProtocolDecodeFault::OddByteCount(3))
        ));
    }

    #[test]
    fn test_edge_cases() {
        let bytes = encode_pcm16_le(&[f32::INFINITY, f32::NEG_INFINITY, f32::NAN]);
        let decoded = decode_pcm16_le(&bytes).unwrap();
        assert_eq!(decoded, vec![i16::MAX, i16::MIN, 0]);
    }
}
