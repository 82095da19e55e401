//! Loudness metering for live audio blocks.
//!
//! The level of a block is the mean absolute deviation of its samples from the
//! zero reference of their encoding, divided by the encoding's full-scale value.
//! Each block is measured on its own, so calling the meter at an irregular rate
//! never changes the output scale. Smoothing is off by default; when enabled it
//! is a one-pole exponential filter over successive readings.

/// How raw samples map to the `[0, 1]` level scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleScale {
    /// Unsigned 8-bit centered on 128.
    Unsigned8,
    /// Signed 16-bit PCM centered on 0.
    Pcm16,
    /// Normalized float centered on 0.
    Float,
}

impl SampleScale {
    pub fn zero_reference(self) -> f32 {
        match self {
            SampleScale::Unsigned8 => 128.0,
            SampleScale::Pcm16 | SampleScale::Float => 0.0,
        }
    }

    pub fn full_scale(self) -> f32 {
        match self {
            SampleScale::Unsigned8 => 128.0,
            SampleScale::Pcm16 => 32768.0,
            SampleScale::Float => 1.0,
        }
    }
}

/// Metering options.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeterConfig {
    /// Weight of the previous reading, `0.0` (none) to `1.0` (frozen).
    pub smoothing: f32,
}

/// Computes the mean absolute deviation of a block, normalized and clamped to `[0, 1]`.
///
/// Returns `None` for an empty block.
pub fn block_level<I>(samples: I, scale: SampleScale) -> Option<f32>
where
    I: IntoIterator<Item = f32>,
{
    let zero = scale.zero_reference();
    let (sum, count) = samples
        .into_iter()
        .fold((0.0f64, 0usize), |(sum, count), sample| {
            let deviation = if sample.is_nan() {
                0.0
            } else {
                (sample - zero).abs() as f64
            };
            (sum + deviation, count + 1)
        });
    if count == 0 {
        return None;
    }
    let level = (sum / count as f64) as f32 / scale.full_scale();
    Some(if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    })
}

/// Stateful meter for one channel.
#[derive(Debug, Clone)]
pub struct LevelMeter {
    smoothing: f32,
    level: f32,
}

impl LevelMeter {
    pub fn new(config: MeterConfig) -> Self {
        let smoothing = if config.smoothing.is_nan() {
            0.0
        } else {
            config.smoothing.clamp(0.0, 1.0)
        };
        Self {
            smoothing,
            level: 0.0,
        }
    }

    /// Most recent reading.
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }

    pub fn measure_f32(&mut self, samples: &[f32]) -> f32 {
        self.commit(block_level(samples.iter().copied(), SampleScale::Float))
    }

    pub fn measure_pcm16(&mut self, samples: &[i16]) -> f32 {
        self.commit(block_level(
            samples.iter().map(|&s| s as f32),
            SampleScale::Pcm16,
        ))
    }

    pub fn measure_u8(&mut self, samples: &[u8]) -> f32 {
        self.commit(block_level(
            samples.iter().map(|&s| s as f32),
            SampleScale::Unsigned8,
        ))
    }

    // Empty blocks carry no information and leave the reading untouched.
    fn commit(&mut self, instant: Option<f32>) -> f32 {
        if let Some(instant) = instant {
            self.level = (self.smoothing * self.level + (1.0 - self.smoothing) * instant)
                .clamp(0.0, 1.0);
        }
        self.level
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new(MeterConfig::default())
    }
}
