use crate::{Result, VoiceError};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Input frames consumed per resampler pass
const CHUNK_SIZE: usize = 1024;

/// Streaming mono sample-rate converter.
///
/// Device callbacks hand over chunks of arbitrary size; input is buffered until
/// a full resampler chunk is available, so output is continuous across calls.
pub struct AudioResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    pending: Vec<f32>,
}

impl AudioResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(VoiceError::ConfigError(
                "Sample rates must be greater than 0".into(),
            ));
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            2.0,
            params,
            CHUNK_SIZE,
            1,
        )
        .map_err(|e| VoiceError::AudioProcessingError(format!("Failed to create resampler: {}", e)))?;

        debug!("Created resampler: {} Hz -> {} Hz", input_rate, output_rate);

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            pending: Vec::with_capacity(CHUNK_SIZE * 2),
        })
    }

    /// Feed samples and return whatever output is ready
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(input);

        let mut output = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }

            let rest = self.pending.split_off(needed);
            let chunk = std::mem::replace(&mut self.pending, rest);
            let out = self
                .resampler
                .process(&[chunk][..], None)
                .map_err(|e| VoiceError::AudioProcessingError(format!("Resampling failed: {}", e)))?;

            if let Some(channel) = out.into_iter().next() {
                output.extend(channel);
            }
        }

        Ok(output)
    }

    /// Push out whatever input is still buffered, padded through the filter.
    /// Used when the stream pauses so its tail is not held back.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let chunk = std::mem::take(&mut self.pending);
        let expected =
            (chunk.len() as f64 * self.output_rate as f64 / self.input_rate as f64).round() as usize;
        let out = self
            .resampler
            .process_partial(Some(&[chunk][..]), None)
            .map_err(|e| VoiceError::AudioProcessingError(format!("Resampling failed: {}", e)))?;

        let mut samples = out.into_iter().next().unwrap_or_default();
        samples.truncate(expected);
        Ok(samples)
    }

    /// Samples buffered until the next full chunk
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Output samples held back by the filter before the first real sample
    pub fn output_delay(&self) -> usize {
        self.resampler.output_delay()
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Drop buffered input and filter state
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }
}
