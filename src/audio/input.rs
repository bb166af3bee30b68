//! Microphone capture on cpal
//!
//! `cpal::Stream` is not `Send`, so each open capture owns a worker thread that
//! builds the stream, reports readiness and then parks until told to stop.

use super::block_on_device;
use super::capture::{AudioCapture, CaptureConfig, SampleSink};
use super::resampler::AudioResampler;
use crate::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, DefaultStreamConfigError, Device, FromSample, PlayStreamError, Sample,
    SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
use crossbeam_channel::{bounded, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

struct Worker {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// Default input device of the default host
#[derive(Default)]
pub struct CpalCapture {
    worker: Option<Worker>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.worker.is_some()
    }
}

impl AudioCapture for CpalCapture {
    fn open(&mut self, config: &CaptureConfig, sink: SampleSink) -> Result<()> {
        if self.worker.is_some() {
            return Err(VoiceError::CaptureActive);
        }

        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let config = config.clone();

        let thread = thread::Builder::new()
            .name("cpal-capture".into())
            .spawn(move || {
                let stream = match build_capture_stream(&config, sink) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Returns on stop or when the owner is dropped
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Capture stream dropped");
            })
            .map_err(|e| VoiceError::AudioDeviceError(format!("Failed to spawn capture thread: {}", e)))?;

        match block_on_device(|| ready_rx.recv()) {
            Ok(Ok(())) => {
                self.worker = Some(Worker { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = block_on_device(|| thread.join());
                Err(e)
            }
            Err(_) => {
                let _ = block_on_device(|| thread.join());
                Err(VoiceError::AudioDeviceError("Capture thread exited during setup".into()))
            }
        }
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if block_on_device(|| worker.thread.join()).is_err() {
                error!("Capture thread panicked");
            }
            info!("Stopped audio capture");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_capture_stream(config: &CaptureConfig, sink: SampleSink) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".into()))?;

    info!("Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    let (stream_config, format) = select_input_config(&device, config.sample_rate)?;
    let device_rate = stream_config.sample_rate.0;

    // cpal exposes no processing controls; the host audio stack applies its own
    debug!(
        echo_cancellation = config.echo_cancellation,
        noise_suppression = config.noise_suppression,
        auto_gain_control = config.auto_gain_control,
        "Requested capture processing"
    );

    let resampler = if device_rate != config.sample_rate {
        warn!(
            "Input device runs at {} Hz, resampling to {} Hz",
            device_rate, config.sample_rate
        );
        Some(AudioResampler::new(device_rate, config.sample_rate)?)
    } else {
        None
    };

    info!(
        "Building audio input stream: {}Hz, {} channel(s), {:?}",
        device_rate, stream_config.channels, format
    );

    let stream = match format {
        SampleFormat::F32 => build_input::<f32>(&device, &stream_config, sink, resampler),
        SampleFormat::I16 => build_input::<i16>(&device, &stream_config, sink, resampler),
        SampleFormat::U16 => build_input::<u16>(&device, &stream_config, sink, resampler),
        other => Err(VoiceError::AudioDeviceError(format!(
            "Unsupported input sample format: {:?}",
            other
        ))),
    }?;

    stream.play().map_err(map_play_error)?;
    info!("Started audio capture");
    Ok(stream)
}

/// Prefer an f32 configuration at the session rate with the fewest channels,
/// otherwise fall back to the device default.
fn select_input_config(device: &Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    if let Ok(ranges) = device.supported_input_configs() {
        let best = ranges
            .filter(|r| {
                r.sample_format() == SampleFormat::F32
                    && r.min_sample_rate().0 <= sample_rate
                    && sample_rate <= r.max_sample_rate().0
            })
            .min_by_key(|r| r.channels());

        if let Some(range) = best {
            let supported = range.with_sample_rate(SampleRate(sample_rate));
            return Ok((supported.config(), supported.sample_format()));
        }
    }

    let supported = device.default_input_config().map_err(|e| match e {
        DefaultStreamConfigError::DeviceNotAvailable => {
            VoiceError::DeviceUnavailable("Input device is no longer available".into())
        }
        other => classify_backend_error(other.to_string()),
    })?;
    Ok((supported.config(), supported.sample_format()))
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    sink: SampleSink,
    mut resampler: Option<AudioResampler>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;

    let err_fn = |err| {
        error!("Audio input stream error: {}", err);
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);

                let samples = match resampler.as_mut() {
                    Some(r) => match r.process(&mono) {
                        Ok(out) => out,
                        Err(e) => {
                            error!("Capture resampling failed: {}", e);
                            return;
                        }
                    },
                    None => mono,
                };

                if samples.is_empty() {
                    return;
                }
                if sink.send(samples).is_err() {
                    debug!("Capture sink closed, discarding samples");
                }
            },
            err_fn,
            None,
        )
        .map_err(map_build_error)
}

/// Average interleaved frames into mono `f32`
fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    if channels <= 1 {
        data.iter().map(|&s| f32::from_sample(s)).collect()
    } else {
        data.chunks(channels)
            .map(|frame| frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / channels as f32)
            .collect()
    }
}

fn map_build_error(e: BuildStreamError) -> VoiceError {
    match e {
        BuildStreamError::DeviceNotAvailable => {
            VoiceError::DeviceUnavailable("Input device is no longer available".into())
        }
        other => classify_backend_error(other.to_string()),
    }
}

fn map_play_error(e: PlayStreamError) -> VoiceError {
    match e {
        PlayStreamError::DeviceNotAvailable => {
            VoiceError::DeviceUnavailable("Input device is no longer available".into())
        }
        other => classify_backend_error(other.to_string()),
    }
}

/// Hosts report a refused microphone as a backend-specific error string
fn classify_backend_error(message: String) -> VoiceError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        VoiceError::PermissionDenied
    } else {
        VoiceError::AudioDeviceError(format!("Failed to open input stream: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_classify_permission_errors() {
        assert_eq!(
            classify_backend_error("Access denied by user".into()),
            VoiceError::PermissionDenied
        );
        assert_eq!(
            classify_backend_error("Microphone permission missing".into()),
            VoiceError::PermissionDenied
        );
        assert!(matches!(
            classify_backend_error("buffer underrun".into()),
            VoiceError::AudioDeviceError(_)
        ));
    }

    #[test]
    fn test_device_not_available_maps() {
        assert!(matches!(
            map_build_error(BuildStreamError::DeviceNotAvailable),
            VoiceError::DeviceUnavailable(_)
        ));
    }

    #[test]
    fn test_downmix() {
        assert_eq!(downmix(&[0.5f32, -0.5, 1.0, 0.0], 2), vec![0.0, 0.5]);
        assert_eq!(downmix(&[0.25f32, 0.75], 1), vec![0.25, 0.75]);
        assert_eq!(downmix(&[0i16, 0], 2), vec![0.0]);
    }

    #[test]
    fn test_open_close() {
        // Tolerates machines without a microphone
        let mut capture = CpalCapture::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        if capture.open(&CaptureConfig::default(), tx).is_ok() {
            assert!(capture.is_open());
            capture.close();
            assert!(!capture.is_open());
        }
        capture.close();
    }
}
