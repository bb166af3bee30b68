//! Speaker playback on cpal
//!
//! Samples are appended to a shared queue that the output callback drains.
//! When the device cannot run at the session rate, appended audio is resampled
//! to the device rate first.

use super::block_on_device;
use super::playback::AudioPlayback;
use super::resampler::AudioResampler;
use crate::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

struct Worker {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// Default output device of the default host
pub struct CpalPlayback {
    queue: SampleQueue,
    resampler: Mutex<Option<AudioResampler>>,
    worker: Option<Worker>,
}

impl CpalPlayback {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            resampler: Mutex::new(None),
            worker: None,
        }
    }
}

impl Default for CpalPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPlayback for CpalPlayback {
    fn start(&mut self, sample_rate: u32) -> Result<()> {
        if self.worker.is_some() {
            warn!("Already playing");
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<u32>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let queue = Arc::clone(&self.queue);

        let thread = thread::Builder::new()
            .name("cpal-playback".into())
            .spawn(move || {
                let (stream, device_rate) = match build_playback_stream(sample_rate, queue) {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(device_rate));

                let _ = stop_rx.recv();
                drop(stream);
                debug!("Playback stream dropped");
            })
            .map_err(|e| VoiceError::AudioDeviceError(format!("Failed to spawn playback thread: {}", e)))?;

        let device_rate = match block_on_device(|| ready_rx.recv()) {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = block_on_device(|| thread.join());
                return Err(e);
            }
            Err(_) => {
                let _ = block_on_device(|| thread.join());
                return Err(VoiceError::AudioDeviceError(
                    "Playback thread exited during setup".into(),
                ));
            }
        };

        *self.resampler.lock() = if device_rate != sample_rate {
            warn!(
                "Output device runs at {} Hz, resampling from {} Hz",
                device_rate, sample_rate
            );
            Some(AudioResampler::new(sample_rate, device_rate)?)
        } else {
            None
        };

        self.worker = Some(Worker { stop_tx, thread });
        Ok(())
    }

    fn append(&mut self, samples: &[f32]) -> Result<()> {
        if self.worker.is_none() {
            return Err(VoiceError::AudioDeviceError("Playback not started".into()));
        }

        let converted = match self.resampler.lock().as_mut() {
            Some(r) => r.process(samples)?,
            None => samples.to_vec(),
        };
        self.queue.lock().extend(converted);
        Ok(())
    }

    fn queued(&self) -> usize {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            // The stream paused; release the resampler tail
            if let Some(r) = self.resampler.lock().as_mut() {
                match r.flush() {
                    Ok(tail) => queue.extend(tail),
                    Err(e) => error!("Failed to flush playback resampler: {}", e),
                }
            }
        }
        queue.len()
    }

    fn clear(&mut self) {
        self.queue.lock().clear();
        if let Some(r) = self.resampler.lock().as_mut() {
            r.reset();
        }
    }

    fn stop(&mut self) {
        self.clear();
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if block_on_device(|| worker.thread.join()).is_err() {
                error!("Playback thread panicked");
            }
            info!("Stopped audio playback");
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_playback_stream(sample_rate: u32, queue: SampleQueue) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("No output device available".into()))?;

    info!("Using output device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    let (config, format) = select_output_config(&device, sample_rate)?;
    let device_rate = config.sample_rate.0;

    let stream = match format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, queue),
        SampleFormat::I16 => build_output::<i16>(&device, &config, queue),
        SampleFormat::U16 => build_output::<u16>(&device, &config, queue),
        other => Err(VoiceError::AudioDeviceError(format!(
            "Unsupported output sample format: {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| VoiceError::AudioDeviceError(format!("Failed to start output stream: {}", e)))?;

    info!("Started audio playback: {}Hz, {} channel(s)", device_rate, config.channels);
    Ok((stream, device_rate))
}

fn select_output_config(device: &Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    if let Ok(ranges) = device.supported_output_configs() {
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

    let supported = device
        .default_output_config()
        .map_err(|e| VoiceError::AudioDeviceError(format!("Failed to get output config: {}", e)))?;
    Ok((supported.config(), supported.sample_format()))
}

fn build_output<T>(device: &Device, config: &StreamConfig, queue: SampleQueue) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;

    let err_fn = |err| {
        error!("Audio output stream error: {}", err);
    };

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut queue = queue.lock();
                fill_frames(data, channels, &mut queue);
            },
            err_fn,
            None,
        )
        .map_err(|e| VoiceError::AudioDeviceError(format!("Failed to build output stream: {}", e)))
}

/// Copy queued mono samples into every channel of `data`, silence on underrun
fn fill_frames<T>(data: &mut [T], channels: usize, queue: &mut VecDeque<f32>)
where
    T: SizedSample + FromSample<f32>,
{
    let channels = channels.max(1);
    for frame in data.chunks_mut(channels) {
        let sample = T::from_sample(queue.pop_front().unwrap_or(0.0));
        frame.iter_mut().for_each(|s| *s = sample);
    }
}
