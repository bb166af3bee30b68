//! In-memory audio backends
//!
//! Stand-ins for a microphone and a speaker, used for headless runs and tests.
//! Each backend comes with a handle (`MemoryMic`, `MemorySpeaker`) that shares
//! its state.

use super::capture::{AudioCapture, CaptureConfig, SampleSink};
use super::playback::AudioPlayback;
use crate::{Result, VoiceError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct MicState {
    sink: Option<SampleSink>,
    open_count: usize,
    close_count: usize,
    fail_with: Option<VoiceError>,
    last_config: Option<CaptureConfig>,
}

/// Microphone fed by a [`MemoryMic`]
pub struct MemoryCapture {
    state: Arc<Mutex<MicState>>,
}

impl MemoryCapture {
    pub fn new() -> (Self, MemoryMic) {
        let state = Arc::new(Mutex::new(MicState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            MemoryMic { state },
        )
    }

    /// A microphone whose `open` always fails with `error`
    pub fn failing(error: VoiceError) -> (Self, MemoryMic) {
        let (capture, mic) = Self::new();
        mic.set_failure(Some(error));
        (capture, mic)
    }
}

impl AudioCapture for MemoryCapture {
    fn open(&mut self, config: &CaptureConfig, sink: SampleSink) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(err) = &state.fail_with {
            return Err(err.clone());
        }
        state.sink = Some(sink);
        state.open_count += 1;
        state.last_config = Some(config.clone());
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if state.sink.take().is_some() {
            state.close_count += 1;
        }
    }
}

/// Test-side handle of a [`MemoryCapture`]
#[derive(Clone)]
pub struct MemoryMic {
    state: Arc<Mutex<MicState>>,
}

impl MemoryMic {
    /// Deliver samples as if the device produced them. Returns false when
    /// the microphone is not open.
    pub fn push(&self, samples: &[f32]) -> bool {
        match &self.state.lock().sink {
            Some(sink) => sink.send(samples.to_vec()).is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    pub fn last_config(&self) -> Option<CaptureConfig> {
        self.state.lock().last_config.clone()
    }

    /// Make subsequent `open` calls fail (or succeed again with `None`)
    pub fn set_failure(&self, error: Option<VoiceError>) {
        self.state.lock().fail_with = error;
    }
}

#[derive(Default)]
struct SpeakerState {
    queue: VecDeque<f32>,
    started: bool,
    sample_rate: Option<u32>,
    stop_count: usize,
}

/// Speaker whose output is pulled by a [`MemorySpeaker`]
pub struct MemoryPlayback {
    state: Arc<Mutex<SpeakerState>>,
}

impl MemoryPlayback {
    pub fn new() -> (Self, MemorySpeaker) {
        let state = Arc::new(Mutex::new(SpeakerState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            MemorySpeaker { state },
        )
    }
}

impl AudioPlayback for MemoryPlayback {
    fn start(&mut self, sample_rate: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.started = true;
        state.sample_rate = Some(sample_rate);
        Ok(())
    }

    fn append(&mut self, samples: &[f32]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.started {
            return Err(VoiceError::AudioDeviceError("Speaker not started".into()));
        }
        state.queue.extend(samples.iter().copied());
        Ok(())
    }

    fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn clear(&mut self) {
        self.state.lock().queue.clear();
    }

    fn stop(&mut self) {
        let mut state = self.state.lock();
        if state.started {
            state.started = false;
            state.stop_count += 1;
        }
    }
}

/// Test-side handle of a [`MemoryPlayback`]
#[derive(Clone)]
pub struct MemorySpeaker {
    state: Arc<Mutex<SpeakerState>>,
}

impl MemorySpeaker {
    /// Consume up to `count` queued samples, as the output callback would
    pub fn play(&self, count: usize) -> Vec<f32> {
        let mut state = self.state.lock();
        let n = count.min(state.queue.len());
        state.queue.drain(..n).collect()
    }

    /// Consume everything queued
    pub fn play_all(&self) -> Vec<f32> {
        let mut state = self.state.lock();
        state.queue.drain(..).collect()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.state.lock().sample_rate
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stop_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_mic_push_requires_open() {
        let (mut capture, mic) = MemoryCapture::new();
        assert!(!mic.push(&[0.0]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        capture.open(&CaptureConfig::default(), tx).unwrap();
        assert!(mic.push(&[0.5]));
        assert_eq!(rx.try_recv().unwrap(), vec![0.5]);

        capture.close();
        capture.close();
        assert_eq!(mic.close_count(), 1);
        assert!(!mic.push(&[0.5]));
    }

    #[test]
    fn test_speaker_drains_in_order() {
        let (mut playback, speaker) = MemoryPlayback::new();
        playback.start(24000).unwrap();
        playback.append(&[1.0, 2.0]).unwrap();
        playback.append(&[3.0]).unwrap();

        assert_eq!(speaker.play(2), vec![1.0, 2.0]);
        assert_eq!(playback.queued(), 1);
        assert_eq!(speaker.play_all(), vec![3.0]);
    }

    #[test]
    fn test_append_before_start_fails() {
        let (mut playback, _speaker) = MemoryPlayback::new();
        assert!(playback.append(&[0.0]).is_err());
    }
}
