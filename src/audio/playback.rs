//! Playback pipeline for synthesized audio received from the service

use super::codec::AudioFrame;
use crate::Result;
use tracing::{debug, info, warn};

/// Audio output backend.
///
/// Samples passed to `append` are played strictly after everything appended
/// before them, without gaps while the queue is non-empty.
pub trait AudioPlayback: Send {
    /// Acquire the output device for mono audio at `sample_rate`
    fn start(&mut self, sample_rate: u32) -> Result<()>;
    /// Queue samples behind whatever is already queued
    fn append(&mut self, samples: &[f32]) -> Result<()>;
    /// Samples queued but not yet played
    fn queued(&self) -> usize;
    /// Drop everything queued
    fn clear(&mut self);
    /// Release the device. Safe to call when not started.
    fn stop(&mut self);
}

/// Decodes inbound frames and schedules them on an output backend
pub struct PlaybackPipeline {
    device: Box<dyn AudioPlayback>,
    sample_rate: u32,
    started: bool,
    frames_played: u64,
    frames_skipped: u64,
}

impl PlaybackPipeline {
    pub fn new(device: Box<dyn AudioPlayback>, sample_rate: u32) -> Self {
        Self {
            device,
            sample_rate,
            started: false,
            frames_played: 0,
            frames_skipped: 0,
        }
    }

    /// Decode a binary payload and queue it after every earlier frame.
    ///
    /// A payload that fails to decode is skipped and reported; the queue is
    /// left untouched.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> Result<()> {
        let frame = match AudioFrame::from_bytes(payload, self.sample_rate) {
            Ok(frame) => frame,
            Err(e) => {
                self.frames_skipped += 1;
                warn!("Skipping inbound frame: {}", e);
                return Err(e);
            }
        };

        if frame.is_empty() {
            debug!("Ignoring empty inbound frame");
            return Ok(());
        }

        if !self.started {
            self.device.start(self.sample_rate)?;
            self.started = true;
            info!(sample_rate = self.sample_rate, "Playback started");
        }

        self.device.append(&frame.samples())?;
        self.frames_played += 1;
        debug!(
            samples = frame.sample_count(),
            queued = self.device.queued(),
            "Frame queued for playback"
        );
        Ok(())
    }

    /// True from the moment a frame is queued until the output drains
    pub fn is_playing(&self) -> bool {
        self.started && self.device.queued() > 0
    }

    /// Drop queued audio but keep the device
    pub fn flush(&mut self) {
        if self.started {
            self.device.clear();
        }
    }

    /// Drop queued audio and release the device. Idempotent.
    pub fn stop(&mut self) {
        if self.started {
            self.device.clear();
            self.device.stop();
            self.started = false;
            info!("Playback stopped");
        }
    }

    pub fn frames_played(&self) -> u64 {
        self.frames_played
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
