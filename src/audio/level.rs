//! Microphone level metering
//!
//! While capture is active a periodic task reads the newest samples from the
//! capture tap and reduces them to one number in `[0, 1]`: the mean of a
//! smoothed, byte-scaled magnitude spectrum.

use super::buffer::AudioRingBuffer;
use crate::state::SharedVoiceState;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Samples per analysis window
pub const FFT_SIZE: usize = 256;

/// Spectrum bins (half the window)
pub const BIN_COUNT: usize = FFT_SIZE / 2;

const SMOOTHING: f32 = 0.8;
const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = -30.0;

/// Shortest metering period; a zero interval cannot drive a timer
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Windowed DFT with temporal smoothing across calls
pub struct SpectrumAnalyser {
    window: Vec<f32>,
    cos_table: Vec<f32>,
    sin_table: Vec<f32>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyser {
    pub fn new() -> Self {
        let n = FFT_SIZE as f32;
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        let cos_table = (0..FFT_SIZE).map(|i| (2.0 * PI * i as f32 / n).cos()).collect();
        let sin_table = (0..FFT_SIZE).map(|i| (2.0 * PI * i as f32 / n).sin()).collect();

        Self {
            window,
            cos_table,
            sin_table,
            smoothed: vec![0.0; BIN_COUNT],
        }
    }

    /// Level of the newest window in `[0, 1]`.
    ///
    /// Input shorter than the window is treated as preceded by silence; only
    /// the last `FFT_SIZE` samples of longer input are used.
    pub fn analyse(&mut self, samples: &[f32]) -> f32 {
        let mut frame = [0.0f32; FFT_SIZE];
        let take = samples.len().min(FFT_SIZE);
        frame[FFT_SIZE - take..].copy_from_slice(&samples[samples.len() - take..]);
        for (s, w) in frame.iter_mut().zip(&self.window) {
            *s *= w;
        }

        let mut total = 0.0f32;
        for k in 0..BIN_COUNT {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (i, &s) in frame.iter().enumerate() {
                let idx = (k * i) % FFT_SIZE;
                re += s * self.cos_table[idx];
                im -= s * self.sin_table[idx];
            }
            let magnitude = (re * re + im * im).sqrt() / FFT_SIZE as f32;

            let smoothed = SMOOTHING * self.smoothed[k] + (1.0 - SMOOTHING) * magnitude;
            self.smoothed[k] = smoothed;

            total += byte_scale(smoothed);
        }

        total / BIN_COUNT as f32 / 255.0
    }

    /// Forget the smoothing history
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }
}

impl Default for SpectrumAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a linear magnitude onto [0, 255] over the metering dB range
fn byte_scale(magnitude: f32) -> f32 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DB) / (MAX_DB - MIN_DB);
    scaled.clamp(0.0, 255.0).floor()
}

/// Periodic level task bound to one capture session
pub struct LevelMonitor {
    interval: Duration,
    tx: Arc<watch::Sender<f32>>,
    status: SharedVoiceState,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl LevelMonitor {
    pub fn new(interval: Duration, status: SharedVoiceState) -> Self {
        let (tx, _) = watch::channel(0.0);
        Self {
            interval: interval.max(MIN_INTERVAL),
            tx: Arc::new(tx),
            status,
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Receiver that always holds the latest level
    pub fn subscribe(&self) -> watch::Receiver<f32> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> f32 {
        *self.tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Start metering `tap`. Must be called inside a tokio runtime; a second
    /// call while running is ignored.
    pub fn start(&mut self, tap: AudioRingBuffer) {
        if self.task.is_some() {
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let tx = Arc::clone(&self.tx);
        let status = self.status.clone();
        let period = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut analyser = SpectrumAnalyser::new();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let level = analyser.analyse(&tap.latest(FFT_SIZE));

                // Checked under the channel lock so a concurrent stop() wins
                tx.send_if_modified(|current| {
                    if !running.load(Ordering::SeqCst) {
                        return false;
                    }
                    status.write().level = level;
                    if *current == level {
                        return false;
                    }
                    *current = level;
                    true
                });

                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
        }));

        debug!(interval_ms = period.as_millis() as u64, "Level monitor started");
    }

    /// Stop metering and publish 0 immediately. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Level monitor stopped");
        }
        self.tx.send_replace(0.0);
        self.status.write().level = 0.0;
    }
}

impl Drop for LevelMonitor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
