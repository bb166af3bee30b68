//! Microphone capture pipeline
//!
//! A capture backend pushes mono samples of whatever chunk size the device
//! delivers. The pipeline turns that into a lazy sequence of fixed-size blocks
//! and keeps a copy of the newest samples for the level monitor.

use super::buffer::AudioRingBuffer;
use crate::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Default session sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 24000;

/// Default samples per capture block
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Samples kept for the level monitor (one second at the default rate)
const TAP_CAPACITY: usize = DEFAULT_SAMPLE_RATE as usize;

/// Channel a capture backend pushes mono `f32` chunks into
pub type SampleSink = UnboundedSender<Vec<f32>>;

/// Microphone constraints requested from the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sample rate the backend must deliver
    pub sample_rate: u32,
    /// Channel count of delivered samples (the wire format is mono)
    pub channels: u16,
    /// Samples per emitted block
    pub block_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            block_size: DEFAULT_BLOCK_SIZE,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Microphone backend.
///
/// `open` acquires the device and starts pushing mono samples at
/// `config.sample_rate` into `sink`; `close` releases the device and drops the
/// sink. `close` must be safe to call when nothing is open.
pub trait AudioCapture: Send {
    fn open(&mut self, config: &CaptureConfig, sink: SampleSink) -> Result<()>;
    fn close(&mut self);
}

/// Owns a capture backend and hands out one [`CaptureHandle`] per recording
pub struct CapturePipeline {
    device: Box<dyn AudioCapture>,
    config: CaptureConfig,
    tap: AudioRingBuffer,
    active: Option<Arc<AtomicBool>>,
}

impl CapturePipeline {
    pub fn new(device: Box<dyn AudioCapture>, config: CaptureConfig) -> Self {
        Self {
            device,
            config,
            tap: AudioRingBuffer::new(TAP_CAPACITY),
            active: None,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Ring buffer with the newest captured samples
    pub fn tap(&self) -> AudioRingBuffer {
        self.tap.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Acquire the microphone and start a new block sequence
    pub fn start(&mut self) -> Result<CaptureHandle> {
        if self.active.is_some() {
            warn!("Capture already active, ignoring start request");
            return Err(VoiceError::CaptureActive);
        }
        if self.config.block_size == 0 {
            return Err(VoiceError::ConfigError("Capture block size must be greater than 0".into()));
        }

        debug!(
            sample_rate = self.config.sample_rate,
            block_size = self.config.block_size,
            echo_cancellation = self.config.echo_cancellation,
            noise_suppression = self.config.noise_suppression,
            auto_gain_control = self.config.auto_gain_control,
            "Opening capture device"
        );

        let (sink, samples_rx) = mpsc::unbounded_channel();
        self.device.open(&self.config, sink)?;

        self.tap.clear();
        let active = Arc::new(AtomicBool::new(true));
        self.active = Some(Arc::clone(&active));

        info!("Capture started");
        Ok(CaptureHandle {
            samples_rx,
            segmenter: BlockSegmenter::new(self.config.block_size),
            tap: self.tap.clone(),
            active,
            blocks: 0,
        })
    }

    /// Release the microphone. Idempotent.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.store(false, Ordering::SeqCst);
            self.device.close();
            self.tap.clear();
            info!("Capture stopped");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One recording's block sequence. Once it ends it never yields again.
pub struct CaptureHandle {
    samples_rx: UnboundedReceiver<Vec<f32>>,
    segmenter: BlockSegmenter,
    tap: AudioRingBuffer,
    active: Arc<AtomicBool>,
    blocks: u64,
}

impl CaptureHandle {
    /// Next block of exactly `block_size` samples, in capture order.
    ///
    /// Returns `None` once the pipeline was stopped or the backend went away.
    /// Cancel-safe: partial blocks stay buffered across calls.
    pub async fn next_block(&mut self) -> Option<Vec<f32>> {
        loop {
            if !self.active.load(Ordering::SeqCst) {
                return None;
            }

            if let Some(block) = self.segmenter.pop() {
                self.blocks += 1;
                return Some(block);
            }

            match self.samples_rx.recv().await {
                Some(chunk) => {
                    self.tap.write(&chunk);
                    self.segmenter.push(&chunk);
                }
                None => {
                    debug!(blocks = self.blocks, "Capture backend closed its sink");
                    self.active.store(false, Ordering::SeqCst);
                    return None;
                }
            }
        }
    }

    /// Blocks produced so far
    pub fn blocks_emitted(&self) -> u64 {
        self.blocks
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Re-chunks an arbitrary sample stream into fixed-size blocks
#[derive(Debug)]
pub struct BlockSegmenter {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockSegmenter {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
    }

    /// Take the next complete block, if one is buffered
    pub fn pop(&mut self) -> Option<Vec<f32>> {
        if self.pending.len() < self.block_size {
            return None;
        }
        let rest = self.pending.split_off(self.block_size);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Samples waiting for a full block
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::MemoryCapture;

    #[test]
    fn test_segmenter_blocks() {
        let mut seg = BlockSegmenter::new(4);
        seg.push(&[1.0, 2.0, 3.0]);
        assert!(seg.pop().is_none());

        seg.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(seg.pop(), Some(vec![1.0, 2.0, 3.0, 4.0]));
        assert_eq!(seg.pop(), Some(vec![5.0, 6.0, 7.0, 8.0]));
        assert!(seg.pop().is_none());
        assert_eq!(seg.pending(), 1);
    }

    #[tokio::test]
    async fn test_blocks_in_arrival_order() {
        let (capture, mic) = MemoryCapture::new();
        let config = CaptureConfig {
            block_size: 3,
            ..Default::default()
        };
        let mut pipeline = CapturePipeline::new(Box::new(capture), config);
        let mut handle = pipeline.start().unwrap();

        mic.push(&[0.1, 0.2]);
        mic.push(&[0.3, 0.4, 0.5, 0.6, 0.7]);

        assert_eq!(handle.next_block().await, Some(vec![0.1, 0.2, 0.3]));
        assert_eq!(handle.next_block().await, Some(vec![0.4, 0.5, 0.6]));
        assert_eq!(handle.blocks_emitted(), 2);
        assert_eq!(pipeline.tap().len(), 7);
    }

    #[tokio::test]
    async fn test_stop_ends_sequence_and_is_idempotent() {
        let (capture, mic) = MemoryCapture::new();
        let mut pipeline = CapturePipeline::new(Box::new(capture), CaptureConfig::default());
        let mut handle = pipeline.start().unwrap();
        assert!(mic.is_open());

        pipeline.stop();
        pipeline.stop();

        assert!(!mic.is_open());
        assert_eq!(mic.close_count(), 1);
        assert_eq!(handle.next_block().await, None);
        // Non-restartable
        assert_eq!(handle.next_block().await, None);
    }

    #[tokio::test]
    async fn test_restart_gives_fresh_handle() {
        let (capture, mic) = MemoryCapture::new();
        let config = CaptureConfig {
            block_size: 2,
            ..Default::default()
        };
        let mut pipeline = CapturePipeline::new(Box::new(capture), config);
        let mut first = pipeline.start().unwrap();
        pipeline.stop();

        let mut second = pipeline.start().unwrap();
        mic.push(&[0.5, 0.5]);
        assert_eq!(second.next_block().await, Some(vec![0.5, 0.5]));
        assert_eq!(first.next_block().await, None);
        assert_eq!(mic.open_count(), 2);
    }

    #[test]
    fn test_double_start_rejected() {
        let (capture, _mic) = MemoryCapture::new();
        let mut pipeline = CapturePipeline::new(Box::new(capture), CaptureConfig::default());
        let _handle = pipeline.start().unwrap();
        assert!(matches!(pipeline.start(), Err(VoiceError::CaptureActive)));
    }

    #[test]
    fn test_device_errors_surface() {
        let (capture, mic) = MemoryCapture::failing(VoiceError::PermissionDenied);
        let mut pipeline = CapturePipeline::new(Box::new(capture), CaptureConfig::default());
        assert!(matches!(pipeline.start(), Err(VoiceError::PermissionDenied)));
        assert!(!pipeline.is_active());
        assert!(!mic.is_open());
    }
}
