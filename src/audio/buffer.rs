use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use parking_lot::Mutex;

/// Thread-safe ring buffer holding the most recent capture samples.
///
/// The capture side writes every block into it and the level monitor reads
/// the newest window without consuming anything.
pub struct AudioRingBuffer {
    buffer: Arc<Mutex<HeapRb<f32>>>,
}

impl AudioRingBuffer {
    /// Create a new ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(HeapRb::new(capacity.max(1)))),
        }
    }

    /// Write samples to the buffer, overwriting the oldest when full
    pub fn write(&self, samples: &[f32]) {
        let mut buffer = self.buffer.lock();
        for &sample in samples {
            buffer.push_overwrite(sample);
        }
    }

    /// Copy out the newest `count` samples (fewer if not enough are buffered)
    pub fn latest(&self, count: usize) -> Vec<f32> {
        let buffer = self.buffer.lock();
        let len = buffer.occupied_len();
        let skip = len.saturating_sub(count);
        buffer.iter().skip(skip).copied().collect()
    }

    /// Get the number of samples available
    pub fn len(&self) -> usize {
        self.buffer.lock().occupied_len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Clear the buffer
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    /// Get the capacity of the buffer
    pub fn capacity(&self) -> usize {
        self.buffer.lock().capacity().get()
    }
}

impl Clone for AudioRingBuffer {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
        }
    }
}
