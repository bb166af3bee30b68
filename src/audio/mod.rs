pub mod buffer;
pub mod capture;
pub mod codec;
#[cfg(feature = "audio-io")]
pub mod input;
pub mod level;
pub mod memory;
#[cfg(feature = "audio-io")]
pub mod output;
pub mod playback;
pub mod resampler;

pub use buffer::AudioRingBuffer;
pub use capture::{AudioCapture, CaptureConfig, CaptureHandle, CapturePipeline};
pub use codec::{decode, encode, AudioFrame};
#[cfg(feature = "audio-io")]
pub use input::CpalCapture;
pub use level::{LevelMonitor, SpectrumAnalyser};
pub use memory::{MemoryCapture, MemoryMic, MemoryPlayback, MemorySpeaker};
#[cfg(feature = "audio-io")]
pub use output::CpalPlayback;
pub use playback::{AudioPlayback, PlaybackPipeline};
pub use resampler::AudioResampler;

/// Wait on a device worker thread. Opening and closing a cpal stream blocks
/// until the worker reports back, so on a multi-thread runtime the wait is
/// moved off the async worker; elsewhere it runs in place.
#[cfg(feature = "audio-io")]
pub(crate) fn block_on_device<R>(f: impl FnOnce() -> R) -> R {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
