//! Audio playback sinks
//!
//! A sink takes ownership of each frame it is handed. The frame's memory is
//! released when the sink drops it, which for a device sink happens only
//! after the output callback has consumed every sample. Callers never track
//! in-flight buffers themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::AudioError;
use crate::protocol::Frame;

/// Accepts one fixed-size raw PCM frame at a time
pub trait PlaybackSink: Send {
    fn play(&mut self, frame: Frame) -> Result<(), AudioError>;
}

impl<T: PlaybackSink + ?Sized> PlaybackSink for Box<T> {
    fn play(&mut self, frame: Frame) -> Result<(), AudioError> {
        (**self).play(frame)
    }
}

/// Discards everything. Used by test-mode clients.
#[derive(Debug, Default, Clone)]
pub struct NullSink {
    frames: Arc<AtomicU64>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames handed to this sink so far
    pub fn frames_played(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl PlaybackSink for NullSink {
    fn play(&mut self, _frame: Frame) -> Result<(), AudioError> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(feature = "devices")]
pub use device_playback::DevicePlayback;

#[cfg(feature = "devices")]
mod device_playback {
    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::StreamConfig;
    use crossbeam::queue::ArrayQueue;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::PlaybackSink;
    use crate::audio::device::output_device;
    use crate::config::AudioFormat;
    use crate::error::AudioError;
    use crate::protocol::Frame;

    /// Speaker output through cpal.
    ///
    /// Frames wait in a small lock-free queue until the output callback
    /// reaches them; the callback drops each frame once fully played.
    pub struct DevicePlayback {
        frames: Arc<ArrayQueue<Frame>>,
        running: Arc<AtomicBool>,
        overflows: Arc<AtomicU64>,
        underruns: Arc<AtomicU64>,
        thread_handle: Option<JoinHandle<()>>,
    }

    impl DevicePlayback {
        /// Open `device_name` (or the default output) and start the stream
        pub fn start(
            device_name: Option<&str>,
            format: AudioFormat,
            buffered_frames: usize,
        ) -> Result<Self, AudioError> {
            let device = output_device(device_name)?;
            let config = StreamConfig {
                channels: format.channels,
                sample_rate: cpal::SampleRate(format.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let frames = Arc::new(ArrayQueue::new(buffered_frames.max(1)));
            let running = Arc::new(AtomicBool::new(true));
            let underruns = Arc::new(AtomicU64::new(0));

            let handle = {
                let frames = frames.clone();
                let running = running.clone();
                let underruns = underruns.clone();
                thread::Builder::new()
                    .name("playback-device".to_string())
                    .spawn(move || {
                        let mut current: Option<Frame> = None;
                        let mut cursor = 0usize;

                        let stream = device.build_output_stream(
                            &config,
                            move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                let mut starved = false;
                                for slot in out.iter_mut() {
                                    let exhausted =
                                        current.as_ref().map_or(true, |f| cursor + 2 > f.len());
                                    if exhausted {
                                        // Dropping the finished frame releases its buffer.
                                        current = frames.pop();
                                        cursor = 0;
                                    }
                                    *slot = match &current {
                                        Some(frame) => {
                                            let sample =
                                                i16::from_le_bytes([frame[cursor], frame[cursor + 1]]);
                                            cursor += 2;
                                            sample as f32 / 32768.0
                                        }
                                        None => {
                                            starved = true;
                                            0.0
                                        }
                                    };
                                }
                                if starved {
                                    underruns.fetch_add(1, Ordering::Relaxed);
                                }
                            },
                            |err| tracing::warn!("Playback stream error: {}", err),
                            None,
                        );

                        match stream {
                            Ok(stream) => {
                                if let Err(e) = stream.play() {
                                    tracing::error!("Failed to start playback stream: {}", e);
                                    return;
                                }
                                while running.load(Ordering::Relaxed) {
                                    thread::sleep(Duration::from_millis(10));
                                }
                            }
                            Err(e) => tracing::error!("Failed to build playback stream: {}", e),
                        }
                    })
                    .map_err(|e| AudioError::StreamError(e.to_string()))?
            };

            Ok(Self {
                frames,
                running,
                overflows: Arc::new(AtomicU64::new(0)),
                underruns,
                thread_handle: Some(handle),
            })
        }

        pub fn overflow_count(&self) -> u64 {
            self.overflows.load(Ordering::Relaxed)
        }

        pub fn underrun_count(&self) -> u64 {
            self.underruns.load(Ordering::Relaxed)
        }

        pub fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
                tracing::info!(
                    overflows = self.overflow_count(),
                    underruns = self.underrun_count(),
                    "Playback stopped"
                );
            }
        }
    }

    impl PlaybackSink for DevicePlayback {
        fn play(&mut self, frame: Frame) -> Result<(), AudioError> {
            if !self.running.load(Ordering::Relaxed) {
                return Err(AudioError::StreamError("playback stopped".to_string()));
            }
            // Full device buffer: the oldest pending frame is displaced.
            if self.frames.force_push(frame).is_some() {
                self.overflows.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }
    }

    impl Drop for DevicePlayback {
        fn drop(&mut self) {
            self.stop();
        }
    }
}
