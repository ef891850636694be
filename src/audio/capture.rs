//! Audio capture sources
//!
//! A capture source pushes fixed-size PCM frames into a [`FrameQueue`]
//! from its own thread until stopped. The queue's drop-oldest policy is the
//! only backpressure between capture and the network.
//!
//! [`FrameQueue`]: crate::audio::buffer::FrameQueue

use bytes::Bytes;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};

use crate::audio::buffer::SharedFrameQueue;
use crate::config::AudioFormat;
use crate::error::AudioError;

/// Supplies one fixed-size raw PCM frame per frame period
pub trait CaptureSource: Send {
    /// Begin pushing frames into `output`
    fn start(&mut self, output: SharedFrameQueue) -> Result<(), AudioError>;

    /// Stop producing frames and release the device
    fn stop(&mut self);

    /// A stream failure raised since the last call, if any
    fn take_error(&mut self) -> Option<AudioError> {
        None
    }
}

/// Emits an all-zero frame every frame period. Test mode uses it so many
/// clients can share one machine without fighting over a microphone.
pub struct SilentSource {
    format: AudioFormat,
    stop_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl SilentSource {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            stop_tx: None,
            thread_handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }
}

impl CaptureSource for SilentSource {
    fn start(&mut self, output: SharedFrameQueue) -> Result<(), AudioError> {
        if self.thread_handle.is_some() {
            return Err(AudioError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let silence = Bytes::from(vec![0u8; self.format.frame_bytes()]);
        let period = self.format.tick_interval();

        let handle = thread::Builder::new()
            .name("capture-silent".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => output.push(silence.clone()),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.stop_tx = Some(stop_tx);
        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SilentSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Converts interleaved f32 device samples into i16 LE frames
#[cfg_attr(not(feature = "devices"), allow(dead_code))]
struct FrameAssembler {
    pending: bytes::BytesMut,
    frame_bytes: usize,
}

#[cfg_attr(not(feature = "devices"), allow(dead_code))]
impl FrameAssembler {
    fn new(frame_bytes: usize) -> Self {
        Self {
            pending: bytes::BytesMut::with_capacity(frame_bytes * 2),
            frame_bytes,
        }
    }

    /// Append samples; calls `emit` once per completed frame
    fn push_samples<F: FnMut(Bytes)>(&mut self, samples: &[f32], mut emit: F) {
        use bytes::BufMut;

        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            self.pending.put_i16_le(value);
            if self.pending.len() == self.frame_bytes {
                emit(self.pending.split().freeze());
            }
        }
    }
}

#[cfg(feature = "devices")]
pub use device_capture::DeviceCapture;

#[cfg(feature = "devices")]
mod device_capture {
    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::StreamConfig;
    use crossbeam_channel::{bounded, Receiver};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::{CaptureSource, FrameAssembler};
    use crate::audio::buffer::SharedFrameQueue;
    use crate::audio::device::input_device;
    use crate::config::AudioFormat;
    use crate::error::AudioError;

    /// Microphone capture through cpal
    pub struct DeviceCapture {
        device_name: Option<String>,
        format: AudioFormat,
        running: Arc<AtomicBool>,
        thread_handle: Option<JoinHandle<()>>,
        error_rx: Option<Receiver<AudioError>>,
    }

    impl DeviceCapture {
        /// `device_name` of `None` selects the default input device
        pub fn new(device_name: Option<String>, format: AudioFormat) -> Self {
            Self {
                device_name,
                format,
                running: Arc::new(AtomicBool::new(false)),
                thread_handle: None,
                error_rx: None,
            }
        }

        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

    }

    impl CaptureSource for DeviceCapture {
        fn start(&mut self, output: SharedFrameQueue) -> Result<(), AudioError> {
            if self.running.load(Ordering::SeqCst) {
                return Err(AudioError::AlreadyRunning);
            }

            let device = input_device(self.device_name.as_deref())?;
            let config = StreamConfig {
                channels: self.format.channels,
                sample_rate: cpal::SampleRate(self.format.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let frame_bytes = self.format.frame_bytes();

            let (error_tx, error_rx) = bounded::<AudioError>(16);
            let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
            self.error_rx = Some(error_rx);

            let running = self.running.clone();
            running.store(true, Ordering::SeqCst);

            // cpal streams are not Send on every host, so the stream lives
            // and dies on this thread.
            let handle = thread::Builder::new()
                .name("capture-device".to_string())
                .spawn(move || {
                    let mut assembler = FrameAssembler::new(frame_bytes);
                    let callback_running = running.clone();

                    let stream = device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            if !callback_running.load(Ordering::Relaxed) {
                                return;
                            }
                            assembler.push_samples(data, |frame| output.push(frame));
                        },
                        move |err| {
                            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                        },
                        None,
                    );

                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            running.store(false, Ordering::SeqCst);
                            let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    while running.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(10));
                    }
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?;

            self.thread_handle = Some(handle);
            let started = ready_rx.recv().unwrap_or_else(|_| {
                Err(AudioError::StreamError("capture thread exited".to_string()))
            });
            if started.is_err() {
                self.stop();
            }
            started
        }

        fn take_error(&mut self) -> Option<AudioError> {
            self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
        }
    }

    impl Drop for DeviceCapture {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_shared_queue;
    use std::time::Duration;

    #[test]
    fn test_silent_source_emits_zero_frames() {
        let format = AudioFormat {
            frame_ms: 5,
            ..AudioFormat::default()
        };
        let queue = create_shared_queue(64);
        let mut source = SilentSource::new(format);

        source.start(queue.clone()).unwrap();
        assert!(matches!(source.start(queue.clone()), Err(AudioError::AlreadyRunning)));
        std::thread::sleep(Duration::from_millis(60));
        source.stop();
        assert!(!source.is_running());

        let frames = queue.drain();
        assert!(!frames.is_empty());
        assert!(frames
            .iter()
            .all(|f| f.len() == format.frame_bytes() && f.iter().all(|&b| b == 0)));

        // Stopped means stopped.
        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_assembler_splits_frames() {
        let mut assembler = FrameAssembler::new(8);
        let mut frames = Vec::new();

        assembler.push_samples(&[1.0, -1.0, 0.0], |f| frames.push(f));
        assert!(frames.is_empty());
        assembler.push_samples(&[0.5, 2.0, 0.0, 0.0, 0.0], |f| frames.push(f));

        assert_eq!(frames.len(), 2);
        let first: Vec<i16> = frames[0]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(first, vec![32767, -32767, 0, 16383]);
        // Out-of-range input is clamped.
        assert_eq!(i16::from_le_bytes([frames[1][0], frames[1][1]]), 32767);
    }
}
