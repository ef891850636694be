//! Sample mixing and the periodic mixing engine
//!
//! Once per frame period the engine swaps out everything received since the
//! previous tick, sums it sample-wise with saturation and fans the single
//! result out to every live connection. Ticks run whether or not anything
//! arrived, so output cadence never depends on input jitter.

use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::audio::buffer::SharedFrameQueue;
use crate::constants::BYTES_PER_SAMPLE;
use crate::network::registry::Registry;
use crate::protocol::Frame;
use crate::shutdown::Shutdown;

/// Result of mixing one tick's worth of input
#[derive(Debug, Clone)]
pub struct MixOutput {
    /// Mixed frame, always exactly the configured frame size
    pub frame: Frame,
    /// Inputs summed into the frame
    pub mixed: usize,
    /// Inputs excluded because their length did not match
    pub rejected: usize,
}

/// Add `input` into `acc` sample by sample, clamping every sum to the i16
/// range. `input` must hold exactly `acc.len()` little-endian samples.
pub fn mix_into(acc: &mut [i16], input: &[u8]) {
    debug_assert_eq!(input.len(), acc.len() * BYTES_PER_SAMPLE);
    for (slot, bytes) in acc.iter_mut().zip(input.chunks_exact(BYTES_PER_SAMPLE)) {
        let sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        *slot = slot.saturating_add(sample);
    }
}

/// Mix `inputs` into one frame of `frame_bytes` bytes.
///
/// Inputs whose length differs from `frame_bytes` are left out and counted
/// in [`MixOutput::rejected`]. No inputs yields silence.
pub fn mix_frames(inputs: &[Frame], frame_bytes: usize) -> MixOutput {
    let mut acc = vec![0i16; frame_bytes / BYTES_PER_SAMPLE];
    let mut mixed = 0;
    let mut rejected = 0;

    for input in inputs {
        if input.len() != frame_bytes {
            tracing::debug!(
                len = input.len(),
                expected = frame_bytes,
                "Excluding malformed frame from mix"
            );
            rejected += 1;
            continue;
        }
        // Whole samples only; an odd trailing byte is not mixed.
        let whole = acc.len() * BYTES_PER_SAMPLE;
        mix_into(&mut acc, &input[..whole]);
        mixed += 1;
    }

    let mut out = BytesMut::with_capacity(frame_bytes);
    for sample in &acc {
        out.put_i16_le(*sample);
    }
    // Odd frame sizes end in one zero byte.
    out.resize(frame_bytes, 0);

    MixOutput {
        frame: out.freeze(),
        mixed,
        rejected,
    }
}

/// Mixing engine counters
#[derive(Debug, Default)]
pub struct MixerStats {
    pub ticks: AtomicU64,
    pub frames_mixed: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub deliveries: AtomicU64,
}

impl MixerStats {
    pub fn snapshot(&self) -> MixerStatsSnapshot {
        MixerStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            frames_mixed: self.frames_mixed.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixerStatsSnapshot {
    pub ticks: u64,
    pub frames_mixed: u64,
    pub frames_rejected: u64,
    pub deliveries: u64,
}

/// Per-tick summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub mixed: usize,
    pub rejected: usize,
    pub delivered: usize,
}

/// Drains the shared inbound buffer on a fixed period and broadcasts the mix
pub struct MixingEngine {
    inbound: SharedFrameQueue,
    registry: Registry,
    frame_bytes: usize,
    period: Duration,
    stats: Arc<MixerStats>,
}

impl MixingEngine {
    pub fn new(
        inbound: SharedFrameQueue,
        registry: Registry,
        frame_bytes: usize,
        period: Duration,
    ) -> Self {
        Self {
            inbound,
            registry,
            frame_bytes,
            period,
            stats: Arc::new(MixerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<MixerStats> {
        self.stats.clone()
    }

    /// Run one tick: swap, mix, fan out.
    pub fn tick(&self) -> TickReport {
        // The swap is the only time the inbound lock is held by the mixer.
        let inputs = self.inbound.drain();
        let output = mix_frames(&inputs, self.frame_bytes);

        let frame = output.frame;
        let delivered = self.registry.broadcast(&frame);

        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_mixed
            .fetch_add(output.mixed as u64, Ordering::Relaxed);
        self.stats
            .frames_rejected
            .fetch_add(output.rejected as u64, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);

        if output.rejected > 0 {
            tracing::warn!(
                rejected = output.rejected,
                expected = self.frame_bytes,
                "Dropped frames with unexpected length from mix"
            );
        }

        TickReport {
            mixed: output.mixed,
            rejected: output.rejected,
            delivered,
        }
    }

    /// Tick every period until shutdown. The tick in progress when shutdown
    /// fires is completed first.
    pub async fn run(self, shutdown: Shutdown) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            period_ms = self.period.as_millis() as u64,
            frame_bytes = self.frame_bytes,
            "Mixing engine started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }

        let stats = self.stats.snapshot();
        tracing::info!(
            ticks = stats.ticks,
            mixed = stats.frames_mixed,
            rejected = stats.frames_rejected,
            "Mixing engine stopped"
        );
    }
}
