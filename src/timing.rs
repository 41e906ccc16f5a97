//! Presentation timestamp reconstruction.
//!
//! Devices stamp each DHAV packet with a 16-bit epoch (seconds) and a 16-bit
//! millisecond counter that wraps at 65536. [`ResyncEngine`] turns that pair into
//! a monotonically non-decreasing presentation time:
//!
//! - The first packet anchors output time at `epoch * 1s + (ms % 1000) * 1ms`.
//! - Forward steps of up to 1000 device ms (wrap-aware) advance output time by
//!   the same amount.
//! - Backward steps of up to 1000 ms (audio interleaved slightly behind video)
//!   hold output time still.
//! - Anything larger is a device clock reset and re-anchors output time.
//!
//! The configured latency is added to every returned timestamp.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{Span, debug, debug_span, trace, warn};

const NANOS_PER_MS: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;
/// Largest device step, in ms, treated as jitter rather than a clock reset.
pub const MAX_STEP_MS: u16 = 1000;

/// Source of pipeline time.
pub trait PipelineClock: Send + Sync + fmt::Debug {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;
}

/// Monotonic clock starting at construction.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: tokio::time::Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineClock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually advanced clock for deterministic pipelines.
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.nanos.store(to.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl PipelineClock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Per-session timing state, present once the first packet was stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingState {
    pub last_device_ms: u16,
    /// Last output timestamp, latency excluded
    pub last_output: Duration,
    /// Pipeline time of the first anchor
    pub base_pipeline_time: Duration,
    /// Output time of the current anchor minus pipeline drift since the base
    pub send_base: Duration,
}

/// Maps device epoch/ms pairs onto pipeline presentation time.
#[derive(Debug)]
pub struct ResyncEngine {
    clock: Arc<dyn PipelineClock>,
    latency: Duration,
    state: Option<TimingState>,
    resyncs: u64,
    span: Span,
}

/// Output time of a device anchor, in nanoseconds.
fn anchor_nanos(epoch: u16, device_ms: u16) -> u64 {
    u64::from(epoch) * NANOS_PER_SEC + u64::from(device_ms % 1000) * NANOS_PER_MS
}

impl ResyncEngine {
    pub fn new(clock: Arc<dyn PipelineClock>, latency: Duration, parent: &Span) -> Self {
        let span = debug_span!(parent: parent, "timing");
        Self { clock, latency, state: None, resyncs: 0, span }
    }

    /// Whether the next packet will re-anchor output time.
    pub fn needs_resync(&self) -> bool {
        self.state.is_none()
    }

    pub fn state(&self) -> Option<&TimingState> {
        self.state.as_ref()
    }

    /// Number of device clock discontinuities handled so far.
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Force the next packet to re-anchor output time.
    pub fn reset(&mut self) {
        self.state = None;
    }

    /// Presentation timestamp for a packet stamped `(epoch, device_ms)`.
    pub fn stamp(&mut self, epoch: u16, device_ms: u16) -> Duration {
        let _enter = self.span.enter();
        let now = self.clock.now();

        let Some(state) = self.state.as_mut() else {
            let anchor = Duration::from_nanos(anchor_nanos(epoch, device_ms));
            debug!("Anchoring output time at {:?} (epoch={}, ms={})", anchor, epoch, device_ms);
            self.state = Some(TimingState {
                last_device_ms: device_ms,
                last_output: anchor,
                base_pipeline_time: now,
                send_base: anchor,
            });
            return anchor + self.latency;
        };

        let forward = device_ms.wrapping_sub(state.last_device_ms);
        let backward = state.last_device_ms.wrapping_sub(device_ms);
        trace!("forward={} backward={}", forward, backward);

        let delta_ms = if forward <= MAX_STEP_MS {
            forward
        } else if backward <= MAX_STEP_MS {
            0
        } else {
            warn!(
                "Device clock discontinuity (last ms {}, now {}), resyncing",
                state.last_device_ms, device_ms
            );
            let anchor = Duration::from_nanos(anchor_nanos(epoch, device_ms));
            let drift = now.saturating_sub(state.base_pipeline_time);
            state.send_base = anchor.saturating_sub(drift);
            state.last_output = anchor;
            state.last_device_ms = device_ms;
            self.resyncs += 1;
            0
        };

        let output = state.last_output + Duration::from_millis(u64::from(delta_ms));
        trace!(
            "pts {:?}, received at {:?} into the session",
            output,
            now.saturating_sub(state.base_pipeline_time)
        );
        state.last_device_ms = device_ms;
        state.last_output = output;
        output + self.latency
    }
}
