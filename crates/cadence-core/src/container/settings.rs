//! Per-container settings and policy tunables.

use crate::icb::IcbPolicy;
use crate::ids::ModuleId;
use crate::media::{FrameLength, MediaFormat};
use crate::power::VotePolicy;

/// How the container frame length is chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameSize {
    /// [`RuntimePolicy::default_frame_len_us`].
    #[default]
    Default,
    /// A fixed duration in microseconds.
    TimeUs(u32),
    /// A fixed sample count; the duration follows the media format.
    Samples(u32),
}

/// Heap the container allocates from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HeapKind {
    /// Regular heap.
    #[default]
    Default,
    /// Heap reachable in low-power island.
    LowPower,
}

/// Constants that shape buffering, votes and ingress retention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimePolicy {
    /// Regular buffers per external output.
    pub default_reg_bufs: u32,
    /// Buffers per external output carrying raw compressed data.
    pub raw_compressed_bufs: u32,
    /// Lowest sleep latency ever voted, in microseconds.
    pub latency_floor_us: u32,
    /// Latency tolerance for real-time containers, percent.
    pub rt_latency_pct: u32,
    /// Latency tolerance for other containers, percent.
    pub nrt_latency_pct: u32,
    /// Buffers an external input keeps back.
    pub ingress_prebuffer_retention: u32,
    /// Most messages an external input holds.
    pub max_ingress_elements: u32,
    /// Frame length used by [`FrameSize::Default`].
    pub default_frame_len_us: u32,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            default_reg_bufs: 2,
            raw_compressed_bufs: 2,
            latency_floor_us: 40,
            rt_latency_pct: 3,
            nrt_latency_pct: 70,
            ingress_prebuffer_retention: 2,
            max_ingress_elements: 128,
            default_frame_len_us: 1_000,
        }
    }
}

impl RuntimePolicy {
    /// Buffering negotiation tunables.
    pub fn icb(&self) -> IcbPolicy {
        IcbPolicy {
            default_reg_bufs: self.default_reg_bufs,
            raw_compressed_bufs: self.raw_compressed_bufs,
        }
    }

    /// Vote tunables.
    pub fn votes(&self) -> VotePolicy {
        VotePolicy {
            latency_floor_us: self.latency_floor_us,
            rt_latency_pct: self.rt_latency_pct,
            nrt_latency_pct: self.nrt_latency_pct,
        }
    }
}

/// Settings a container is created with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSettings {
    /// Name used for the thread, logs and manager registrations.
    pub name: String,
    /// The container's own instance id.
    pub instance: ModuleId,
    /// Frame length choice.
    pub frame_size: FrameSize,
    /// Initial thread stack in bytes.
    pub stack_bytes: usize,
    /// Priority to run command handlers at, if boosted.
    pub priority_boost: Option<i32>,
    /// Heap kind; only a low-power heap lets the container enter island.
    pub heap: HeapKind,
    /// Processing is triggered by a real-time signal.
    pub signal_triggered: bool,
    /// May take part in island duty cycling.
    pub duty_cycling_allowed: bool,
    /// Accepts partial input frames.
    pub variable_input: bool,
    /// Consumes from a single buffer.
    pub single_buffer_mode: bool,
    /// Tunables.
    pub policy: RuntimePolicy,
}

/// Default thread stack.
pub const DEFAULT_STACK_BYTES: usize = 256 * 1024;

impl Default for ContainerSettings {
    fn default() -> Self {
        Self::new("cntr", ModuleId(0x4000))
    }
}

impl ContainerSettings {
    /// Settings with defaults for everything but the name and id.
    pub fn new(name: impl Into<String>, instance: ModuleId) -> Self {
        Self {
            name: name.into(),
            instance,
            frame_size: FrameSize::Default,
            stack_bytes: DEFAULT_STACK_BYTES,
            priority_boost: None,
            heap: HeapKind::Default,
            signal_triggered: false,
            duty_cycling_allowed: false,
            variable_input: false,
            single_buffer_mode: false,
            policy: RuntimePolicy::default(),
        }
    }

    /// Frame length for `media` under the current frame-size choice.
    pub fn frame_length(&self, media: MediaFormat) -> FrameLength {
        let rate = if media.is_valid() { media.sample_rate } else { 0 };
        match self.frame_size {
            FrameSize::Samples(samples) if rate > 0 => FrameLength::from_samples(samples, rate),
            FrameSize::Samples(samples) => FrameLength {
                samples,
                sample_rate: 0,
                us: 0,
            },
            FrameSize::TimeUs(us) => time_frame(us, rate),
            FrameSize::Default => time_frame(self.policy.default_frame_len_us, rate),
        }
    }
}

fn time_frame(us: u32, rate: u32) -> FrameLength {
    if rate == 0 {
        return FrameLength::from_us(us);
    }
    let samples = ((u64::from(us) * u64::from(rate)) / 1_000_000) as u32;
    FrameLength::from_samples(samples, rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_frame_snaps_to_samples_when_rate_known() {
        let mut s = ContainerSettings::default();
        s.frame_size = FrameSize::TimeUs(5_000);
        let f = s.frame_length(MediaFormat::pcm(48_000, 2, 16));
        assert_eq!((f.samples, f.us), (240, 5_000));
        assert_eq!(s.frame_length(MediaFormat::default()).us, 5_000);
    }

    #[test]
    fn sample_frame_needs_a_rate() {
        let mut s = ContainerSettings::default();
        s.frame_size = FrameSize::Samples(480);
        assert_eq!(s.frame_length(MediaFormat::default()).us, 0);
        assert_eq!(s.frame_length(MediaFormat::pcm(48_000, 1, 16)).us, 10_000);
    }

    #[test]
    fn default_frame_uses_policy() {
        let s = ContainerSettings::default();
        assert_eq!(s.frame_length(MediaFormat::default()).us, 1_000);
    }
}
