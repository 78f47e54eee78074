//! Inter-container buffering (ICB) negotiation.
//!
//! An external output decides how many buffers it circulates to its
//! downstream peer from its own frame length and the frame length, period
//! and flags the downstream reported. Until both sides are known the
//! negotiation is deferred: it succeeds with zero buffers.

use crate::media::{DataFormat, FrameLength, Scenario};

/// Buffering information a downstream input reports to its upstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IcbInfo {
    /// Downstream frame length.
    pub frame: FrameLength,
    /// Downstream period in microseconds (0 when not periodic).
    pub period_us: u32,
    /// Downstream accepts partial frames.
    pub variable_input: bool,
    /// Downstream runs at a real-time cadence.
    pub real_time: bool,
    /// Downstream consumes from a single buffer.
    pub single_buffer_mode: bool,
    /// Downstream scenario.
    pub scenario: Scenario,
}

impl IcbInfo {
    /// Returns `true` if no report has real content.
    pub fn is_empty(&self) -> bool {
        self.frame.is_unknown() && self.period_us == 0
    }
}

/// The upstream (own) side of a negotiation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IcbLocal {
    /// Own frame length.
    pub frame: FrameLength,
    /// Own period in microseconds.
    pub period_us: u32,
    /// Data upstream of this output is real time.
    pub real_time: bool,
    /// Never send a one-time prebuffer.
    pub disable_otp: bool,
    /// Own scenario.
    pub scenario: Scenario,
}

/// Tunables for negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IcbPolicy {
    /// Regular buffers when nothing forces more.
    pub default_reg_bufs: u32,
    /// Fixed count for raw compressed data.
    pub raw_compressed_bufs: u32,
}

impl Default for IcbPolicy {
    fn default() -> Self {
        Self {
            default_reg_bufs: 2,
            raw_compressed_bufs: 2,
        }
    }
}

/// How a result was reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IcbMode {
    /// A prerequisite is missing; no buffers yet.
    #[default]
    Deferred,
    /// Fixed count for raw compressed data.
    RawCompressed,
    /// Computed from both frame lengths.
    Negotiated,
}

/// Negotiated buffering of one external output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IcbResult {
    /// How the result was reached.
    pub mode: IcbMode,
    /// Regular buffers in circulation.
    pub reg_bufs: u32,
    /// Steady-state prebuffers sent on first activity.
    pub prebufs: u32,
    /// Length of the one-time prebuffer in microseconds (0 for none).
    pub otp_us: u32,
}

impl IcbResult {
    /// Total buffers the output pool must hold.
    pub fn total_bufs(&self) -> u32 {
        self.reg_bufs + self.prebufs
    }

    /// Returns `true` for a deferred result.
    pub fn is_deferred(&self) -> bool {
        self.mode == IcbMode::Deferred
    }
}

/// Everything a negotiation reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IcbInputs {
    /// Output has a downstream peer.
    pub connected: bool,
    /// Data format flowing through the output.
    pub format: DataFormat,
    /// Own side.
    pub local: IcbLocal,
    /// Latest downstream report.
    pub downstream: Option<IcbInfo>,
}

fn ceil_div(a: u32, b: u32) -> u32 {
    a.div_ceil(b)
}

/// Computes the buffering of one external output.
///
/// Deterministic: identical inputs give identical results.
pub fn negotiate(inputs: &IcbInputs, policy: &IcbPolicy) -> IcbResult {
    let deferred = IcbResult::default();
    if !inputs.connected {
        return deferred;
    }
    if inputs.format == DataFormat::RawCompressed {
        return IcbResult {
            mode: IcbMode::RawCompressed,
            reg_bufs: policy.raw_compressed_bufs,
            prebufs: 0,
            otp_us: 0,
        };
    }
    let Some(ds) = inputs.downstream.filter(|d| !d.is_empty()) else {
        return deferred;
    };
    let own = &inputs.local;
    let u = own.frame.us;
    if u == 0 {
        return deferred;
    }
    let d = if ds.frame.us != 0 { ds.frame.us } else { ds.period_us };

    if own.scenario == Scenario::Voice && ds.scenario == Scenario::Voice {
        return IcbResult {
            mode: IcbMode::Negotiated,
            reg_bufs: policy.default_reg_bufs,
            prebufs: 0,
            otp_us: 0,
        };
    }

    let mut reg_bufs = policy.default_reg_bufs;
    if d > u {
        reg_bufs = reg_bufs.max(ceil_div(d, u) + 1);
    }
    if ds.single_buffer_mode && !own.real_time && !ds.real_time {
        reg_bufs = ceil_div(d, u).max(1);
    }

    let both_rt = own.real_time && ds.real_time;
    let prebufs = u32::from(both_rt && d < u);
    let otp_us = if both_rt && d > u && d % u != 0 && !own.disable_otp {
        d % u
    } else {
        0
    };

    IcbResult {
        mode: IcbMode::Negotiated,
        reg_bufs,
        prebufs,
        otp_us,
    }
}
