//! Clock, bandwidth, latency and island votes.
//!
//! A container votes for the aggregate load of its running modules. Votes
//! go through a [`VoteCache`]: a vote equal to the last one placed is
//! suppressed unless forced, and a release is skipped if nothing was ever
//! voted.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CntrResult;
use crate::graph::ModuleResources;

/// Scale factor 1.0 in Q4.
pub const UNITY_Q4: u32 = 16;

/// Clock cycles per packet, times two.
const CYCLES_PER_PACKET_X2: u64 = 7;

/// Clock floor for a scaled load; 0 at unity scale.
pub fn floor_clock_hz(kpps: u32, scale_q4: u32) -> u64 {
    if scale_q4 == UNITY_Q4 {
        return 0;
    }
    (u64::from(kpps) * u64::from(scale_q4) * CYCLES_PER_PACKET_X2 * 1000) >> 5
}

/// Registration mode with the power manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PmMode {
    /// Regular voting client.
    Default,
    /// Client that takes part in island duty cycling.
    IslandDutyCycle,
}

/// A resource request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerRequest {
    /// Processing plus bandwidth.
    MipsBandwidth {
        /// Aggregate load.
        kpps: u32,
        /// Minimum clock (0 for none).
        floor_clock_hz: u64,
        /// Bandwidth in bytes per second.
        bw_bytes_per_sec: u32,
    },
    /// Bandwidth only.
    Bandwidth {
        /// Bandwidth in bytes per second.
        bw_bytes_per_sec: u32,
    },
    /// Maximum tolerated wake-up latency.
    SleepLatency {
        /// Latency in microseconds.
        us: u32,
    },
    /// Whether island entry is acceptable.
    IslandVote {
        /// Entry allowed.
        allow: bool,
    },
}

/// A resource that can be released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PowerResource {
    /// Processing plus bandwidth.
    MipsBandwidth,
    /// Bandwidth only.
    Bandwidth,
    /// Sleep latency.
    SleepLatency,
    /// Island vote.
    IslandVote,
}

/// External power manager.
pub trait PowerManager: Send {
    /// Registers a client.
    fn register(&mut self, client: &str, mode: PmMode) -> CntrResult<()>;
    /// Deregisters the client.
    fn deregister(&mut self) -> CntrResult<()>;
    /// Places or changes a vote.
    fn request(&mut self, request: PowerRequest, blocking: bool) -> CntrResult<()>;
    /// Withdraws a vote.
    fn release(&mut self, resource: PowerResource, blocking: bool) -> CntrResult<()>;
}

/// Power manager that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPowerManager;

impl PowerManager for TracingPowerManager {
    fn register(&mut self, client: &str, mode: PmMode) -> CntrResult<()> {
        tracing::debug!(client, ?mode, "pm register");
        Ok(())
    }

    fn deregister(&mut self) -> CntrResult<()> {
        tracing::debug!("pm deregister");
        Ok(())
    }

    fn request(&mut self, request: PowerRequest, blocking: bool) -> CntrResult<()> {
        tracing::debug!(?request, blocking, "pm request");
        Ok(())
    }

    fn release(&mut self, resource: PowerResource, blocking: bool) -> CntrResult<()> {
        tracing::debug!(?resource, blocking, "pm release");
        Ok(())
    }
}

/// One call observed by a [`RecordingPowerManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PowerCall {
    /// `register`.
    Register(String, PmMode),
    /// `deregister`.
    Deregister,
    /// `request`.
    Request(PowerRequest, bool),
    /// `release`.
    Release(PowerResource, bool),
}

/// Power manager that records every call; clones share the log.
#[derive(Debug, Default, Clone)]
pub struct RecordingPowerManager {
    calls: Arc<Mutex<Vec<PowerCall>>>,
}

impl RecordingPowerManager {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the calls so far.
    pub fn calls(&self) -> Vec<PowerCall> {
        self.calls.lock().clone()
    }

    /// Number of `request` calls so far.
    pub fn request_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, PowerCall::Request(..)))
            .count()
    }
}

impl PowerManager for RecordingPowerManager {
    fn register(&mut self, client: &str, mode: PmMode) -> CntrResult<()> {
        self.calls
            .lock()
            .push(PowerCall::Register(client.to_owned(), mode));
        Ok(())
    }

    fn deregister(&mut self) -> CntrResult<()> {
        self.calls.lock().push(PowerCall::Deregister);
        Ok(())
    }

    fn request(&mut self, request: PowerRequest, blocking: bool) -> CntrResult<()> {
        self.calls.lock().push(PowerCall::Request(request, blocking));
        Ok(())
    }

    fn release(&mut self, resource: PowerResource, blocking: bool) -> CntrResult<()> {
        self.calls.lock().push(PowerCall::Release(resource, blocking));
        Ok(())
    }
}

/// Latency vote tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VotePolicy {
    /// Lowest latency ever voted.
    pub latency_floor_us: u32,
    /// Latency as a percentage of processing duration, real time.
    pub rt_latency_pct: u32,
    /// Latency as a percentage of processing duration, non real time.
    pub nrt_latency_pct: u32,
}

impl Default for VotePolicy {
    fn default() -> Self {
        Self {
            latency_floor_us: 40,
            rt_latency_pct: 3,
            nrt_latency_pct: 70,
        }
    }
}

impl VotePolicy {
    /// Latency to vote for a processing duration.
    pub fn latency_us(&self, proc_duration_us: u32, real_time: bool) -> u32 {
        let pct = if real_time {
            self.rt_latency_pct
        } else {
            self.nrt_latency_pct
        };
        let us = (u64::from(proc_duration_us) * u64::from(pct) / 100) as u32;
        us.max(self.latency_floor_us)
    }
}

/// A placed clock/bandwidth vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockVote {
    /// Load.
    pub kpps: u32,
    /// Bandwidth.
    pub bw_bytes_per_sec: u32,
    /// Clock floor.
    pub floor_clock_hz: u64,
}

/// Last votes placed; `None` means never voted (or released).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VoteCache {
    /// Clock and bandwidth.
    pub clock: Option<ClockVote>,
    /// Sleep latency.
    pub latency_us: Option<u32>,
    /// Island vote.
    pub island: Option<bool>,
}

/// What a vote call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Equal to the cached vote; nothing sent.
    Suppressed,
    /// A request went out.
    Requested {
        /// Sent as a blocking request.
        blocking: bool,
    },
    /// A release went out.
    Released,
    /// Release requested but nothing was ever voted.
    Skipped,
}

/// Places votes through a [`PowerManager`] with suppression.
pub struct PowerVoter {
    pm: Box<dyn PowerManager>,
    cache: VoteCache,
    policy: VotePolicy,
    registered: Option<PmMode>,
}

impl core::fmt::Debug for PowerVoter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PowerVoter")
            .field("cache", &self.cache)
            .field("policy", &self.policy)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

impl PowerVoter {
    /// Creates a voter over `pm`.
    pub fn new(pm: Box<dyn PowerManager>, policy: VotePolicy) -> Self {
        Self {
            pm,
            cache: VoteCache::default(),
            policy,
            registered: None,
        }
    }

    /// Cached votes.
    pub fn cache(&self) -> &VoteCache {
        &self.cache
    }

    /// Registration mode, if registered.
    pub fn registered(&self) -> Option<PmMode> {
        self.registered
    }

    /// Registers in `mode`, re-registering if registered differently.
    pub fn register(&mut self, client: &str, mode: PmMode) -> CntrResult<()> {
        match self.registered {
            Some(current) if current == mode => return Ok(()),
            Some(_) => self.deregister()?,
            None => {}
        }
        self.pm.register(client, mode)?;
        self.registered = Some(mode);
        Ok(())
    }

    /// Releases everything voted and deregisters.
    pub fn deregister(&mut self) -> CntrResult<()> {
        if self.registered.is_none() {
            return Ok(());
        }
        self.release_all()?;
        self.pm.deregister()?;
        self.registered = None;
        Ok(())
    }

    /// Votes for clock and bandwidth.
    ///
    /// Increasing votes block unless issued while handling an orchestrator
    /// command; decreasing votes and releases never block.
    pub fn vote_clock(
        &mut self,
        load: ModuleResources,
        scale_q4: u32,
        force: bool,
        in_command: bool,
    ) -> CntrResult<VoteOutcome> {
        if load.kpps == 0 && load.bw_bytes_per_sec == 0 {
            if self.cache.clock.is_none() {
                return Ok(VoteOutcome::Skipped);
            }
            self.pm.release(PowerResource::MipsBandwidth, false)?;
            self.cache.clock = None;
            return Ok(VoteOutcome::Released);
        }
        let vote = ClockVote {
            kpps: load.kpps,
            bw_bytes_per_sec: load.bw_bytes_per_sec,
            floor_clock_hz: floor_clock_hz(load.kpps, scale_q4),
        };
        if self.cache.clock == Some(vote) && !force {
            return Ok(VoteOutcome::Suppressed);
        }
        let increasing = self.cache.clock.is_none_or(|c| {
            vote.kpps > c.kpps || vote.bw_bytes_per_sec > c.bw_bytes_per_sec
        });
        let blocking = increasing && !in_command;
        self.pm.request(
            PowerRequest::MipsBandwidth {
                kpps: vote.kpps,
                floor_clock_hz: vote.floor_clock_hz,
                bw_bytes_per_sec: vote.bw_bytes_per_sec,
            },
            blocking,
        )?;
        self.cache.clock = Some(vote);
        Ok(VoteOutcome::Requested { blocking })
    }

    /// Votes sleep latency for a processing duration.
    pub fn vote_latency(
        &mut self,
        proc_duration_us: u32,
        real_time: bool,
        force: bool,
    ) -> CntrResult<VoteOutcome> {
        let us = self.policy.latency_us(proc_duration_us, real_time);
        if self.cache.latency_us == Some(us) && !force {
            return Ok(VoteOutcome::Suppressed);
        }
        self.pm.request(PowerRequest::SleepLatency { us }, false)?;
        self.cache.latency_us = Some(us);
        Ok(VoteOutcome::Requested { blocking: false })
    }

    /// Votes whether island entry is acceptable.
    pub fn vote_island(&mut self, allow: bool, force: bool) -> CntrResult<VoteOutcome> {
        if self.cache.island == Some(allow) && !force {
            return Ok(VoteOutcome::Suppressed);
        }
        self.pm.request(PowerRequest::IslandVote { allow }, false)?;
        self.cache.island = Some(allow);
        Ok(VoteOutcome::Requested { blocking: false })
    }

    /// Withdraws the latency vote.
    pub fn release_latency(&mut self) -> CntrResult<VoteOutcome> {
        if self.cache.latency_us.is_none() {
            return Ok(VoteOutcome::Skipped);
        }
        self.pm.release(PowerResource::SleepLatency, false)?;
        self.cache.latency_us = None;
        Ok(VoteOutcome::Released)
    }

    /// Withdraws the clock vote only.
    pub fn release_clock(&mut self) -> CntrResult<VoteOutcome> {
        self.vote_clock(ModuleResources::default(), UNITY_Q4, false, false)
    }

    /// Withdraws every vote placed.
    pub fn release_all(&mut self) -> CntrResult<()> {
        self.release_clock()?;
        self.release_latency()?;
        if self.cache.island.take().is_some() {
            self.pm.release(PowerResource::IslandVote, false)?;
        }
        Ok(())
    }
}
