//! Framework event flags.
//!
//! Command handlers and peer messages never act on cross-cutting concerns
//! (voting, island transitions, gap draining) directly. They set a flag
//! here and the container consumes the accumulated set once the handler
//! has returned.

/// Accumulated framework events awaiting handling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FwkEventFlags {
    /// A subgraph changed lifecycle state.
    pub sg_state_change: bool,
    /// The container went from no started subgraph to some, or back.
    pub cntr_run_state_change: bool,
    /// KPPS/bandwidth scale factor changed.
    pub kpps_bw_scale_factor_change: bool,
    /// Upstream real-time classification changed on an input.
    pub rt_ftrt_change: bool,
    /// Some port's downgraded state changed or a port was closed.
    pub port_state_change: bool,
    /// Processing duration changed.
    pub proc_dur_change: bool,
    /// Container frame length changed.
    pub frame_len_change: bool,
    /// An upstream's frame length changed on an external input.
    pub upstream_frame_len_change: bool,
    /// A marker was inserted at a boundary and the gap must be drained.
    pub port_flushed: bool,
    /// Duty-cycling manager asked to unblock island entry.
    pub dcm_unblock_island_entry: bool,
    /// Duty-cycling manager asked to exit island.
    pub dcm_island_exit: bool,
    /// Island vote must be re-evaluated.
    pub reevaluate_island_vote: bool,
    /// A module was reconfigured; its load may have changed.
    pub module_cfg_change: bool,
}

impl FwkEventFlags {
    /// Returns `true` if no flag is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Returns the current flags and clears them.
    pub fn take(&mut self) -> FwkEventFlags {
        core::mem::take(self)
    }

    /// Flags that require a clock/bandwidth re-vote.
    pub fn needs_clock_vote(&self) -> bool {
        self.sg_state_change
            || self.cntr_run_state_change
            || self.kpps_bw_scale_factor_change
            || self.port_state_change
            || self.module_cfg_change
            || self.dcm_unblock_island_entry
            || self.dcm_island_exit
    }

    /// Flags that require a latency re-vote.
    pub fn needs_latency_vote(&self) -> bool {
        self.proc_dur_change
            || self.frame_len_change
            || self.cntr_run_state_change
            || self.dcm_unblock_island_entry
            || self.dcm_island_exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears() {
        let mut flags = FwkEventFlags {
            port_flushed: true,
            ..Default::default()
        };
        let taken = flags.take();
        assert!(taken.port_flushed);
        assert!(flags.is_empty());
    }

    #[test]
    fn state_and_island_changes_ask_for_votes() {
        let flags = FwkEventFlags {
            sg_state_change: true,
            dcm_island_exit: true,
            ..Default::default()
        };
        assert!(flags.needs_clock_vote());
        assert!(flags.needs_latency_vote());
    }
}
