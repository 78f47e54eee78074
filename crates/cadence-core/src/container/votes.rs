//! Framework events, power votes and duty-cycle requests.

use super::{AckPayload, Container, HeapKind};
use crate::duty_cycle::{DcmRequest, IslandAck};
use crate::error::{CntrError, CntrResult};
use crate::events::{EVENT_PERF_PARAMS_UPDATED, EventOwner};
use crate::flags::FwkEventFlags;
use crate::ids::{PathSelector, PortKey};
use crate::params::encode_words;
use crate::state::SubgraphState;

/// Rounds of framework-event handling per trigger; handling one round can
/// raise flags for the next.
const FWK_PASSES: usize = 4;

impl Container {
    /// Reacts to the framework flags raised since the last call.
    pub(super) fn handle_fwk_events(&mut self) {
        for _ in 0..FWK_PASSES {
            if self.fwk.is_empty() {
                return;
            }
            let flags = self.fwk.take();
            self.apply_fwk_flags(flags);
        }
        if !self.fwk.is_empty() {
            tracing::warn!(pending = ?self.fwk, "framework events still pending");
        }
    }

    fn apply_fwk_flags(&mut self, flags: FwkEventFlags) {
        tracing::trace!(?flags, "framework events");
        if flags.port_flushed {
            self.drain_markers();
        }
        if flags.frame_len_change || flags.upstream_frame_len_change {
            let ins: Vec<PortKey> = self.ext_in.keys().copied().collect();
            for key in ins {
                self.send_icb_info(key);
            }
            self.renegotiate_all();
        }
        if flags.frame_len_change {
            self.update_paths(PathSelector::All);
        }
        if flags.rt_ftrt_change || flags.port_state_change {
            self.inform_peers();
        }
        if flags.dcm_island_exit
            && let Err(err) = self.dcm.handle_exit(&self.settings.name)
        {
            tracing::warn!(error = %err, "island exit acknowledgment failed");
        }

        if self.voter.registered().is_none() {
            return;
        }
        if flags.needs_clock_vote() {
            self.vote_clock(flags.dcm_island_exit);
        }
        if flags.needs_latency_vote() {
            self.vote_latency(flags.dcm_island_exit);
        }
        if flags.dcm_unblock_island_entry
            || flags.reevaluate_island_vote
            || flags.sg_state_change
            || flags.dcm_island_exit
        {
            self.vote_island(flags.dcm_island_exit);
        }
    }

    fn vote_clock(&mut self, force: bool) {
        let load = self
            .graph
            .resources_where(|s| s.state == SubgraphState::Started);
        if self.is_voice() {
            if load != self.last_load {
                self.last_load = load;
                let n = self.events.raise(
                    EventOwner::Container,
                    EVENT_PERF_PARAMS_UPDATED,
                    &encode_words(&[load.kpps, load.bw_bytes_per_sec]),
                );
                tracing::debug!(kpps = load.kpps, bw = load.bw_bytes_per_sec, clients = n, "perf params updated");
            }
            return;
        }
        self.last_load = load;
        match self
            .voter
            .vote_clock(load, self.scale_q4, force, self.in_command)
        {
            Ok(outcome) => tracing::trace!(?outcome, kpps = load.kpps, "clock vote"),
            Err(err) => tracing::warn!(error = %err, "clock vote failed"),
        }
    }

    fn vote_latency(&mut self, force: bool) {
        if self.is_voice() {
            return;
        }
        let result = if self.any_started() {
            let rt = self.is_real_time();
            self.voter.vote_latency(self.proc_duration_us, rt, force)
        } else {
            self.voter.release_latency()
        };
        match result {
            Ok(outcome) => tracing::trace!(?outcome, proc_us = self.proc_duration_us, "latency vote"),
            Err(err) => tracing::warn!(error = %err, "latency vote failed"),
        }
    }

    fn vote_island(&mut self, force: bool) {
        if !self.settings.duty_cycling_allowed {
            return;
        }
        let allow = self.dcm.is_registered() && !self.dcm.module_disallows;
        match self.voter.vote_island(allow, force) {
            Ok(outcome) => tracing::trace!(?outcome, allow, "island vote"),
            Err(err) => tracing::warn!(error = %err, "island vote failed"),
        }
    }

    /// Recomputes the island veto: a module disallows duty cycling, or
    /// the container's memory does not live in the low-power heap.
    pub(super) fn refresh_island_veto(&mut self) {
        let off_island = self.settings.heap != HeapKind::LowPower;
        let veto = off_island || self.graph.any_module_disallows_duty_cycling();
        if veto != self.dcm.module_disallows {
            tracing::debug!(veto, off_island, "duty-cycling veto changed");
            self.dcm.module_disallows = veto;
            self.fwk.reevaluate_island_vote = true;
        }
    }

    pub(super) fn duty_cycle_request(&mut self, req: DcmRequest) -> CntrResult<AckPayload> {
        tracing::debug!(?req, "duty-cycle request");
        match req {
            DcmRequest::IslandEntry => {
                let ack = self.dcm.handle_entry(&self.settings.name)?;
                Ok(AckPayload::Island(ack))
            }
            DcmRequest::IslandExit => {
                self.fwk.dcm_island_exit = true;
                Ok(AckPayload::Island(IslandAck::ExitAllowed))
            }
            DcmRequest::UnblockIslandEntry => {
                self.fwk.dcm_unblock_island_entry = true;
                Ok(AckPayload::None)
            }
        }
    }

    /// Changes the clock scale factor (Q4, 16 is unity) and re-votes.
    pub fn set_kpps_scale(&mut self, scale_q4: u32) -> CntrResult<()> {
        if scale_q4 == 0 {
            return Err(CntrError::bad_param("scale factor 0"));
        }
        if scale_q4 != self.scale_q4 {
            self.scale_q4 = scale_q4;
            self.fwk.kpps_bw_scale_factor_change = true;
            self.update_proc_duration();
        }
        self.handle_fwk_events();
        Ok(())
    }
}
