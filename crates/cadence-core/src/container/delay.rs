//! Path delay as seen from inside one container.

use super::{AckPayload, Container, PathDelayOp};
use crate::error::{CntrError, CntrResult};
use crate::events::{EVENT_PATH_DELAY_CHANGED, EventOwner};
use crate::graph::PortDirection;
use crate::ids::{ModuleId, PathSelector, PortId, PortKey};
use crate::media::Scenario;
use crate::params::encode_words;
use crate::path_delay::{self, DelaySource};

impl DelaySource for Container {
    fn direction(&self, key: PortKey) -> Option<PortDirection> {
        self.graph.module(key.module)?.direction_of(key.port)
    }

    fn is_source_or_sink(&self, module: ModuleId) -> bool {
        self.graph
            .module(module)
            .is_some_and(|m| m.flags.is_source || m.flags.is_sink)
    }

    fn algorithmic_delay_us(
        &self,
        module: ModuleId,
        input: Option<PortId>,
        output: Option<PortId>,
    ) -> u32 {
        self.graph
            .module(module)
            .map_or(0, |m| m.module.algorithmic_delay_us(input, output))
    }

    /// Frames a faster upstream must queue before one local frame is full.
    fn ext_input_delay_us(&self, key: PortKey) -> Option<u32> {
        let ext = self.ext_in.get(&key)?;
        let inp = self.graph.in_port(key)?;
        if !inp.media.data_format.is_pcm_or_packetized() {
            return Some(0);
        }
        let us = ext.upstream_frame.us;
        let own = self.frame.us;
        if !inp.us_rt || us == 0 || own <= us {
            return Some(0);
        }
        Some((own.div_ceil(us) - 1) * us)
    }

    /// Buffers queued toward the downstream, plus the one-time pad.
    fn ext_output_delay_us(&self, key: PortKey) -> Option<u32> {
        let ext = self.ext_out.get(&key)?;
        let out = self.graph.out_port(key)?;
        if !out.media.data_format.is_pcm_or_packetized() {
            return Some(0);
        }
        let reg = if out.us_rt || self.scenario_of(key.module) == Scenario::Voice {
            0
        } else {
            ext.icb.reg_bufs
        };
        let frames = reg.saturating_add(ext.icb.prebufs);
        Some(
            frames
                .saturating_mul(self.frame.us)
                .saturating_add(ext.icb.otp_us),
        )
    }
}

impl Container {
    pub(super) fn path_delay(&mut self, op: PathDelayOp) -> CntrResult<AckPayload> {
        match op {
            PathDelayOp::Query { path } => {
                let d = path_delay::compute(&path, &*self);
                tracing::debug!(vertices = path.len(), total_us = d.total_us(), "path delay query");
                Ok(AckPayload::PathDelay(d))
            }
            PathDelayOp::Configure { id, path, sink } => {
                let d = path_delay::compute(&path, &*self);
                self.paths.configure(id, path, sink)?;
                tracing::info!(%id, total_us = d.total_us(), "path delay configured");
                self.update_paths(PathSelector::Path(id));
                Ok(AckPayload::PathDelay(d))
            }
            PathDelayOp::Update(selector) => {
                if let PathSelector::Path(id) = selector
                    && !self.paths.ids().any(|p| p == id)
                {
                    return Err(CntrError::bad_param(format!("no path {id}")));
                }
                self.update_paths(selector);
                Ok(AckPayload::None)
            }
            PathDelayOp::Destroy(selector) => {
                let removed = self.paths.destroy(selector)?;
                tracing::debug!(?selector, removed, "path delay destroyed");
                Ok(AckPayload::None)
            }
        }
    }

    /// Re-evaluates persisted paths and raises an event for each change.
    pub(super) fn update_paths(&mut self, selector: PathSelector) {
        if self.paths.is_empty() {
            return;
        }
        let mut paths = core::mem::take(&mut self.paths);
        let updates = paths.update(selector, &*self);
        self.paths = paths;

        for u in updates.into_iter().filter(|u| u.changed) {
            tracing::debug!(id = %u.id, delay_us = u.delay_us, "path delay changed");
            self.events.raise(
                EventOwner::Container,
                EVENT_PATH_DELAY_CHANGED,
                &encode_words(&[u.id.get(), u.delay_us]),
            );
        }
    }
}
