//! Packed set/get configuration and event registration.

use super::{AckPayload, Container, FrameSize, HandleRest, Opcode, RestKind};
use crate::error::{BatchResult, CntrError, CntrResult};
use crate::events::{
    ClientAddress, EVENT_FRAME_DELIVERY_DONE, EVENT_PATH_DELAY_CHANGED,
    EVENT_PERF_PARAMS_UPDATED, EventOwner, Registration, RegistrationIter,
};
use crate::graph::EventTracking;
use crate::ids::ModuleId;
use crate::params::{
    self, Framing, PARAM_FRAME_SIZE, PARAM_PROC_DURATION, PARAM_PROC_PARAMS_INFO, ParamIter,
    ParamRecord, encode_words,
};

const CONTAINER_EVENTS: [u32; 3] = [
    EVENT_FRAME_DELIVERY_DONE,
    EVENT_PERF_PARAMS_UPDATED,
    EVENT_PATH_DELAY_CHANGED,
];

fn word(payload: &[u8], at: usize) -> CntrResult<u32> {
    params::read_u32(payload, at).ok_or_else(|| {
        CntrError::bad_param(format!("need {} bytes, got {}", at + 4, payload.len()))
    })
}

impl Container {
    pub(super) fn set_cfg(&mut self, framing: Framing, payload: Vec<u8>) -> CntrResult<AckPayload> {
        match self.apply_set_cfg(Opcode::SetCfg, framing, payload, None, BatchResult::new()) {
            Some(batch) => batch.into_result().map(|()| AckPayload::None),
            None => Ok(AckPayload::None),
        }
    }

    /// Applies records in order, skipping those at or before `resume_after`.
    ///
    /// Returns `None` if a record raised the stack requirement; the rest of
    /// the buffer is then parked for the relaunched thread.
    pub(super) fn apply_set_cfg(
        &mut self,
        opcode: Opcode,
        framing: Framing,
        payload: Vec<u8>,
        resume_after: Option<usize>,
        mut batch: BatchResult,
    ) -> Option<BatchResult> {
        let mut iter = ParamIter::new(&payload, framing);
        let mut parked = None;
        for entry in iter.by_ref() {
            if resume_after.is_some_and(|r| entry.offset <= r) {
                continue;
            }
            batch.record(self.set_param(entry.module, entry.param_id, entry.payload));
            if let Some(stack) = self.stack_needed() {
                parked = Some((entry.offset, stack));
                break;
            }
        }
        if iter.truncated() {
            batch.push(CntrError::bad_param("truncated parameter buffer"));
        }

        if let Some((offset, stack)) = parked {
            let kind = RestKind::SetCfg {
                framing,
                payload,
                resume_after: offset,
                batch,
            };
            self.handle_rest = Some(HandleRest::new(opcode, kind, stack));
            return None;
        }
        Some(batch)
    }

    pub(super) fn set_cfg_fragmented(&mut self, fragments: Vec<Vec<u8>>) -> CntrResult<AckPayload> {
        match self.apply_fragments(fragments, 0, BatchResult::new()) {
            Some(batch) => batch.into_result().map(|()| AckPayload::None),
            None => Ok(AckPayload::None),
        }
    }

    /// Applies per-instance fragments from index `next` on.
    pub(super) fn apply_fragments(
        &mut self,
        fragments: Vec<Vec<u8>>,
        next: usize,
        mut batch: BatchResult,
    ) -> Option<BatchResult> {
        let mut idx = next;
        while idx < fragments.len() {
            let fragment = &fragments[idx];
            if fragment.is_empty() {
                batch.push(CntrError::bad_param(format!("fragment {idx} is empty")));
            } else {
                let mut iter = ParamIter::new(fragment, Framing::PerInstance);
                for entry in iter.by_ref() {
                    batch.record(self.set_param(entry.module, entry.param_id, entry.payload));
                }
                if iter.truncated() {
                    batch.push(CntrError::bad_param(format!("fragment {idx} truncated")));
                }
            }
            if let Some(stack) = self.stack_needed() {
                tracing::debug!(fragment = idx, stack, "parking remaining fragments");
                let kind = RestKind::Fragments {
                    fragments,
                    next: idx + 1,
                    batch,
                };
                self.handle_rest = Some(HandleRest::new(Opcode::SetCfgFragmented, kind, stack));
                return None;
            }
            idx += 1;
        }
        Some(batch)
    }

    fn set_param(&mut self, module: ModuleId, param_id: u32, payload: &[u8]) -> CntrResult<()> {
        if module == self.settings.instance {
            return self.set_container_param(param_id, payload);
        }
        let node = self
            .graph
            .module_mut(module)
            .ok_or_else(|| CntrError::unexpected(format!("no module {module}")))?;
        node.module.set_param(param_id, payload)?;
        tracing::trace!(%module, param_id, len = payload.len(), "param set");
        self.fwk.module_cfg_change = true;
        self.refresh_island_veto();
        Ok(())
    }

    fn set_container_param(&mut self, param_id: u32, payload: &[u8]) -> CntrResult<()> {
        match param_id {
            PARAM_PROC_DURATION => {
                let us = word(payload, 0)?;
                if us == 0 {
                    return Err(CntrError::failed("processing duration 0"));
                }
                self.proc_duration_override = Some(us);
                self.update_proc_duration();
            }
            PARAM_FRAME_SIZE => {
                let size = match (word(payload, 0)?, word(payload, 4)?) {
                    (0, _) => FrameSize::Default,
                    (1 | 2, 0) => return Err(CntrError::bad_param("frame size 0")),
                    (1, us) => FrameSize::TimeUs(us),
                    (2, samples) => FrameSize::Samples(samples),
                    (kind, _) => {
                        return Err(CntrError::bad_param(format!("frame size kind {kind}")));
                    }
                };
                tracing::info!(?size, "frame size configured");
                self.settings.frame_size = size;
                self.update_frame_len();
            }
            PARAM_PROC_PARAMS_INFO => {
                return Err(CntrError::unsupported("processing info is read-only"));
            }
            other => {
                return Err(CntrError::unsupported(format!(
                    "container param 0x{other:X}"
                )));
            }
        }
        Ok(())
    }

    /// Reads every record; failed records come back with their error code.
    pub(super) fn get_cfg(&mut self, framing: Framing, payload: &[u8]) -> (CntrResult<()>, AckPayload) {
        let mut batch = BatchResult::new();
        let mut records = Vec::new();
        let mut iter = ParamIter::new(payload, framing);
        for entry in iter.by_ref() {
            let mut record = ParamRecord::new(entry.module, entry.param_id, Vec::new());
            match self.get_param(entry.module, entry.param_id) {
                Ok(value) => record.payload = value,
                Err(err) => {
                    record.error_code = err.code();
                    batch.push(err);
                }
            }
            records.push(record);
        }
        if iter.truncated() {
            batch.push(CntrError::bad_param("truncated parameter buffer"));
        }
        (
            batch.into_result(),
            AckPayload::Params(params::encode(framing, &records)),
        )
    }

    fn get_param(&mut self, module: ModuleId, param_id: u32) -> CntrResult<Vec<u8>> {
        if module == self.settings.instance {
            return match param_id {
                PARAM_PROC_PARAMS_INFO => Ok(encode_words(&[
                    self.frame.us,
                    self.period_us,
                    self.proc_duration_us,
                    u32::from(self.is_real_time()),
                ])),
                other => Err(CntrError::unsupported(format!(
                    "container param 0x{other:X} is not readable"
                ))),
            };
        }
        self.graph
            .module_mut(module)
            .ok_or_else(|| CntrError::unexpected(format!("no module {module}")))?
            .module
            .get_param(param_id)
    }

    pub(super) fn register_events(
        &mut self,
        client: ClientAddress,
        payload: &[u8],
    ) -> CntrResult<AckPayload> {
        let mut batch = BatchResult::new();
        let mut iter = RegistrationIter::new(payload);
        for reg in iter.by_ref() {
            batch.record(self.register_one(client, reg));
        }
        if iter.truncated() {
            batch.push(CntrError::bad_param("truncated registration buffer"));
        }
        batch.into_result().map(|()| AckPayload::None)
    }

    fn register_one(&mut self, client: ClientAddress, reg: Registration<'_>) -> CntrResult<()> {
        let owner = if reg.module == self.settings.instance {
            if !CONTAINER_EVENTS.contains(&reg.event_id) {
                return Err(CntrError::unsupported(format!(
                    "container event 0x{:X}",
                    reg.event_id
                )));
            }
            EventOwner::Container
        } else {
            let node = self
                .graph
                .module_mut(reg.module)
                .ok_or_else(|| CntrError::unexpected(format!("no module {}", reg.module)))?;
            match node.module.register_event(reg.event_id, reg.register, reg.cfg)? {
                EventTracking::Module => return Ok(()),
                EventTracking::Container => EventOwner::Module(reg.module),
            }
        };

        tracing::debug!(
            ?owner,
            event_id = reg.event_id,
            register = reg.register,
            domain = client.domain,
            port = client.port,
            "event registration"
        );
        if reg.register {
            self.events.register(owner, reg.event_id, client);
            Ok(())
        } else {
            self.events.deregister(owner, reg.event_id, client)
        }
    }
}
