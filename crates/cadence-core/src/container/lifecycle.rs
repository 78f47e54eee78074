//! Graph open, connect, disconnect and subgraph lifecycle.

use std::collections::{BTreeMap, BTreeSet};

use super::{
    AckPayload, Container, ExternalInputDecl, GraphOpenRequest, HandleRest, Opcode, RestKind,
};
use crate::error::{BatchResult, CntrError, CntrResult};
use crate::event_loop::HandlerKind;
use crate::graph::{ModuleNode, PortDirection, PortOp};
use crate::icb::IcbResult;
use crate::ids::{PathSelector, PortId, PortKey, SubgraphId};
use crate::ports::{ExtCtrlPort, ExtInPort, ExtOutPort, PeerLink, PortEndpoint};
use crate::power::PmMode;
use crate::prebuffer::IngressQueue;
use crate::state::{PortState, SubgraphOp, SubgraphState};
use crate::transport::{BufferPool, Marker};

fn data_ports(node: &ModuleNode) -> Vec<(PortDirection, PortId)> {
    node.inputs
        .keys()
        .map(|&p| (PortDirection::Input, p))
        .chain(node.outputs.keys().map(|&p| (PortDirection::Output, p)))
        .collect()
}

/// Module port operations for one subgraph transition.
fn port_ops_for(op: SubgraphOp, current: SubgraphState) -> &'static [PortOp] {
    match (op, current) {
        (SubgraphOp::Prepare, SubgraphState::Stopped) => &[PortOp::Open],
        (SubgraphOp::Start, SubgraphState::Stopped) => &[PortOp::Open, PortOp::Start],
        (SubgraphOp::Start, SubgraphState::Started) => &[],
        (SubgraphOp::Start, _) => &[PortOp::Start],
        (SubgraphOp::Stop, SubgraphState::Stopped) => &[],
        (SubgraphOp::Stop, _) => &[PortOp::Stop],
        (SubgraphOp::Suspend, SubgraphState::Started) => &[PortOp::Suspend],
        _ => &[],
    }
}

impl Container {
    pub(super) fn graph_open(&mut self, req: GraphOpenRequest) -> CntrResult<AckPayload> {
        tracing::debug!(?req, "graph_open");
        let mut added = Vec::new();
        let endpoints = match self.open_inner(req, &mut added) {
            Ok(eps) => eps,
            Err(err) => {
                tracing::error!(error = %err, rolled_back = added.len(), "graph_open failed");
                for sg in added {
                    self.close_subgraph(sg);
                }
                self.after_close();
                return Err(err);
            }
        };

        self.refresh_island_veto();
        if self.settings.duty_cycling_allowed && self.graph.subgraph_count() > 0 {
            let log_id = self.settings.instance.0;
            if let Err(err) = self.dcm.register(&self.settings.name, log_id) {
                tracing::warn!(error = %err, "duty-cycle registration failed");
            }
            if let Err(err) = self
                .voter
                .register(&self.settings.name, PmMode::IslandDutyCycle)
            {
                tracing::warn!(error = %err, "island power registration failed");
            }
            self.fwk.reevaluate_island_vote = true;
        }
        self.update_port_states();

        tracing::info!(
            subgraphs = self.graph.subgraph_count(),
            endpoints = endpoints.len(),
            "graph opened"
        );
        let payload = AckPayload::Endpoints(endpoints);
        if let Some(stack) = self.stack_needed() {
            self.handle_rest = Some(HandleRest::new(
                Opcode::GraphOpen,
                RestKind::Reply(payload),
                stack,
            ));
            return Ok(AckPayload::None);
        }
        Ok(payload)
    }

    fn open_inner(
        &mut self,
        req: GraphOpenRequest,
        added: &mut Vec<SubgraphId>,
    ) -> CntrResult<Vec<PortEndpoint>> {
        for decl in &req.subgraphs {
            self.graph.add_subgraph(decl.id, decl.scenario)?;
            added.push(decl.id);
        }
        for spec in req.modules {
            self.graph.add_module(spec)?;
        }
        for (from, to) in req.links {
            self.graph.link(from, to)?;
        }

        let mut endpoints = Vec::new();
        for decl in req.external_inputs {
            endpoints.push(self.create_ext_input(decl)?);
        }
        for key in req.external_outputs {
            endpoints.push(self.create_ext_output(key)?);
        }
        for key in req.external_controls {
            endpoints.push(self.create_ext_control(key)?);
        }

        self.graph.update_sorted()?;
        self.graph.propagate_media_format();
        self.update_frame_len();
        Ok(endpoints)
    }

    fn sg_of_port(&self, key: PortKey) -> CntrResult<SubgraphId> {
        self.graph
            .sg_of(key.module)
            .ok_or_else(|| CntrError::bad_param(format!("no module for port {key}")))
    }

    fn create_ext_input(&mut self, decl: ExternalInputDecl) -> CntrResult<PortEndpoint> {
        let key = decl.key;
        let sg = self.sg_of_port(key)?;
        let signal = self
            .el
            .channel()
            .allocate()
            .ok_or_else(|| CntrError::not_ready(format!("no wait bit left for input {key}")))?;
        let bit = signal.bit();
        if let Err(err) = self.graph.mark_external_input(key) {
            self.el.channel().release(bit);
            return Err(err);
        }
        let policy = self.settings.policy;
        let ingress = IngressQueue::new(
            policy.ingress_prebuffer_retention as usize,
            policy.max_ingress_elements as usize,
        );
        let port = ExtInPort::new(key, sg, signal, ingress);
        if let Some(media) = decl.media
            && let Some(inp) = self.graph.in_port_mut(key)
        {
            inp.media = media;
        }
        let endpoint = port.endpoint(self.cmd_tx.clone());
        self.el.register(bit, HandlerKind::ExtInputData(key));
        self.ext_in.insert(key, port);
        tracing::debug!(port = %key, bit, "ext input created");
        Ok(endpoint)
    }

    fn create_ext_output(&mut self, key: PortKey) -> CntrResult<PortEndpoint> {
        let sg = self.sg_of_port(key)?;
        let signal = self
            .el
            .channel()
            .allocate()
            .ok_or_else(|| CntrError::not_ready(format!("no wait bit left for output {key}")))?;
        let bit = signal.bit();
        if let Err(err) = self.graph.mark_external_output(key) {
            self.el.channel().release(bit);
            return Err(err);
        }
        let port = ExtOutPort::new(key, sg).with_return_signal(signal);
        let endpoint = port.endpoint(self.cmd_tx.clone());
        self.el.register(bit, HandlerKind::ExtOutputReturn(key));
        self.ext_out.insert(key, port);
        tracing::debug!(port = %key, bit, "ext output created");
        Ok(endpoint)
    }

    fn create_ext_control(&mut self, key: PortKey) -> CntrResult<PortEndpoint> {
        let sg = self.sg_of_port(key)?;
        let has_port = self
            .graph
            .module(key.module)
            .is_some_and(|m| m.controls.contains(&key.port));
        if !has_port || self.ext_ctrl.contains_key(&key) {
            return Err(CntrError::bad_param(format!("{key} is not a free control port")));
        }
        let port = ExtCtrlPort::new(key, sg);
        let endpoint = port.endpoint(self.cmd_tx.clone());
        self.ext_ctrl.insert(key, port);
        Ok(endpoint)
    }

    /// Checks one link; `BadParam` for an unknown port, `Failed` if the
    /// port already has a peer.
    fn check_connectable(&self, link: &PeerLink) -> CntrResult<()> {
        let key = link.local();
        let connected = match link {
            PeerLink::Input { .. } => self.ext_in.get(&key).map(|p| p.upstream.is_some()),
            PeerLink::Output { .. } => self.ext_out.get(&key).map(|p| p.downstream.is_some()),
            PeerLink::Control { .. } => self.ext_ctrl.get(&key).map(|p| p.peer.is_some()),
        };
        match connected {
            None => Err(CntrError::bad_param(format!("{key} is not an external port of this kind"))),
            Some(true) => Err(CntrError::failed(format!("{key} is already connected"))),
            Some(false) => Ok(()),
        }
    }

    pub(super) fn graph_connect(&mut self, links: Vec<PeerLink>) -> CntrResult<AckPayload> {
        let mut seen = BTreeSet::new();
        for link in &links {
            self.check_connectable(link)?;
            if !seen.insert(link.local()) {
                return Err(CntrError::failed(format!(
                    "{} listed twice in one connect",
                    link.local()
                )));
            }
        }

        let mut new_inputs = Vec::new();
        let mut new_outputs = Vec::new();
        for link in links {
            match link {
                PeerLink::Input { local, upstream } => {
                    if let Some(port) = self.ext_in.get_mut(&local) {
                        tracing::debug!(port = %local, peer = %upstream.port, "ext input connected");
                        port.upstream = Some(upstream);
                        new_inputs.push(local);
                    }
                }
                PeerLink::Output {
                    local,
                    downstream,
                    data,
                } => {
                    if let Some(port) = self.ext_out.get_mut(&local) {
                        tracing::debug!(port = %local, peer = %downstream.port, "ext output connected");
                        port.downstream = Some(downstream);
                        port.data = Some(data);
                        new_outputs.push(local);
                    }
                }
                PeerLink::Control { local, peer } => {
                    if let Some(port) = self.ext_ctrl.get_mut(&local) {
                        port.peer = Some(peer);
                    }
                }
            }
        }

        if self.graph.attach_pending() > 0 && self.graph.update_sorted()? {
            self.graph.propagate_media_format();
            self.update_frame_len();
        }
        for key in new_inputs {
            self.send_icb_info(key);
        }
        for key in new_outputs {
            self.renegotiate_icb(key);
            self.send_media_format(key);
        }
        self.update_port_states();
        self.propagate_rt();
        self.inform_peers();
        Ok(AckPayload::None)
    }

    /// `None` for an unknown port, `Some(false)` if it has no peer.
    fn is_disconnect_needed(&self, key: PortKey) -> Option<bool> {
        if let Some(p) = self.ext_in.get(&key) {
            return Some(p.upstream.is_some());
        }
        if let Some(p) = self.ext_out.get(&key) {
            return Some(p.downstream.is_some());
        }
        self.ext_ctrl.get(&key).map(|p| p.peer.is_some())
    }

    pub(super) fn graph_disconnect(&mut self, ports: Vec<PortKey>) -> CntrResult<AckPayload> {
        let mut batch = BatchResult::new();
        for key in ports {
            match self.is_disconnect_needed(key) {
                None => batch.push(CntrError::bad_param(format!("no external port {key}"))),
                Some(false) => tracing::debug!(port = %key, "already disconnected"),
                Some(true) => self.disconnect_port(key),
            }
        }
        self.update_port_states();
        self.propagate_rt();
        self.inform_peers();
        batch.into_result().map(|()| AckPayload::None)
    }

    fn disconnect_port(&mut self, key: PortKey) {
        if let Some(port) = self.ext_in.get_mut(&key) {
            port.upstream = None;
            port.reset_propagation();
            let dropped = port.drop_data();
            port.connected_state = PortState::Stopped;
            if let Some(inp) = self.graph.in_port_mut(key) {
                inp.us_rt = false;
                inp.at_gap = true;
            }
            tracing::debug!(port = %key, dropped, "ext input disconnected");
        } else if let Some(port) = self.ext_out.get_mut(&key) {
            port.reset_peer();
            port.icb = IcbResult::default();
            port.pool = BufferPool::default();
            port.connected_state = PortState::Stopped;
            port.prebuffers_pending = false;
            if let Some(out) = self.graph.out_port_mut(key) {
                out.ds_rt = false;
            }
            tracing::debug!(port = %key, "ext output disconnected");
        } else if let Some(port) = self.ext_ctrl.get_mut(&key) {
            port.peer = None;
            port.connected_state = PortState::Stopped;
        }
        self.fwk.port_state_change = true;
    }

    pub(super) fn is_external(&self, key: PortKey) -> bool {
        self.ext_in.contains_key(&key)
            || self.ext_out.contains_key(&key)
            || self.ext_ctrl.contains_key(&key)
    }

    fn port_sg(&self, key: PortKey) -> Option<SubgraphId> {
        self.ext_in
            .get(&key)
            .map(|p| p.sg)
            .or_else(|| self.ext_out.get(&key).map(|p| p.sg))
            .or_else(|| self.ext_ctrl.get(&key).map(|p| p.sg))
    }

    pub(super) fn graph_mgmt(
        &mut self,
        op: SubgraphOp,
        subgraphs: Vec<SubgraphId>,
        ports: Vec<PortKey>,
    ) -> CntrResult<AckPayload> {
        let mut batch = BatchResult::new();
        let mut sgs = Vec::with_capacity(subgraphs.len());
        for id in subgraphs {
            if self.graph.subgraph(id).is_some() {
                sgs.push(id);
            } else {
                batch.push(CntrError::bad_param(format!("no subgraph {id}")));
            }
        }
        let mut listed = Vec::with_capacity(ports.len());
        for key in ports {
            if self.is_external(key) {
                listed.push(key);
            } else {
                batch.push(CntrError::bad_param(format!("no external port {key}")));
            }
        }
        tracing::info!(%op, subgraphs = ?sgs, ports = listed.len(), "graph_mgmt");

        let was_running = self.any_started();
        if op == SubgraphOp::Close {
            let stray: Vec<PortKey> = listed
                .iter()
                .copied()
                .filter(|&k| self.port_sg(k).is_some_and(|sg| !sgs.contains(&sg)))
                .collect();
            for key in stray {
                self.close_port(key);
            }
            for &sg in &sgs {
                self.close_subgraph(sg);
            }
            self.after_close();
        } else {
            for &sg in &sgs {
                batch.record(self.transition(op, sg, &sgs, &listed));
            }
            let state = op.port_state();
            if state != PortState::Invalid {
                for &key in &listed {
                    self.apply_connected_state(key, state);
                }
            }
        }

        self.update_port_states();
        if op.repropagates_rt() || op == SubgraphOp::Start {
            self.propagate_rt();
        }
        if matches!(op, SubgraphOp::Prepare | SubgraphOp::Start) {
            self.prepare_boundaries();
        }
        self.inform_peers();
        if op == SubgraphOp::Start {
            self.process_all_inputs();
        }

        if !sgs.is_empty() {
            self.fwk.sg_state_change = true;
        }
        if was_running != self.any_started() {
            self.fwk.cntr_run_state_change = true;
        }
        batch.into_result().map(|()| AckPayload::None)
    }

    fn apply_connected_state(&mut self, key: PortKey, state: PortState) {
        if let Some(p) = self.ext_in.get_mut(&key) {
            p.connected_state = state;
        } else if let Some(p) = self.ext_out.get_mut(&key) {
            p.connected_state = state;
        } else if let Some(p) = self.ext_ctrl.get_mut(&key) {
            p.connected_state = state;
        }
    }

    fn transition(
        &mut self,
        op: SubgraphOp,
        sg: SubgraphId,
        listed_sgs: &[SubgraphId],
        listed_ports: &[PortKey],
    ) -> CntrResult<()> {
        let current = self.graph.sg_state(sg);
        let next = match op {
            SubgraphOp::Prepare if current == SubgraphState::Stopped => SubgraphState::Prepared,
            SubgraphOp::Start => SubgraphState::Started,
            SubgraphOp::Stop => SubgraphState::Stopped,
            SubgraphOp::Suspend if current == SubgraphState::Started => SubgraphState::Suspended,
            _ => current,
        };

        let mut batch = BatchResult::new();
        for &port_op in port_ops_for(op, current) {
            for node in self.graph.modules_mut().filter(|m| m.sg == sg) {
                for (dir, port) in data_ports(node) {
                    batch.record(node.module.port_operation(dir, port, port_op));
                }
            }
        }

        let crosses_boundary = match op {
            SubgraphOp::Suspend => current == SubgraphState::Started,
            SubgraphOp::Stop | SubgraphOp::Flush => current != SubgraphState::Stopped,
            _ => false,
        };
        if crosses_boundary {
            self.mark_boundaries(op, sg, listed_sgs, listed_ports);
        }
        if matches!(op, SubgraphOp::Stop | SubgraphOp::Flush) {
            self.flush_inputs_of(sg);
        }

        if let Some(s) = self.graph.subgraph_mut(sg)
            && s.state != next
        {
            tracing::debug!(%sg, from = %current, to = %next, "subgraph state");
            s.state = next;
        }
        batch.into_result()
    }

    /// Queues an end-of-stream (or a discontinuity for suspend) on every
    /// output leaving `sg` toward something that keeps running.
    fn mark_boundaries(
        &mut self,
        op: SubgraphOp,
        sg: SubgraphId,
        listed_sgs: &[SubgraphId],
        listed_ports: &[PortKey],
    ) {
        let marker = if op == SubgraphOp::Suspend {
            Marker::Discontinuity
        } else {
            Marker::FlushingEos
        };
        let sg_by_module: BTreeMap<_, _> = self.graph.modules().map(|m| (m.id, m.sg)).collect();
        let mut marked = 0usize;
        for node in self.graph.modules_mut().filter(|m| m.sg == sg) {
            let module = node.id;
            for (&pid, out) in node.outputs.iter_mut() {
                let leaves = if out.external {
                    !listed_ports.contains(&PortKey { module, port: pid })
                } else {
                    out.downstream
                        .and_then(|d| sg_by_module.get(&d.module))
                        .is_some_and(|s| *s != sg && !listed_sgs.contains(s))
                };
                if !leaves || (marker == Marker::FlushingEos && out.us_rt) {
                    continue;
                }
                out.markers.push(marker);
                marked += 1;
            }
        }
        if marked > 0 {
            tracing::debug!(%sg, ?marker, marked, "boundary markers queued");
            self.fwk.port_flushed = true;
        }
    }

    fn flush_inputs_of(&mut self, sg: SubgraphId) {
        for port in self.ext_in.values_mut().filter(|p| p.sg == sg) {
            let dropped = port.drop_data();
            if dropped > 0 {
                tracing::debug!(port = %port.key, dropped, "ext input flushed");
            }
        }
        for node in self.graph.modules_mut().filter(|m| m.sg == sg) {
            for inp in node.inputs.values_mut() {
                inp.at_gap = true;
            }
        }
    }

    /// Closes one external port whose subgraph stays open.
    fn close_port(&mut self, key: PortKey) {
        if self.ext_in.contains_key(&key) {
            let propagates = self
                .graph
                .module(key.module)
                .is_some_and(|m| m.flags.propagates_metadata);
            let at_gap = self.graph.in_port(key).is_none_or(|p| p.at_gap);
            if propagates && !at_gap {
                let first = self.graph.module(key.module).and_then(ModuleNode::first_output);
                if let Some(port) = first
                    && let Some(out) = self.graph.out_port_mut(PortKey { module: key.module, port })
                {
                    out.markers.push(Marker::FlushingEos);
                    self.fwk.port_flushed = true;
                }
            }
            self.port_operation(key, PortDirection::Input, PortOp::Close);
            self.disconnect_port(key);
            self.remove_ext_input(key);
            if let Some(inp) = self.graph.in_port_mut(key) {
                inp.external = false;
            }
        } else if self.ext_out.contains_key(&key) {
            self.port_operation(key, PortDirection::Output, PortOp::Close);
            self.remove_ext_output(key);
            if let Some(out) = self.graph.out_port_mut(key) {
                out.external = false;
                out.ds_rt = false;
            }
        } else {
            self.ext_ctrl.remove(&key);
        }
        tracing::debug!(port = %key, "external port closed");
        self.fwk.port_state_change = true;
    }

    fn port_operation(&mut self, key: PortKey, dir: PortDirection, op: PortOp) {
        if let Some(node) = self.graph.module_mut(key.module)
            && let Err(err) = node.module.port_operation(dir, key.port, op)
        {
            tracing::warn!(port = %key, ?op, error = %err, "port operation failed");
        }
    }

    fn remove_ext_input(&mut self, key: PortKey) {
        if let Some(port) = self.ext_in.remove(&key) {
            let bit = port.bit();
            self.el.unregister(bit);
            self.el.channel().release(bit);
        }
    }

    fn remove_ext_output(&mut self, key: PortKey) {
        if let Some(bit) = self.ext_out.remove(&key).and_then(|p| p.bit()) {
            self.el.unregister(bit);
            self.el.channel().release(bit);
        }
    }

    fn close_subgraph(&mut self, sg: SubgraphId) {
        for node in self.graph.modules_mut().filter(|m| m.sg == sg) {
            for (dir, port) in data_ports(node) {
                if let Err(err) = node.module.port_operation(dir, port, PortOp::Close) {
                    tracing::warn!(module = %node.id, %port, error = %err, "close failed");
                }
            }
        }
        let ins: Vec<PortKey> = self
            .ext_in
            .values()
            .filter(|p| p.sg == sg)
            .map(|p| p.key)
            .collect();
        for key in ins {
            self.remove_ext_input(key);
        }
        let outs: Vec<PortKey> = self
            .ext_out
            .values()
            .filter(|p| p.sg == sg)
            .map(|p| p.key)
            .collect();
        for key in outs {
            self.remove_ext_output(key);
        }
        self.ext_ctrl.retain(|_, p| p.sg != sg);

        let removed = self.graph.remove_subgraph(sg);
        for node in &removed {
            self.events.remove_module(node.id);
        }
        tracing::info!(%sg, modules = removed.len(), "subgraph closed");
        self.fwk.port_state_change = true;
    }

    fn after_close(&mut self) {
        if let Err(err) = self.graph.update_sorted() {
            tracing::warn!(error = %err, "sort after close failed");
        }
        self.refresh_island_veto();
        self.update_frame_len();
        if self.graph.subgraph_count() == 0 && self.settings.duty_cycling_allowed {
            if let Err(err) = self.dcm.deregister(&self.settings.name) {
                tracing::warn!(error = %err, "duty-cycle deregistration failed");
            }
            if self.voter.registered().is_some()
                && let Err(err) = self.voter.register(&self.settings.name, PmMode::Default)
            {
                tracing::warn!(error = %err, "power re-registration failed");
            }
        }
    }

    pub(super) fn destroy(&mut self) -> CntrResult<AckPayload> {
        let sgs: Vec<SubgraphId> = self.graph.subgraphs().map(|s| s.id).collect();
        for sg in sgs {
            self.close_subgraph(sg);
        }
        self.after_close();
        self.voter.deregister()?;
        tracing::info!("container destroyed");
        Ok(AckPayload::None)
    }

    /// Re-derives every port's downgraded state.
    pub(super) fn update_port_states(&mut self) {
        let sg_states: BTreeMap<SubgraphId, PortState> = self
            .graph
            .subgraphs()
            .map(|s| (s.id, s.state.into()))
            .collect();
        let mut changed = 0usize;

        for node in self.graph.modules_mut() {
            let own = sg_states.get(&node.sg).copied().unwrap_or_default();
            let module = node.id;
            for (&port, inp) in node.inputs.iter_mut() {
                let key = PortKey { module, port };
                let state = match self.ext_in.get_mut(&key) {
                    Some(ext) => {
                        let state = own.downgrade(ext.connected_state);
                        if state == PortState::Started && inp.state != PortState::Started {
                            ext.ingress.start_retention();
                        }
                        state
                    }
                    None => own,
                };
                if state != inp.state {
                    inp.state = state;
                    changed += 1;
                }
            }
            for (&port, out) in node.outputs.iter_mut() {
                let key = PortKey { module, port };
                let state = match self.ext_out.get_mut(&key) {
                    Some(ext) => {
                        let mut state = own.downgrade(ext.connected_state);
                        if ext.propagated_state != PortState::Invalid {
                            state = state.downgrade(ext.propagated_state);
                        }
                        if state == PortState::Started
                            && out.state != PortState::Started
                            && (ext.icb.prebufs > 0 || ext.icb.otp_us > 0)
                        {
                            ext.prebuffers_pending = true;
                        }
                        state
                    }
                    None => own,
                };
                if state != out.state {
                    out.state = state;
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            tracing::debug!(changed, "port states updated");
            self.fwk.port_state_change = true;
        }
    }

    /// Returns `true` when an external output may hold buffers.
    pub(super) fn ext_out_ready(&self, key: PortKey) -> bool {
        self.ext_out.get(&key).is_some_and(|p| {
            PortState::from(self.graph.sg_state(p.sg))
                .downgrade(p.connected_state)
                .is_prepared_or_started()
        })
    }

    /// Resolves media format and buffering on every boundary.
    fn prepare_boundaries(&mut self) {
        self.graph.propagate_media_format();
        self.update_frame_len();
        let ins: Vec<PortKey> = self.ext_in.keys().copied().collect();
        for key in ins {
            self.send_icb_info(key);
        }
        let outs: Vec<PortKey> = self.ext_out.keys().copied().collect();
        for key in outs {
            self.renegotiate_icb(key);
            self.send_media_format(key);
        }
        self.update_paths(PathSelector::All);
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{container, exec, module, one_sg_request};
    use super::super::*;
    use super::port_ops_for;
    use crate::graph::PortOp;
    use crate::ids::{PortId, SubgraphId};
    use crate::state::SubgraphOp;
    use crate::ErrorKind;

    fn mgmt(op: SubgraphOp, sgs: &[u32], ports: &[PortKey]) -> Command {
        Command::GraphMgmt {
            op,
            subgraphs: sgs.iter().map(|&s| SubgraphId(s)).collect(),
            ports: ports.to_vec(),
        }
    }

    #[test]
    fn failed_open_rolls_back_new_subgraphs() {
        let (mut cntr, _) = container();
        let mut req = one_sg_request();
        req.links.push((PortKey::new(0x10, 1), PortKey::new(0x99, 0)));
        let ack = exec(&mut cntr, Command::GraphOpen(req));
        assert_eq!(ack.result.unwrap_err().kind(), ErrorKind::BadParam);
        assert_eq!(cntr.graph().subgraph_count(), 0);
        assert!(cntr.ext_input(PortKey::new(0x10, 0)).is_none());
        // only the command bit is left
        assert_eq!(cntr.wait_mask().count_ones(), 1);
    }

    #[test]
    fn lifecycle_walks_states_and_port_ops() {
        let (mut cntr, _) = container();
        assert!(exec(&mut cntr, Command::GraphOpen(one_sg_request())).result.is_ok());
        let sg = SubgraphId(1);

        assert!(exec(&mut cntr, mgmt(SubgraphOp::Prepare, &[1], &[])).result.is_ok());
        assert_eq!(cntr.sg_state(sg), SubgraphState::Prepared);
        assert!(exec(&mut cntr, mgmt(SubgraphOp::Start, &[1], &[])).result.is_ok());
        assert_eq!(cntr.sg_state(sg), SubgraphState::Started);
        assert!(exec(&mut cntr, mgmt(SubgraphOp::Suspend, &[1], &[])).result.is_ok());
        assert_eq!(cntr.sg_state(sg), SubgraphState::Suspended);
        assert!(exec(&mut cntr, mgmt(SubgraphOp::Flush, &[1], &[])).result.is_ok());
        assert_eq!(cntr.sg_state(sg), SubgraphState::Suspended);
        assert!(exec(&mut cntr, mgmt(SubgraphOp::Stop, &[1], &[])).result.is_ok());
        assert_eq!(cntr.sg_state(sg), SubgraphState::Stopped);
        assert!(exec(&mut cntr, mgmt(SubgraphOp::Close, &[1], &[])).result.is_ok());
        assert_eq!(cntr.graph().subgraph_count(), 0);
    }

    #[test]
    fn port_ops_follow_transition() {
        assert_eq!(
            port_ops_for(SubgraphOp::Start, SubgraphState::Stopped),
            &[PortOp::Open, PortOp::Start]
        );
        assert!(port_ops_for(SubgraphOp::Start, SubgraphState::Started).is_empty());
        assert_eq!(
            port_ops_for(SubgraphOp::Start, SubgraphState::Suspended),
            &[PortOp::Start]
        );
        assert!(port_ops_for(SubgraphOp::Suspend, SubgraphState::Prepared).is_empty());
        assert!(port_ops_for(SubgraphOp::Stop, SubgraphState::Stopped).is_empty());
    }

    #[test]
    fn unknown_subgraph_is_reported_but_others_proceed() {
        let (mut cntr, _) = container();
        exec(&mut cntr, Command::GraphOpen(one_sg_request()));
        let ack = exec(&mut cntr, mgmt(SubgraphOp::Prepare, &[1, 7], &[]));
        assert_eq!(ack.result.unwrap_err().kind(), ErrorKind::BadParam);
        assert_eq!(cntr.sg_state(SubgraphId(1)), SubgraphState::Prepared);
    }

    #[test]
    fn connect_rejects_unknown_and_duplicate_ports() {
        let (mut a, _) = container();
        let (mut b, _) = container();
        let AckPayload::Endpoints(a_eps) = exec(&mut a, Command::GraphOpen(one_sg_request())).payload
        else {
            panic!("endpoints expected");
        };
        let AckPayload::Endpoints(b_eps) = exec(&mut b, Command::GraphOpen(one_sg_request())).payload
        else {
            panic!("endpoints expected");
        };
        let a_out = PortKey::new(0x10, 1);
        let b_in = b_eps
            .iter()
            .find(|e| matches!(e, crate::ports::PortEndpoint::Input { .. }))
            .unwrap();

        let bad = crate::ports::PeerLink::output_to(PortKey::new(0x10, 9), b_in).unwrap();
        let ack = exec(&mut a, Command::GraphConnect(vec![bad]));
        assert_eq!(ack.result.unwrap_err().kind(), ErrorKind::BadParam);

        let link = crate::ports::PeerLink::output_to(a_out, b_in).unwrap();
        let ack = exec(&mut a, Command::GraphConnect(vec![link.clone(), link.clone()]));
        assert_eq!(ack.result.unwrap_err().kind(), ErrorKind::Failed);
        assert!(a.ext_output(a_out).unwrap().downstream.is_none());

        assert!(exec(&mut a, Command::GraphConnect(vec![link.clone()])).result.is_ok());
        let ack = exec(&mut a, Command::GraphConnect(vec![link]));
        assert_eq!(ack.result.unwrap_err().kind(), ErrorKind::Failed);
        assert!(!a_eps.is_empty());

        let ack = exec(&mut a, Command::GraphDisconnect(vec![a_out, PortKey::new(0x77, 0)]));
        assert_eq!(ack.result.unwrap_err().kind(), ErrorKind::BadParam);
        assert!(a.ext_output(a_out).unwrap().downstream.is_none());
    }

    #[test]
    fn elementary_modules_attach_at_connect() {
        let (mut cntr, _) = container();
        let mut req = one_sg_request();
        let mut extra = module(0x20, 1, &[], &[]);
        extra.flags.elementary = true;
        req.modules.push(extra);
        exec(&mut cntr, Command::GraphOpen(req));
        assert_eq!(cntr.graph().pending_count(), 1);
        assert!(exec(&mut cntr, Command::GraphConnect(Vec::new())).result.is_ok());
        assert_eq!(cntr.graph().pending_count(), 0);
        assert!(cntr.graph().sorted().contains(&crate::ids::ModuleId(0x20)));
    }

    #[test]
    fn stop_queues_eos_on_internal_link_to_running_subgraph() {
        let (mut cntr, _) = container();
        let mut req = one_sg_request();
        req.subgraphs.push(SubgraphDecl {
            id: SubgraphId(2),
            scenario: crate::media::Scenario::Default,
        });
        req.modules.push(module(0x20, 2, &[0], &[1]));
        req.modules.push(module(0x21, 1, &[], &[1]));
        req.links.push((PortKey::new(0x21, 1), PortKey::new(0x20, 0)));
        exec(&mut cntr, Command::GraphOpen(req));
        exec(&mut cntr, mgmt(SubgraphOp::Start, &[1, 2], &[]));
        cntr.graph
            .in_port_mut(PortKey::new(0x20, 0))
            .unwrap()
            .at_gap = false;
        exec(&mut cntr, mgmt(SubgraphOp::Stop, &[1], &[]));
        // the marker was drained into the downstream input
        assert!(cntr.graph().in_port(PortKey::new(0x20, 0)).unwrap().at_gap);
        assert!(
            cntr.graph()
                .out_port(PortKey::new(0x21, 1))
                .unwrap()
                .markers
                .is_empty()
        );
    }

    #[test]
    fn closing_an_external_input_releases_its_bit() {
        let (mut cntr, _) = container();
        exec(&mut cntr, Command::GraphOpen(one_sg_request()));
        let key = PortKey::new(0x10, 0);
        assert_eq!(cntr.wait_mask().count_ones(), 3);
        let mut req = GraphOpenRequest::default();
        req.subgraphs.push(SubgraphDecl {
            id: SubgraphId(2),
            scenario: crate::media::Scenario::Default,
        });
        exec(&mut cntr, Command::GraphOpen(req));

        assert!(exec(&mut cntr, mgmt(SubgraphOp::Close, &[2], &[key])).result.is_ok());
        assert!(cntr.ext_input(key).is_none());
        assert!(!cntr.graph().in_port(key).unwrap().external);
        assert_eq!(cntr.wait_mask().count_ones(), 2);
        assert_eq!(cntr.graph().subgraph_count(), 1);
    }

    #[test]
    fn start_sends_open_and_start_port_ops() {
        use std::sync::Arc;
        use parking_lot::Mutex;

        #[derive(Default)]
        struct Spy(Arc<Mutex<Vec<PortOp>>>);
        impl crate::graph::Module for Spy {
            fn port_operation(
                &mut self,
                _direction: crate::graph::PortDirection,
                _port: PortId,
                op: PortOp,
            ) -> CntrResult<()> {
                self.0.lock().push(op);
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (mut cntr, _) = container();
        let mut req = one_sg_request();
        req.modules[0].module = Box::new(Spy(Arc::clone(&seen)));
        exec(&mut cntr, Command::GraphOpen(req));
        exec(&mut cntr, mgmt(SubgraphOp::Start, &[1], &[]));
        // one input and one output
        assert_eq!(
            seen.lock().as_slice(),
            &[PortOp::Open, PortOp::Open, PortOp::Start, PortOp::Start]
        );
    }
}
