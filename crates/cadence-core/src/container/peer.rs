//! Messages exchanged with peer containers.
//!
//! Outbound: real-time flags and topology state (send-once-per-change),
//! buffering info from inputs, media format from outputs. Inbound: the
//! same, plus the upstream-stopped acknowledgment.

use super::{AckPayload, Command, Container};
use crate::error::{CntrError, CntrResult};
use crate::icb::{self, IcbInfo, IcbInputs, IcbLocal};
use crate::ids::{PathSelector, PortKey};
use crate::media::{FrameLength, MediaFormat};
use crate::propagation::{MAX_PROPERTIES_PER_MESSAGE, PortProperty, SendOutcome, batch_properties};
use crate::state::{PortState, SubgraphState};

/// Buffer size used when the frame length does not yet map to bytes.
pub(crate) const FALLBACK_BUF_BYTES: usize = 4096;

fn log_outcome(port: PortKey, what: &str, outcome: &SendOutcome) {
    match outcome {
        SendOutcome::Suppressed => {}
        SendOutcome::Sent => tracing::debug!(%port, what, "property sent"),
        SendOutcome::Failed(err) => {
            tracing::warn!(%port, what, error = %err, "property send failed, will retry")
        }
    }
}

impl Container {
    /// Re-propagates real-time flags through the graph.
    pub(super) fn propagate_rt(&mut self) -> bool {
        let changes = self.graph.propagate_rt();
        if changes.is_empty() {
            return false;
        }
        tracing::debug!(
            inputs = changes.us_rt_inputs.len(),
            outputs = changes.ds_rt_outputs.len(),
            "real-time flags changed"
        );
        self.fwk.rt_ftrt_change = true;
        true
    }

    /// Sends whatever changed to every connected peer.
    pub(super) fn inform_peers(&mut self) {
        let ins: Vec<PortKey> = self.ext_in.keys().copied().collect();
        for key in ins {
            self.inform_upstream(key);
        }
        let outs: Vec<PortKey> = self.ext_out.keys().copied().collect();
        for key in outs {
            self.inform_downstream(key);
        }
    }

    fn inform_upstream(&mut self, key: PortKey) {
        let Some(inp) = self.graph.in_port(key) else {
            return;
        };
        let (ds_rt, state) = (inp.ds_rt, inp.state);
        let Some(port) = self.ext_in.get_mut(&key) else {
            return;
        };
        let Some(upstream) = port.upstream.clone() else {
            return;
        };

        let mut props = Vec::with_capacity(MAX_PROPERTIES_PER_MESSAGE);
        if port.connected_state.is_prepared_or_started() && port.ds_rt_prop.needs_send(ds_rt) {
            props.push(PortProperty::IsDownstreamRt(ds_rt));
        }
        if state.is_propagatable_upstream() && port.state_prop.needs_send(state) {
            props.push(PortProperty::TopoState(state));
        }
        if props.is_empty() {
            return;
        }

        let sent: CntrResult<()> = batch_properties(&props).try_for_each(|chunk| {
            upstream.send(Command::PortProperty {
                port: upstream.port,
                properties: chunk.to_vec(),
            })
        });
        for prop in props {
            match prop {
                PortProperty::IsDownstreamRt(v) => {
                    let outcome = port.ds_rt_prop.try_send(v, |_| sent.clone());
                    log_outcome(key, "ds_rt", &outcome);
                }
                PortProperty::TopoState(s) => {
                    let outcome = port.state_prop.try_send(s, |_| sent.clone());
                    log_outcome(key, "topo_state", &outcome);
                }
                PortProperty::IsUpstreamRt(_) => {}
            }
        }
    }

    fn inform_downstream(&mut self, key: PortKey) {
        let Some(us_rt) = self.graph.out_port(key).map(|o| o.us_rt) else {
            return;
        };
        let Some(port) = self.ext_out.get_mut(&key) else {
            return;
        };
        if !port.connected_state.is_prepared_or_started() {
            return;
        }
        let Some(downstream) = port.downstream.clone() else {
            return;
        };
        let outcome = port.us_rt_prop.try_send(us_rt, |v| {
            downstream.send(Command::PortProperty {
                port: downstream.port,
                properties: vec![PortProperty::IsUpstreamRt(v)],
            })
        });
        log_outcome(key, "us_rt", &outcome);
    }

    pub(super) fn peer_property(
        &mut self,
        port: PortKey,
        properties: Vec<PortProperty>,
    ) -> CntrResult<AckPayload> {
        if properties.is_empty() || properties.len() > MAX_PROPERTIES_PER_MESSAGE {
            return Err(CntrError::bad_param(format!(
                "{} properties in one message",
                properties.len()
            )));
        }
        for prop in properties {
            tracing::debug!(%port, ?prop, "peer property");
            match prop {
                PortProperty::IsUpstreamRt(v) => {
                    let inp = self
                        .graph
                        .in_port_mut(port)
                        .filter(|p| p.external)
                        .ok_or_else(|| CntrError::bad_param(format!("{port} is not an external input")))?;
                    let changed = inp.us_rt != v;
                    inp.us_rt = v;
                    if changed {
                        self.fwk.rt_ftrt_change = true;
                    }
                }
                PortProperty::IsDownstreamRt(v) => {
                    let out = self
                        .graph
                        .out_port_mut(port)
                        .filter(|p| p.external)
                        .ok_or_else(|| CntrError::bad_param(format!("{port} is not an external output")))?;
                    let changed = out.ds_rt != v;
                    out.ds_rt = v;
                    if changed {
                        self.fwk.rt_ftrt_change = true;
                    }
                }
                PortProperty::TopoState(state) => {
                    let ext = self
                        .ext_out
                        .get_mut(&port)
                        .ok_or_else(|| CntrError::bad_param(format!("{port} is not an external output")))?;
                    ext.propagated_state = state;
                    if state == PortState::Stopped {
                        ext.prebuffers_pending = false;
                        if let Some(ds) = &ext.downstream
                            && let Err(err) = ds.send(Command::UpstreamStopped { port: ds.port })
                        {
                            tracing::warn!(%port, error = %err, "upstream-stopped not delivered");
                        }
                    }
                }
            }
        }

        self.propagate_rt();
        self.renegotiate_all();
        self.update_port_states();
        self.inform_peers();
        Ok(AckPayload::None)
    }

    pub(super) fn peer_icb_info(&mut self, port: PortKey, info: IcbInfo) -> CntrResult<AckPayload> {
        let ext = self
            .ext_out
            .get_mut(&port)
            .ok_or_else(|| CntrError::bad_param(format!("{port} is not an external output")))?;
        tracing::debug!(%port, frame_us = info.frame.us, period_us = info.period_us, "icb info received");
        ext.ds_info = Some(info);
        self.renegotiate_icb(port);
        Ok(AckPayload::None)
    }

    pub(super) fn peer_upstream_stopped(&mut self, port: PortKey) -> CntrResult<AckPayload> {
        let ext = self
            .ext_in
            .get_mut(&port)
            .ok_or_else(|| CntrError::bad_param(format!("{port} is not an external input")))?;
        let dropped = ext.drop_data();
        if let Some(inp) = self.graph.in_port_mut(port) {
            inp.at_gap = true;
        }
        tracing::debug!(%port, dropped, "upstream stopped");
        Ok(AckPayload::None)
    }

    pub(super) fn peer_media_format(
        &mut self,
        port: PortKey,
        format: MediaFormat,
        frame: FrameLength,
    ) -> CntrResult<AckPayload> {
        let ext = self
            .ext_in
            .get_mut(&port)
            .ok_or_else(|| CntrError::bad_param(format!("{port} is not an external input")))?;
        if ext.connected_state == PortState::Started
            && self.graph.sg_state(ext.sg) == SubgraphState::Started
        {
            return Err(CntrError::unsupported(format!(
                "media format change on running input {port}"
            )));
        }
        if ext.upstream.is_none() {
            tracing::debug!(%port, "media format from unconnected upstream dropped");
            return Ok(AckPayload::None);
        }
        if ext.upstream_frame.differs_from(&frame) {
            self.fwk.upstream_frame_len_change = true;
        }
        ext.upstream_frame = frame;
        if let Some(inp) = self.graph.in_port_mut(port) {
            inp.media = format;
        }
        tracing::debug!(%port, ?format, frame_us = frame.us, "media format received");

        let changed = self.graph.propagate_media_format();
        self.update_frame_len();
        for key in changed {
            if self.ext_out.contains_key(&key) {
                self.send_media_format(key);
                self.renegotiate_icb(key);
            }
        }
        Ok(AckPayload::None)
    }

    /// Reports this input's buffering needs to its upstream.
    pub(super) fn send_icb_info(&mut self, key: PortKey) {
        let Some(ds_rt) = self.graph.in_port(key).map(|p| p.ds_rt) else {
            return;
        };
        let info = IcbInfo {
            frame: self.frame,
            period_us: self.period_us,
            variable_input: self.settings.variable_input,
            real_time: self.settings.signal_triggered || ds_rt,
            single_buffer_mode: self.settings.single_buffer_mode,
            scenario: self.scenario_of(key.module),
        };
        if info.is_empty() {
            return;
        }
        let Some(port) = self.ext_in.get_mut(&key) else {
            return;
        };
        let Some(upstream) = port.upstream.clone() else {
            return;
        };
        let outcome = port.icb_prop.try_send(info, |info| {
            upstream.send(Command::IcbInfo {
                port: upstream.port,
                info,
            })
        });
        log_outcome(key, "icb_info", &outcome);
    }

    pub(super) fn renegotiate_all(&mut self) {
        let outs: Vec<PortKey> = self.ext_out.keys().copied().collect();
        for key in outs {
            self.renegotiate_icb(key);
        }
    }

    /// Renegotiates one output's buffering; recreates its pool when the
    /// output may hold buffers and the result or buffer size changed.
    pub(super) fn renegotiate_icb(&mut self, key: PortKey) {
        let Some((us_rt, ds_rt, media)) = self.graph.out_port(key).map(|o| (o.us_rt, o.ds_rt, o.media))
        else {
            return;
        };
        let ready = self.ext_out_ready(key);
        let local = IcbLocal {
            frame: self.frame,
            period_us: self.period_us,
            real_time: self.settings.signal_triggered || us_rt,
            disable_otp: false,
            scenario: self.scenario_of(key.module),
        };
        let policy = self.settings.policy.icb();
        let buf_size = match media.bytes_for_us(self.frame.us) {
            0 => FALLBACK_BUF_BYTES,
            n => n,
        };
        let Some(port) = self.ext_out.get_mut(&key) else {
            return;
        };

        let downstream = port.ds_info.map(|mut d| {
            d.real_time |= ds_rt;
            d
        });
        let result = icb::negotiate(
            &IcbInputs {
                connected: port.downstream.is_some(),
                format: media.data_format,
                local,
                downstream,
            },
            &policy,
        );
        let changed = result != port.icb;
        port.icb = result;
        let stale_pool = port.pool.count() != result.total_bufs() as usize
            || port.pool.buf_size() != buf_size;
        if ready && !result.is_deferred() && (changed || stale_pool) {
            port.recreate_buffers(result.total_bufs(), buf_size);
        }
        if changed {
            tracing::debug!(
                port = %key,
                mode = ?result.mode,
                reg = result.reg_bufs,
                prebufs = result.prebufs,
                otp_us = result.otp_us,
                "icb negotiated"
            );
            self.update_paths(PathSelector::All);
        }
    }

    /// Sends an output's media format downstream if it changed.
    pub(super) fn send_media_format(&mut self, key: PortKey) {
        let Some(media) = self.graph.out_port(key).map(|o| o.media) else {
            return;
        };
        if !media.is_valid() {
            return;
        }
        let frame = self.frame;
        let Some(port) = self.ext_out.get_mut(&key) else {
            return;
        };
        let Some(downstream) = port.downstream.clone() else {
            return;
        };
        if port.media_sent == Some((media, frame)) {
            return;
        }
        match downstream.send(Command::MediaFormat {
            port: downstream.port,
            format: media,
            frame,
        }) {
            Ok(()) => port.media_sent = Some((media, frame)),
            Err(err) => tracing::warn!(port = %key, error = %err, "media format not delivered"),
        }
    }
}
