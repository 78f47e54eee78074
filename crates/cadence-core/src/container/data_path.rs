//! Data flow through the container: ingress, egress and boundary markers.

use super::Container;
use crate::events::{EVENT_FRAME_DELIVERY_DONE, EventOwner};
use crate::ids::{ModuleId, PortKey};
use crate::media::Timestamp;
use crate::prebuffer::{PrebufferPlan, send_prebuffers};
use crate::state::PortState;
use crate::transport::{BufferFlags, DataBuffer, DataMessage, Marker};

impl Container {
    /// Data-queue handler of one external input.
    pub(super) fn on_ext_input(&mut self, key: PortKey) {
        let pulled = self.ext_in.get_mut(&key).map_or(0, |p| p.pull());
        tracing::trace!(port = %key, pulled, "ext input woke");
        self.process_input(key);
    }

    /// Return-bit handler of one external output's pool.
    pub(super) fn on_buffer_return(&mut self, key: PortKey) {
        let Some(port) = self.ext_out.get(&key) else {
            return;
        };
        if let Some(signal) = port.pool.signal() {
            signal.clear();
        }
        tracing::trace!(port = %key, available = port.pool.available(), "output buffer returned");
        self.process_all_inputs();
    }

    pub(super) fn process_all_inputs(&mut self) {
        let keys: Vec<PortKey> = self.ext_in.keys().copied().collect();
        for key in keys {
            self.process_input(key);
        }
    }

    fn pop_ingress(&mut self, key: PortKey) -> Option<DataMessage> {
        self.ext_in.get_mut(&key)?.ingress.pop()
    }

    /// Moves ready ingress data to the outputs it reaches.
    ///
    /// Reading stops while any live target has no free buffer; the data
    /// stays in ingress until that pool's return bit fires.
    fn process_input(&mut self, key: PortKey) {
        if self.graph.in_port(key).map(|p| p.state) != Some(PortState::Started) {
            return;
        }
        let targets = self.graph.reachable_external_outputs(key.module);
        let is_sink = self.graph.module(key.module).is_some_and(|m| m.flags.is_sink);

        loop {
            if !self.outputs_have_room(&targets) {
                tracing::trace!(port = %key, "output pool empty, input parked");
                break;
            }
            let Some(msg) = self.pop_ingress(key) else {
                break;
            };
            match msg {
                DataMessage::Buffer(buf) => {
                    if let Some(inp) = self.graph.in_port_mut(key) {
                        inp.at_gap = false;
                    }
                    for &out in &targets {
                        self.deliver(out, &buf);
                    }
                    if is_sink {
                        self.raise_frame_delivered(key.module, buf.timestamp);
                    }
                }
                DataMessage::Marker(marker) => {
                    if marker == Marker::FlushingEos
                        && let Some(inp) = self.graph.in_port_mut(key)
                    {
                        inp.at_gap = true;
                    }
                    for &out in &targets {
                        self.forward_marker(out, marker);
                    }
                }
            }
        }
    }

    fn outputs_have_room(&self, targets: &[PortKey]) -> bool {
        targets.iter().all(|key| {
            let live = self
                .graph
                .out_port(*key)
                .is_some_and(|o| o.state == PortState::Started);
            match self.ext_out.get(key) {
                Some(port) if live && port.data.is_some() => port.has_room(),
                _ => true,
            }
        })
    }

    fn deliver(&mut self, key: PortKey, buf: &DataBuffer) {
        let Some(media) = self
            .graph
            .out_port(key)
            .filter(|o| o.state == PortState::Started)
            .map(|o| o.media)
        else {
            return;
        };
        let frame_us = self.frame.us;
        let Some(port) = self.ext_out.get_mut(&key) else {
            return;
        };
        let Some(data) = port.data.clone() else {
            return;
        };

        if port.prebuffers_pending {
            port.prebuffers_pending = false;
            let plan = PrebufferPlan {
                otp_bytes: media.bytes_for_us(port.icb.otp_us),
                otp_us: port.icb.otp_us,
                prebufs: port.icb.prebufs,
                frame_us,
            };
            if let Err(err) = send_prebuffers(&port.pool, &data, &plan, buf.timestamp) {
                tracing::warn!(port = %key, error = %err, "prebuffers not delivered");
            }
        }

        let Some(mut out) = port.pool.poll() else {
            tracing::warn!(port = %key, "no free output buffer, frame dropped");
            return;
        };
        out.fill_from(buf.payload.as_slice());
        let msg = DataMessage::Buffer(DataBuffer {
            payload: out,
            timestamp: buf.timestamp,
            flags: BufferFlags::default(),
        });
        match data.push(msg) {
            Ok(()) => port.frames_sent += 1,
            Err(err) => tracing::warn!(port = %key, error = %err, "frame not delivered"),
        }
    }

    fn forward_marker(&mut self, key: PortKey, marker: Marker) {
        let Some(data) = self.ext_out.get(&key).and_then(|p| p.data.as_ref()) else {
            return;
        };
        match data.push(DataMessage::Marker(marker)) {
            Ok(()) => tracing::debug!(port = %key, ?marker, "marker forwarded"),
            Err(err) => tracing::warn!(port = %key, error = %err, "marker not delivered"),
        }
    }

    /// Delivers queued boundary markers in sorted order.
    ///
    /// Markers on external outputs go to the peer; markers on internal
    /// links close the downstream input and continue through modules that
    /// propagate metadata.
    pub(super) fn drain_markers(&mut self) {
        let order = self.graph.sorted().to_vec();
        for mid in order {
            let pending: Vec<(PortKey, bool, Option<PortKey>, Vec<Marker>)> = self
                .graph
                .module_mut(mid)
                .map(|node| {
                    node.outputs
                        .iter_mut()
                        .filter(|(_, o)| !o.markers.is_empty())
                        .map(|(&port, o)| {
                            (
                                PortKey { module: mid, port },
                                o.external,
                                o.downstream,
                                core::mem::take(&mut o.markers),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();

            for (key, external, downstream, markers) in pending {
                for marker in markers {
                    if external {
                        self.forward_marker(key, marker);
                        continue;
                    }
                    let Some(down) = downstream else {
                        continue;
                    };
                    if marker == Marker::FlushingEos
                        && let Some(inp) = self.graph.in_port_mut(down)
                    {
                        inp.at_gap = true;
                    }
                    let next = self
                        .graph
                        .module(down.module)
                        .filter(|n| n.flags.propagates_metadata)
                        .and_then(|n| n.first_output());
                    if let Some(port) = next
                        && let Some(out) = self.graph.out_port_mut(PortKey {
                            module: down.module,
                            port,
                        })
                    {
                        out.markers.push(marker);
                    }
                }
            }
        }
    }

    fn raise_frame_delivered(&self, module: ModuleId, ts: Option<Timestamp>) {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&module.0.to_le_bytes());
        payload.extend_from_slice(&ts.unwrap_or(0).to_le_bytes());
        self.events
            .raise(EventOwner::Container, EVENT_FRAME_DELIVERY_DONE, &payload);
    }
}
