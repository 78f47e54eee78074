//! Sorted module list and topology-wide propagation.
//!
//! The sorted list is recomputed with Kahn's algorithm over attached
//! modules and internal links. Real-time flags and media formats are then
//! propagated through it: forward (source to sink) for upstream real-time
//! and media format, backward for downstream real-time.

use std::collections::BTreeMap;

use crate::error::{CntrError, CntrResult};
use crate::ids::{ModuleId, PortKey};
use crate::state::SubgraphState;

use super::model::Graph;

/// What changed during a real-time propagation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtChanges {
    /// Inputs whose upstream real-time flag changed.
    pub us_rt_inputs: Vec<PortKey>,
    /// Outputs whose downstream real-time flag changed.
    pub ds_rt_outputs: Vec<PortKey>,
}

impl RtChanges {
    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.us_rt_inputs.is_empty() && self.ds_rt_outputs.is_empty()
    }
}

fn carries_data(state: SubgraphState) -> bool {
    matches!(state, SubgraphState::Prepared | SubgraphState::Started)
}

impl Graph {
    /// Recomputes the sorted module list. Returns `true` if it changed.
    ///
    /// Fails with `Failed` if internal links form a cycle.
    pub fn update_sorted(&mut self) -> CntrResult<bool> {
        let ids: Vec<ModuleId> = self
            .modules
            .values()
            .filter(|m| m.attached)
            .map(|m| m.id)
            .collect();

        let mut in_degree: BTreeMap<ModuleId, usize> = ids.iter().map(|&id| (id, 0)).collect();
        for &id in &ids {
            let Some(node) = self.modules.get(&id) else {
                continue;
            };
            for out in node.outputs.values() {
                if let Some(down) = out.downstream
                    && let Some(deg) = in_degree.get_mut(&down.module)
                {
                    *deg += 1;
                }
            }
        }

        // Reverse so pop() yields ascending ids: deterministic order.
        let mut queue: Vec<ModuleId> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .rev()
            .collect();
        let mut sorted = Vec::with_capacity(ids.len());

        while let Some(id) = queue.pop() {
            sorted.push(id);
            let Some(node) = self.modules.get(&id) else {
                continue;
            };
            for out in node.outputs.values() {
                let Some(down) = out.downstream else {
                    continue;
                };
                if let Some(deg) = in_degree.get_mut(&down.module) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(down.module);
                    }
                }
            }
        }

        if sorted.len() != ids.len() {
            return Err(CntrError::failed("internal links form a cycle"));
        }

        let changed = sorted != self.sorted;
        if changed {
            tracing::debug!("graph_sort: {} modules in topo order", sorted.len());
        }
        self.sorted = sorted;
        Ok(changed)
    }

    /// Recomputes upstream and downstream real-time flags on every port.
    ///
    /// External inputs keep their `us_rt` and external outputs their
    /// `ds_rt`: those come from the peer container. An internal link whose
    /// far side lies in a subgraph that is neither prepared nor started
    /// carries `false`.
    pub fn propagate_rt(&mut self) -> RtChanges {
        let mut changes = RtChanges::default();
        let order = self.sorted.clone();

        for &mid in &order {
            let Some(node) = self.modules.get(&mid) else {
                continue;
            };
            let own_sg = node.sg;
            let mut new_in = Vec::with_capacity(node.inputs.len());
            for (&pid, inp) in &node.inputs {
                let value = if inp.external {
                    inp.us_rt
                } else {
                    match inp.upstream {
                        Some(up) => {
                            let up_sg = self.sg_of(up.module);
                            let live = up_sg == Some(own_sg)
                                || up_sg.is_some_and(|s| carries_data(self.sg_state(s)));
                            live && self.out_port(up).is_some_and(|o| o.us_rt)
                        }
                        None => false,
                    }
                };
                new_in.push((pid, value));
            }
            let any_in = new_in.iter().any(|&(_, v)| v);
            let out_rt = node.flags.real_time || any_in;

            if let Some(node) = self.modules.get_mut(&mid) {
                for (pid, value) in new_in {
                    if let Some(inp) = node.inputs.get_mut(&pid)
                        && inp.us_rt != value
                    {
                        inp.us_rt = value;
                        changes.us_rt_inputs.push(PortKey { module: mid, port: pid });
                    }
                }
                for out in node.outputs.values_mut() {
                    out.us_rt = out_rt;
                }
            }
        }

        for &mid in order.iter().rev() {
            let Some(node) = self.modules.get(&mid) else {
                continue;
            };
            let own_sg = node.sg;
            let mut new_out = Vec::with_capacity(node.outputs.len());
            for (&pid, out) in &node.outputs {
                let value = if out.external {
                    out.ds_rt
                } else {
                    match out.downstream {
                        Some(down) => {
                            let down_sg = self.sg_of(down.module);
                            let live = down_sg == Some(own_sg)
                                || down_sg.is_some_and(|s| carries_data(self.sg_state(s)));
                            live && self.in_port(down).is_some_and(|i| i.ds_rt)
                        }
                        None => false,
                    }
                };
                new_out.push((pid, value));
            }
            let any_out = new_out.iter().any(|&(_, v)| v);
            let in_rt = node.flags.real_time || any_out;

            if let Some(node) = self.modules.get_mut(&mid) {
                for (pid, value) in new_out {
                    if let Some(out) = node.outputs.get_mut(&pid)
                        && out.ds_rt != value
                    {
                        out.ds_rt = value;
                        changes.ds_rt_outputs.push(PortKey { module: mid, port: pid });
                    }
                }
                for inp in node.inputs.values_mut() {
                    inp.ds_rt = in_rt;
                }
            }
        }

        changes
    }

    /// Propagates media formats forward along the sorted list.
    ///
    /// External inputs keep whatever format the upstream container sent.
    /// Returns the outputs whose format changed.
    pub fn propagate_media_format(&mut self) -> Vec<PortKey> {
        let mut changed = Vec::new();
        let order = self.sorted.clone();
        for mid in order {
            let Some(node) = self.modules.get(&mid) else {
                continue;
            };
            let first_in = node
                .inputs
                .values()
                .map(|i| i.media)
                .find(|m| m.is_valid());
            let Some(fmt) = node.module.output_media_format(first_in) else {
                continue;
            };
            let mut links = Vec::new();
            if let Some(node) = self.modules.get_mut(&mid) {
                for (&pid, out) in &mut node.outputs {
                    if out.media != fmt {
                        out.media = fmt;
                        changed.push(PortKey { module: mid, port: pid });
                    }
                    if let Some(down) = out.downstream {
                        links.push(down);
                    }
                }
            }
            for down in links {
                if let Some(inp) = self.in_port_mut(down) {
                    inp.media = fmt;
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::tests::spec;
    use crate::graph::{BasicModule, ModuleSpec};
    use crate::ids::{PortKey, SubgraphId};
    use crate::media::{MediaFormat, Scenario};

    fn chain() -> Graph {
        // 0x12 → 0x11 → 0x10: ids deliberately reversed against flow.
        let mut g = Graph::new();
        g.add_subgraph(SubgraphId(1), Scenario::Default).unwrap();
        g.add_module(spec(0x10, 1, &[0], &[1])).unwrap();
        g.add_module(spec(0x11, 1, &[0], &[1])).unwrap();
        g.add_module(spec(0x12, 1, &[0], &[1])).unwrap();
        g.link(PortKey::new(0x12, 1), PortKey::new(0x11, 0)).unwrap();
        g.link(PortKey::new(0x11, 1), PortKey::new(0x10, 0)).unwrap();
        g
    }

    #[test]
    fn sort_follows_links() {
        let mut g = chain();
        assert!(g.update_sorted().unwrap());
        assert_eq!(g.sorted(), &[ModuleId(0x12), ModuleId(0x11), ModuleId(0x10)]);
        assert!(!g.update_sorted().unwrap());
    }

    #[test]
    fn sort_skips_detached_modules() {
        let mut g = chain();
        let mut s = spec(0x20, 1, &[], &[]);
        s.flags.elementary = true;
        g.add_module(s).unwrap();
        g.update_sorted().unwrap();
        assert_eq!(g.sorted().len(), 3);
        g.attach_pending();
        assert!(g.update_sorted().unwrap());
        assert_eq!(g.sorted().len(), 4);
    }

    #[test]
    fn upstream_rt_flows_forward_from_external_input() {
        let mut g = chain();
        g.mark_external_input(PortKey::new(0x12, 0)).unwrap();
        g.update_sorted().unwrap();
        g.in_port_mut(PortKey::new(0x12, 0)).unwrap().us_rt = true;

        let changes = g.propagate_rt();
        assert!(g.in_port(PortKey::new(0x10, 0)).unwrap().us_rt);
        assert!(g.out_port(PortKey::new(0x10, 1)).unwrap().us_rt);
        assert!(changes.us_rt_inputs.contains(&PortKey::new(0x10, 0)));
        assert!(g.propagate_rt().is_empty());
    }

    #[test]
    fn downstream_rt_flows_backward_from_real_time_sink() {
        let mut g = Graph::new();
        g.add_subgraph(SubgraphId(1), Scenario::Default).unwrap();
        g.add_module(spec(0x10, 1, &[0], &[1])).unwrap();
        let mut sink: ModuleSpec = spec(0x11, 1, &[0], &[]);
        sink.flags.real_time = true;
        sink.flags.is_sink = true;
        g.add_module(sink).unwrap();
        g.link(PortKey::new(0x10, 1), PortKey::new(0x11, 0)).unwrap();
        g.update_sorted().unwrap();

        let changes = g.propagate_rt();
        assert!(g.in_port(PortKey::new(0x10, 0)).unwrap().ds_rt);
        assert_eq!(changes.ds_rt_outputs, vec![PortKey::new(0x10, 1)]);
    }

    #[test]
    fn rt_does_not_cross_into_stopped_subgraph() {
        let mut g = Graph::new();
        g.add_subgraph(SubgraphId(1), Scenario::Default).unwrap();
        g.add_subgraph(SubgraphId(2), Scenario::Default).unwrap();
        let mut src = spec(0x10, 1, &[], &[1]);
        src.flags.real_time = true;
        g.add_module(src).unwrap();
        g.add_module(spec(0x20, 2, &[0], &[])).unwrap();
        g.link(PortKey::new(0x10, 1), PortKey::new(0x20, 0)).unwrap();
        g.update_sorted().unwrap();

        g.propagate_rt();
        assert!(!g.in_port(PortKey::new(0x20, 0)).unwrap().us_rt);

        g.subgraph_mut(SubgraphId(1)).unwrap().state = SubgraphState::Started;
        g.propagate_rt();
        assert!(g.in_port(PortKey::new(0x20, 0)).unwrap().us_rt);
    }

    #[test]
    fn media_format_propagates_from_source() {
        let mut g = chain();
        let fmt = MediaFormat::pcm(48_000, 2, 16);
        g.module_mut(ModuleId(0x12)).unwrap().module =
            Box::new(BasicModule::new().with_output_format(fmt));
        g.update_sorted().unwrap();
        let changed = g.propagate_media_format();
        assert_eq!(changed.len(), 3);
        assert_eq!(g.out_port(PortKey::new(0x10, 1)).unwrap().media, fmt);
        assert!(g.propagate_media_format().is_empty());
    }

    #[test]
    fn cycle_is_rejected() {
        let mut g = Graph::new();
        g.add_subgraph(SubgraphId(1), Scenario::Default).unwrap();
        g.add_module(spec(0x10, 1, &[0], &[1])).unwrap();
        g.add_module(spec(0x11, 1, &[0], &[1])).unwrap();
        g.link(PortKey::new(0x10, 1), PortKey::new(0x11, 0)).unwrap();
        g.link(PortKey::new(0x11, 1), PortKey::new(0x10, 0)).unwrap();
        assert!(g.update_sorted().is_err());
    }
}
