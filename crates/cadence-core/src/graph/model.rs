//! In-memory graph model: subgraphs, modules, ports and internal links.
//!
//! A [`Graph`] is edited only by graph open, connect and close. Between
//! edits it is read by lifecycle, propagation and delay logic. Ports that
//! face another container are flagged `external`; their cross-container
//! state lives in the container's external port tables, not here.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CntrError, CntrResult};
use crate::ids::{ModuleId, PortId, PortKey, SubgraphId};
use crate::media::{MediaFormat, Scenario};
use crate::state::{PortState, SubgraphState};
use crate::transport::Marker;

use super::module::{Module, ModuleResources, PortDirection};

/// Static properties of a module instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModuleFlags {
    /// Produces data without an input.
    pub is_source: bool,
    /// Consumes data without an output.
    pub is_sink: bool,
    /// Produces or consumes at a fixed real-time cadence.
    pub real_time: bool,
    /// Carries metadata from its inputs to its outputs.
    pub propagates_metadata: bool,
    /// Attached to the sorted list only at the next connect.
    pub elementary: bool,
}

/// A subgraph and its lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subgraph {
    /// Subgraph id.
    pub id: SubgraphId,
    /// Current lifecycle state.
    pub state: SubgraphState,
    /// Scenario tag.
    pub scenario: Scenario,
}

/// Input port of a module.
#[derive(Debug, Default)]
pub struct InPort {
    /// Downgraded port state.
    pub state: PortState,
    /// Upstream output of an internal link.
    pub upstream: Option<PortKey>,
    /// Faces another container.
    pub external: bool,
    /// Upstream is real time.
    pub us_rt: bool,
    /// Downstream is real time.
    pub ds_rt: bool,
    /// Media format on this port.
    pub media: MediaFormat,
    /// No data is flowing (start of stream or after end of stream).
    pub at_gap: bool,
}

/// Output port of a module.
#[derive(Debug, Default)]
pub struct OutPort {
    /// Downgraded port state.
    pub state: PortState,
    /// Downstream input of an internal link.
    pub downstream: Option<PortKey>,
    /// Faces another container.
    pub external: bool,
    /// Upstream is real time.
    pub us_rt: bool,
    /// Downstream is real time.
    pub ds_rt: bool,
    /// Media format on this port.
    pub media: MediaFormat,
    /// Markers waiting to be delivered downstream.
    pub markers: Vec<Marker>,
}

/// A module instance and its ports.
pub struct ModuleNode {
    /// Instance id.
    pub id: ModuleId,
    /// Owning subgraph.
    pub sg: SubgraphId,
    /// Static flags.
    pub flags: ModuleFlags,
    /// The module implementation.
    pub module: Box<dyn Module>,
    /// Inputs by port id.
    pub inputs: BTreeMap<PortId, InPort>,
    /// Outputs by port id.
    pub outputs: BTreeMap<PortId, OutPort>,
    /// Control port ids.
    pub controls: BTreeSet<PortId>,
    /// Part of the sorted module list.
    pub attached: bool,
}

impl core::fmt::Debug for ModuleNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleNode")
            .field("id", &self.id)
            .field("sg", &self.sg)
            .field("flags", &self.flags)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

impl ModuleNode {
    /// Lowest-numbered output port.
    pub fn first_output(&self) -> Option<PortId> {
        self.outputs.keys().next().copied()
    }

    /// Direction of `port` on this module.
    pub fn direction_of(&self, port: PortId) -> Option<PortDirection> {
        if self.inputs.contains_key(&port) {
            Some(PortDirection::Input)
        } else if self.outputs.contains_key(&port) {
            Some(PortDirection::Output)
        } else if self.controls.contains(&port) {
            Some(PortDirection::Control)
        } else {
            None
        }
    }
}

/// Everything needed to add a module to a graph.
pub struct ModuleSpec {
    /// Instance id.
    pub id: ModuleId,
    /// Owning subgraph.
    pub subgraph: SubgraphId,
    /// Static flags.
    pub flags: ModuleFlags,
    /// Input port ids.
    pub inputs: Vec<PortId>,
    /// Output port ids.
    pub outputs: Vec<PortId>,
    /// Control port ids.
    pub controls: Vec<PortId>,
    /// Implementation.
    pub module: Box<dyn Module>,
}

/// The module graph owned by one container.
#[derive(Debug, Default)]
pub struct Graph {
    pub(super) subgraphs: BTreeMap<SubgraphId, Subgraph>,
    pub(super) modules: BTreeMap<ModuleId, ModuleNode>,
    pub(super) sorted: Vec<ModuleId>,
}

impl Graph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subgraph in `Stopped` state.
    pub fn add_subgraph(&mut self, id: SubgraphId, scenario: Scenario) -> CntrResult<()> {
        if self.subgraphs.contains_key(&id) {
            return Err(CntrError::bad_param(format!("subgraph {id} already open")));
        }
        self.subgraphs.insert(
            id,
            Subgraph {
                id,
                state: SubgraphState::Stopped,
                scenario,
            },
        );
        Ok(())
    }

    /// Adds a module. Elementary modules stay detached until
    /// [`attach_pending`](Self::attach_pending).
    pub fn add_module(&mut self, spec: ModuleSpec) -> CntrResult<()> {
        if !self.subgraphs.contains_key(&spec.subgraph) {
            return Err(CntrError::bad_param(format!(
                "module {} refers to unknown subgraph {}",
                spec.id, spec.subgraph
            )));
        }
        if self.modules.contains_key(&spec.id) {
            return Err(CntrError::bad_param(format!("module {} already exists", spec.id)));
        }
        let node = ModuleNode {
            id: spec.id,
            sg: spec.subgraph,
            flags: spec.flags,
            module: spec.module,
            inputs: spec
                .inputs
                .into_iter()
                .map(|p| {
                    let port = InPort {
                        at_gap: true,
                        ..InPort::default()
                    };
                    (p, port)
                })
                .collect(),
            outputs: spec
                .outputs
                .into_iter()
                .map(|p| (p, OutPort::default()))
                .collect(),
            controls: spec.controls.into_iter().collect(),
            attached: !spec.flags.elementary,
        };
        tracing::debug!(module = %node.id, sg = %node.sg, "graph_add_module");
        self.modules.insert(spec.id, node);
        Ok(())
    }

    /// Links an output to an input inside this container.
    pub fn link(&mut self, from: PortKey, to: PortKey) -> CntrResult<()> {
        let out = self.out_port(from).ok_or_else(|| {
            CntrError::bad_param(format!("link source {from} is not an output"))
        })?;
        if out.downstream.is_some() || out.external {
            return Err(CntrError::bad_param(format!("output {from} already linked")));
        }
        let inp = self
            .in_port(to)
            .ok_or_else(|| CntrError::bad_param(format!("link target {to} is not an input")))?;
        if inp.upstream.is_some() || inp.external {
            return Err(CntrError::bad_param(format!("input {to} already linked")));
        }
        if let Some(out) = self.out_port_mut(from) {
            out.downstream = Some(to);
        }
        if let Some(inp) = self.in_port_mut(to) {
            inp.upstream = Some(from);
        }
        tracing::debug!("graph_link: {from} → {to}");
        Ok(())
    }

    /// Marks an input as facing another container.
    pub fn mark_external_input(&mut self, key: PortKey) -> CntrResult<()> {
        let port = self
            .in_port_mut(key)
            .ok_or_else(|| CntrError::bad_param(format!("no input {key}")))?;
        if port.upstream.is_some() || port.external {
            return Err(CntrError::bad_param(format!("input {key} already linked")));
        }
        port.external = true;
        Ok(())
    }

    /// Marks an output as facing another container.
    pub fn mark_external_output(&mut self, key: PortKey) -> CntrResult<()> {
        let port = self
            .out_port_mut(key)
            .ok_or_else(|| CntrError::bad_param(format!("no output {key}")))?;
        if port.downstream.is_some() || port.external {
            return Err(CntrError::bad_param(format!("output {key} already linked")));
        }
        port.external = true;
        Ok(())
    }

    /// Removes a subgraph with its modules. Internal links into the
    /// remaining graph are cut.
    pub fn remove_subgraph(&mut self, id: SubgraphId) -> Vec<ModuleNode> {
        self.subgraphs.remove(&id);
        let ids: Vec<ModuleId> = self
            .modules
            .values()
            .filter(|m| m.sg == id)
            .map(|m| m.id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for mid in ids {
            if let Some(node) = self.modules.remove(&mid) {
                removed.push(node);
            }
        }
        for node in &removed {
            for inp in node.inputs.values() {
                if let Some(up) = inp.upstream
                    && let Some(out) = self.out_port_mut(up)
                {
                    out.downstream = None;
                }
            }
            for out in node.outputs.values() {
                if let Some(down) = out.downstream
                    && let Some(inp) = self.in_port_mut(down)
                {
                    inp.upstream = None;
                }
            }
        }
        self.sorted.retain(|m| self.modules.contains_key(m));
        removed
    }

    /// Attaches every pending elementary module. Returns how many.
    pub fn attach_pending(&mut self) -> usize {
        let mut count = 0;
        for node in self.modules.values_mut().filter(|m| !m.attached) {
            node.attached = true;
            count += 1;
            tracing::debug!(module = %node.id, "graph_attach_elementary");
        }
        count
    }

    /// Modules still waiting to be attached.
    pub fn pending_count(&self) -> usize {
        self.modules.values().filter(|m| !m.attached).count()
    }

    /// Sorted (topological) list of attached modules.
    pub fn sorted(&self) -> &[ModuleId] {
        &self.sorted
    }

    /// Looks up a subgraph.
    pub fn subgraph(&self, id: SubgraphId) -> Option<&Subgraph> {
        self.subgraphs.get(&id)
    }

    /// Looks up a subgraph mutably.
    pub fn subgraph_mut(&mut self, id: SubgraphId) -> Option<&mut Subgraph> {
        self.subgraphs.get_mut(&id)
    }

    /// All subgraphs in id order.
    pub fn subgraphs(&self) -> impl Iterator<Item = &Subgraph> {
        self.subgraphs.values()
    }

    /// Number of open subgraphs.
    pub fn subgraph_count(&self) -> usize {
        self.subgraphs.len()
    }

    /// State of a subgraph, `Invalid` if unknown.
    pub fn sg_state(&self, id: SubgraphId) -> SubgraphState {
        self.subgraphs
            .get(&id)
            .map_or(SubgraphState::Invalid, |s| s.state)
    }

    /// Looks up a module.
    pub fn module(&self, id: ModuleId) -> Option<&ModuleNode> {
        self.modules.get(&id)
    }

    /// Looks up a module mutably.
    pub fn module_mut(&mut self, id: ModuleId) -> Option<&mut ModuleNode> {
        self.modules.get_mut(&id)
    }

    /// All modules in id order.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleNode> {
        self.modules.values()
    }

    /// All modules in id order, mutably.
    pub fn modules_mut(&mut self) -> impl Iterator<Item = &mut ModuleNode> {
        self.modules.values_mut()
    }

    /// Subgraph owning the module of `key`.
    pub fn sg_of(&self, module: ModuleId) -> Option<SubgraphId> {
        self.modules.get(&module).map(|m| m.sg)
    }

    /// Looks up an input port.
    pub fn in_port(&self, key: PortKey) -> Option<&InPort> {
        self.modules.get(&key.module)?.inputs.get(&key.port)
    }

    /// Looks up an input port mutably.
    pub fn in_port_mut(&mut self, key: PortKey) -> Option<&mut InPort> {
        self.modules.get_mut(&key.module)?.inputs.get_mut(&key.port)
    }

    /// Looks up an output port.
    pub fn out_port(&self, key: PortKey) -> Option<&OutPort> {
        self.modules.get(&key.module)?.outputs.get(&key.port)
    }

    /// Looks up an output port mutably.
    pub fn out_port_mut(&mut self, key: PortKey) -> Option<&mut OutPort> {
        self.modules.get_mut(&key.module)?.outputs.get_mut(&key.port)
    }

    /// Sum of module loads in subgraphs selected by `include`.
    pub fn resources_where(&self, include: impl Fn(&Subgraph) -> bool) -> ModuleResources {
        self.modules
            .values()
            .filter(|m| m.attached)
            .filter(|m| self.subgraphs.get(&m.sg).is_some_and(&include))
            .fold(ModuleResources::default(), |acc, m| acc + m.module.resources())
    }

    /// Largest stack any module needs.
    pub fn required_stack_bytes(&self) -> usize {
        self.modules
            .values()
            .map(|m| m.module.required_stack_bytes())
            .max()
            .unwrap_or(0)
    }

    /// Returns `true` if any module currently vetoes duty cycling.
    pub fn any_module_disallows_duty_cycling(&self) -> bool {
        self.modules.values().any(|m| !m.module.allows_duty_cycling())
    }

    /// External outputs reachable from `from` through internal links.
    pub fn reachable_external_outputs(&self, from: ModuleId) -> Vec<PortKey> {
        let mut found = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(mid) = stack.pop() {
            if !seen.insert(mid) {
                continue;
            }
            let Some(node) = self.modules.get(&mid) else {
                continue;
            };
            for (&pid, out) in &node.outputs {
                if out.external {
                    found.push(PortKey {
                        module: mid,
                        port: pid,
                    });
                } else if let Some(down) = out.downstream {
                    stack.push(down.module);
                }
            }
        }
        found.sort();
        found
    }
}
