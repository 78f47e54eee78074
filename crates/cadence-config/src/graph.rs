//! Graph description: subgraphs, modules, links and external ports.
//!
//! These are the serde forms of what a graph-open command carries.
//! [`GraphConfig::open_request`] turns them into a
//! [`GraphOpenRequest`] backed by [`BasicModule`] instances.

use cadence_core::{
    BasicModule, DataFormat, ExternalInputDecl, GraphOpenRequest, MediaFormat, ModuleFlags,
    ModuleId, ModuleSpec, PortId, PortKey, Scenario, SubgraphDecl, SubgraphId,
};
use serde::{Deserialize, Serialize};

/// A (module, port) reference, written `{ module = 0x10, port = 1 }`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRef {
    /// Module instance id.
    pub module: u32,
    /// Port id on that module.
    pub port: u32,
}

impl PortRef {
    /// Creates a port reference.
    pub const fn new(module: u32, port: u32) -> Self {
        Self { module, port }
    }
}

impl From<PortRef> for PortKey {
    fn from(r: PortRef) -> Self {
        PortKey::new(r.module, r.port)
    }
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:X}:{}", self.module, self.port)
    }
}

/// Scenario tag of a subgraph.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioConfig {
    /// No extra constraints.
    #[default]
    Default,
    /// Voice path.
    Voice,
}

impl From<ScenarioConfig> for Scenario {
    fn from(s: ScenarioConfig) -> Self {
        match s {
            ScenarioConfig::Default => Scenario::Default,
            ScenarioConfig::Voice => Scenario::Voice,
        }
    }
}

/// Data format of a declared media format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    /// Linear PCM.
    #[default]
    Pcm,
    /// Packetized data with PCM timing.
    Packetized,
    /// Raw compressed bitstream.
    RawCompressed,
}

/// A media format written in configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaFormatConfig {
    /// Data format.
    #[serde(default)]
    pub format: FormatKind,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Bits per sample.
    pub bits_per_sample: u16,
}

impl From<MediaFormatConfig> for MediaFormat {
    fn from(m: MediaFormatConfig) -> Self {
        MediaFormat {
            data_format: match m.format {
                FormatKind::Pcm => DataFormat::Pcm,
                FormatKind::Packetized => DataFormat::Packetized,
                FormatKind::RawCompressed => DataFormat::RawCompressed,
            },
            sample_rate: m.sample_rate,
            channels: m.channels,
            bits_per_sample: m.bits_per_sample,
        }
    }
}

/// A subgraph declaration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubgraphConfig {
    /// Subgraph id.
    pub id: u32,
    /// Scenario tag.
    #[serde(default)]
    pub scenario: ScenarioConfig,
}

fn default_true() -> bool {
    true
}

/// A module instance.
///
/// ```toml
/// [[modules]]
/// id = 0x10
/// subgraph = 1
/// propagates_metadata = true
/// delay_us = 250
/// inputs = [0]
/// outputs = [1]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleConfig {
    /// Instance id.
    pub id: u32,
    /// Owning subgraph.
    pub subgraph: u32,
    /// Produces data without an input.
    #[serde(default)]
    pub source: bool,
    /// Consumes data without an output.
    #[serde(default)]
    pub sink: bool,
    /// Runs at a real-time cadence.
    #[serde(default)]
    pub real_time: bool,
    /// Carries metadata from inputs to outputs.
    #[serde(default)]
    pub propagates_metadata: bool,
    /// Attached only at the next connect.
    #[serde(default)]
    pub elementary: bool,
    /// Algorithmic delay in microseconds.
    #[serde(default)]
    pub delay_us: u32,
    /// Processing load in kilo-packets per second.
    #[serde(default)]
    pub kpps: u32,
    /// Bus bandwidth in bytes per second.
    #[serde(default)]
    pub bw_bytes_per_sec: u32,
    /// Stack the module needs, in bytes.
    #[serde(default)]
    pub stack_bytes: usize,
    /// Allows island duty cycling.
    #[serde(default = "default_true")]
    pub allows_duty_cycling: bool,
    /// Input port ids.
    #[serde(default)]
    pub inputs: Vec<u32>,
    /// Output port ids.
    #[serde(default)]
    pub outputs: Vec<u32>,
    /// Control port ids.
    #[serde(default)]
    pub controls: Vec<u32>,
    /// Format a source produces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<MediaFormatConfig>,
}

impl ModuleConfig {
    /// A module with no ports in `subgraph`.
    pub fn new(id: u32, subgraph: u32) -> Self {
        Self {
            id,
            subgraph,
            source: false,
            sink: false,
            real_time: false,
            propagates_metadata: false,
            elementary: false,
            delay_us: 0,
            kpps: 0,
            bw_bytes_per_sec: 0,
            stack_bytes: 0,
            allows_duty_cycling: true,
            inputs: Vec::new(),
            outputs: Vec::new(),
            controls: Vec::new(),
            output_format: None,
        }
    }

    /// Sets input and output port ids.
    pub fn with_ports(mut self, inputs: &[u32], outputs: &[u32]) -> Self {
        self.inputs = inputs.to_vec();
        self.outputs = outputs.to_vec();
        self
    }

    /// Sets the algorithmic delay.
    pub fn with_delay_us(mut self, delay_us: u32) -> Self {
        self.delay_us = delay_us;
        self
    }

    /// Returns `true` if the module has `port` in any direction.
    pub fn has_port(&self, port: u32) -> bool {
        self.inputs.contains(&port) || self.outputs.contains(&port) || self.controls.contains(&port)
    }

    /// Builds the runtime module description.
    pub fn spec(&self) -> ModuleSpec {
        let mut module = BasicModule::new()
            .with_delay_us(self.delay_us)
            .with_resources(self.kpps, self.bw_bytes_per_sec)
            .with_stack_bytes(self.stack_bytes)
            .with_duty_cycling(self.allows_duty_cycling);
        if let Some(format) = self.output_format {
            module = module.with_output_format(format.into());
        }
        ModuleSpec {
            id: ModuleId(self.id),
            subgraph: SubgraphId(self.subgraph),
            flags: ModuleFlags {
                is_source: self.source,
                is_sink: self.sink,
                real_time: self.real_time,
                propagates_metadata: self.propagates_metadata,
                elementary: self.elementary,
            },
            inputs: self.inputs.iter().copied().map(PortId).collect(),
            outputs: self.outputs.iter().copied().map(PortId).collect(),
            controls: self.controls.iter().copied().map(PortId).collect(),
            module: Box::new(module),
        }
    }
}

/// An internal data link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkConfig {
    /// Output port.
    pub from: PortRef,
    /// Input port.
    pub to: PortRef,
}

/// An input fed by another container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalInputConfig {
    /// The port.
    pub port: PortRef,
    /// Media format known up front.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaFormatConfig>,
}

/// Everything one graph open creates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphConfig {
    /// Subgraphs.
    #[serde(default)]
    pub subgraphs: Vec<SubgraphConfig>,
    /// Modules.
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    /// Internal links.
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    /// Inputs fed by other containers.
    #[serde(default)]
    pub external_inputs: Vec<ExternalInputConfig>,
    /// Outputs feeding other containers.
    #[serde(default)]
    pub external_outputs: Vec<PortRef>,
    /// Control ports linked to other containers.
    #[serde(default)]
    pub external_controls: Vec<PortRef>,
}

impl GraphConfig {
    /// Finds a module by id.
    pub fn module(&self, id: u32) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.id == id)
    }

    /// Returns `true` if `port` is an input of a declared module.
    pub fn is_input(&self, port: PortRef) -> bool {
        self.module(port.module)
            .is_some_and(|m| m.inputs.contains(&port.port))
    }

    /// Returns `true` if `port` is an output of a declared module.
    pub fn is_output(&self, port: PortRef) -> bool {
        self.module(port.module)
            .is_some_and(|m| m.outputs.contains(&port.port))
    }

    /// Builds the graph-open request.
    pub fn open_request(&self) -> GraphOpenRequest {
        GraphOpenRequest {
            subgraphs: self
                .subgraphs
                .iter()
                .map(|s| SubgraphDecl {
                    id: SubgraphId(s.id),
                    scenario: s.scenario.into(),
                })
                .collect(),
            modules: self.modules.iter().map(ModuleConfig::spec).collect(),
            links: self
                .links
                .iter()
                .map(|l| (l.from.into(), l.to.into()))
                .collect(),
            external_inputs: self
                .external_inputs
                .iter()
                .map(|e| ExternalInputDecl {
                    key: e.port.into(),
                    media: e.media.map(Into::into),
                })
                .collect(),
            external_outputs: self.external_outputs.iter().map(|&p| p.into()).collect(),
            external_controls: self.external_controls.iter().map(|&p| p.into()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> GraphConfig {
        let mut m = ModuleConfig::new(0x10, 1)
            .with_ports(&[0], &[1])
            .with_delay_us(250);
        m.propagates_metadata = true;
        GraphConfig {
            subgraphs: vec![SubgraphConfig {
                id: 1,
                scenario: ScenarioConfig::Voice,
            }],
            modules: vec![m],
            external_inputs: vec![ExternalInputConfig {
                port: PortRef::new(0x10, 0),
                media: Some(MediaFormatConfig {
                    format: FormatKind::Pcm,
                    sample_rate: 48_000,
                    channels: 2,
                    bits_per_sample: 16,
                }),
            }],
            external_outputs: vec![PortRef::new(0x10, 1)],
            ..GraphConfig::default()
        }
    }

    #[test]
    fn module_defaults_from_toml() {
        let m: ModuleConfig = toml::from_str("id = 0x20\nsubgraph = 2\ninputs = [0]").unwrap();
        assert_eq!(m.id, 0x20);
        assert!(m.allows_duty_cycling);
        assert!(!m.propagates_metadata);
        assert_eq!(m.inputs, vec![0]);
        assert!(m.outputs.is_empty());
    }

    #[test]
    fn port_directions() {
        let g = graph();
        assert!(g.is_input(PortRef::new(0x10, 0)));
        assert!(g.is_output(PortRef::new(0x10, 1)));
        assert!(!g.is_output(PortRef::new(0x10, 0)));
        assert!(!g.is_input(PortRef::new(0x99, 0)));
    }

    #[test]
    fn open_request_carries_everything() {
        let req = graph().open_request();
        assert_eq!(req.subgraphs[0].scenario, Scenario::Voice);
        assert_eq!(req.modules.len(), 1);
        assert!(req.modules[0].flags.propagates_metadata);
        assert_eq!(req.modules[0].outputs, vec![PortId(1)]);
        assert_eq!(
            req.external_inputs[0].media,
            Some(MediaFormat::pcm(48_000, 2, 16))
        );
        assert_eq!(req.external_outputs, vec![PortKey::new(0x10, 1)]);
    }

    #[test]
    fn raw_compressed_maps_data_format() {
        let m: MediaFormatConfig = toml::from_str(
            "format = \"raw_compressed\"\nsample_rate = 44100\nchannels = 2\nbits_per_sample = 16",
        )
        .unwrap();
        assert_eq!(MediaFormat::from(m).data_format, DataFormat::RawCompressed);
    }

    #[test]
    fn port_ref_display_is_hex_module() {
        assert_eq!(PortRef::new(0x10, 1).to_string(), "0x10:1");
    }
}
