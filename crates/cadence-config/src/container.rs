//! Container configuration file format and operations.

use std::path::Path;

use cadence_core::{
    ContainerSettings, DEFAULT_STACK_BYTES, FrameSize, HeapKind, ModuleId, RuntimePolicy,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::graph::GraphConfig;

/// How the container frame length is chosen.
///
/// Written as an inline table: `frame_size = { kind = "time_us", value = 5000 }`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FrameSizeConfig {
    /// The policy's default frame length.
    #[default]
    Default,
    /// A fixed duration in microseconds.
    TimeUs(u32),
    /// A fixed sample count.
    Samples(u32),
}

impl From<FrameSizeConfig> for FrameSize {
    fn from(f: FrameSizeConfig) -> Self {
        match f {
            FrameSizeConfig::Default => FrameSize::Default,
            FrameSizeConfig::TimeUs(us) => FrameSize::TimeUs(us),
            FrameSizeConfig::Samples(n) => FrameSize::Samples(n),
        }
    }
}

/// Heap the container allocates from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeapConfig {
    /// Regular heap.
    #[default]
    Default,
    /// Low-power island heap.
    LowPower,
}

impl From<HeapConfig> for HeapKind {
    fn from(h: HeapConfig) -> Self {
        match h {
            HeapConfig::Default => HeapKind::Default,
            HeapConfig::LowPower => HeapKind::LowPower,
        }
    }
}

/// The `[policy]` table. Every field is optional in TOML.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Regular buffers per external output.
    pub default_reg_bufs: u32,
    /// Buffers per raw-compressed output.
    pub raw_compressed_bufs: u32,
    /// Lowest latency vote in microseconds.
    pub latency_floor_us: u32,
    /// Real-time latency tolerance, percent.
    pub rt_latency_tolerance_pct: u32,
    /// Non-real-time latency tolerance, percent.
    pub nrt_latency_tolerance_pct: u32,
    /// Buffers an external input keeps back after a gap.
    pub ingress_prebuffer_retention: u32,
    /// Most messages an external input holds.
    pub max_ingress_elements: u32,
    /// Frame length of `frame_size = { kind = "default" }`.
    pub default_frame_len_us: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        RuntimePolicy::default().into()
    }
}

impl From<RuntimePolicy> for PolicyConfig {
    fn from(p: RuntimePolicy) -> Self {
        Self {
            default_reg_bufs: p.default_reg_bufs,
            raw_compressed_bufs: p.raw_compressed_bufs,
            latency_floor_us: p.latency_floor_us,
            rt_latency_tolerance_pct: p.rt_latency_pct,
            nrt_latency_tolerance_pct: p.nrt_latency_pct,
            ingress_prebuffer_retention: p.ingress_prebuffer_retention,
            max_ingress_elements: p.max_ingress_elements,
            default_frame_len_us: p.default_frame_len_us,
        }
    }
}

impl From<PolicyConfig> for RuntimePolicy {
    fn from(p: PolicyConfig) -> Self {
        Self {
            default_reg_bufs: p.default_reg_bufs,
            raw_compressed_bufs: p.raw_compressed_bufs,
            latency_floor_us: p.latency_floor_us,
            rt_latency_pct: p.rt_latency_tolerance_pct,
            nrt_latency_pct: p.nrt_latency_tolerance_pct,
            ingress_prebuffer_retention: p.ingress_prebuffer_retention,
            max_ingress_elements: p.max_ingress_elements,
            default_frame_len_us: p.default_frame_len_us,
        }
    }
}

fn default_stack_bytes() -> usize {
    DEFAULT_STACK_BYTES
}

/// One container: settings plus the graph it opens.
///
/// # TOML Format
///
/// ```toml
/// name = "decoder"
/// instance = 0x4000
/// signal_triggered = false
/// frame_size = { kind = "time_us", value = 5000 }
///
/// [policy]
/// default_reg_bufs = 3
///
/// [[subgraphs]]
/// id = 1
///
/// [[modules]]
/// id = 0x10
/// subgraph = 1
/// inputs = [0]
/// outputs = [1]
///
/// [[external_outputs]]
/// module = 0x10
/// port = 1
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Container name; also names its thread.
    pub name: String,
    /// Container instance id.
    pub instance: u32,
    /// Initial stack in bytes.
    #[serde(default = "default_stack_bytes")]
    pub stack_bytes: usize,
    /// Priority command handlers run at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_boost: Option<i32>,
    /// Heap kind.
    #[serde(default)]
    pub heap: HeapConfig,
    /// Processing triggered by a real-time signal.
    #[serde(default)]
    pub signal_triggered: bool,
    /// May take part in island duty cycling.
    #[serde(default)]
    pub duty_cycling_allowed: bool,
    /// Accepts partial input frames.
    #[serde(default)]
    pub variable_input: bool,
    /// Consumes from a single buffer.
    #[serde(default)]
    pub single_buffer_mode: bool,
    /// Frame length choice.
    #[serde(default)]
    pub frame_size: FrameSizeConfig,
    /// Tunables.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// The graph opened at startup.
    #[serde(flatten)]
    pub graph: GraphConfig,
}

impl ContainerConfig {
    /// A container with default settings and an empty graph.
    pub fn new(name: impl Into<String>, instance: u32) -> Self {
        Self {
            name: name.into(),
            instance,
            stack_bytes: DEFAULT_STACK_BYTES,
            priority_boost: None,
            heap: HeapConfig::Default,
            signal_triggered: false,
            duty_cycling_allowed: false,
            variable_input: false,
            single_buffer_mode: false,
            frame_size: FrameSizeConfig::Default,
            policy: PolicyConfig::default(),
            graph: GraphConfig::default(),
        }
    }

    /// Sets the frame size.
    pub fn with_frame_size(mut self, frame_size: FrameSizeConfig) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Sets the graph.
    pub fn with_graph(mut self, graph: GraphConfig) -> Self {
        self.graph = graph;
        self
    }

    /// Load a container configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), name = %config.name, "container config loaded");
        Ok(config)
    }

    /// Load a container configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Save to a TOML file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        crate::write_toml(path.as_ref(), &self.to_toml()?)
    }

    /// Convert to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Runtime settings for [`cadence_core::Container::new`].
    pub fn settings(&self) -> ContainerSettings {
        ContainerSettings {
            name: self.name.clone(),
            instance: ModuleId(self.instance),
            frame_size: self.frame_size.into(),
            stack_bytes: self.stack_bytes,
            priority_boost: self.priority_boost,
            heap: self.heap.into(),
            signal_triggered: self.signal_triggered,
            duty_cycling_allowed: self.duty_cycling_allowed,
            variable_input: self.variable_input,
            single_buffer_mode: self.single_buffer_mode,
            policy: self.policy.into(),
        }
    }
}
