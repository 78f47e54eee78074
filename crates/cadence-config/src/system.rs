//! Several containers wired together.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::container::ContainerConfig;
use crate::error::ConfigError;
use crate::graph::PortRef;

/// A cross-container link from an external output to an external input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Upstream external output.
    pub from: PortRef,
    /// Downstream external input.
    pub to: PortRef,
}

/// A delay path to persist and report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathConfig {
    /// Path id; 0 is reserved.
    pub id: u32,
    /// Vertices in path order, possibly across containers.
    pub vertices: Vec<PortRef>,
}

/// A whole system.
///
/// ```toml
/// name = "playback"
///
/// [[containers]]
/// name = "decoder"
/// instance = 0x4000
///
/// [[connections]]
/// from = { module = 0x10, port = 1 }
/// to = { module = 0x20, port = 0 }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemConfig {
    /// System name.
    #[serde(default)]
    pub name: String,
    /// Containers.
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
    /// Cross-container links.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    /// Delay paths.
    #[serde(default)]
    pub paths: Vec<PathConfig>,
}

impl SystemConfig {
    /// Load a system configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(
            path = %path.display(),
            containers = config.containers.len(),
            connections = config.connections.len(),
            "system config loaded"
        );
        Ok(config)
    }

    /// Load a system configuration from a TOML string.
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

    /// Finds a container by name.
    pub fn container(&self, name: &str) -> Result<&ContainerConfig, ConfigError> {
        self.containers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigError::ContainerNotFound(name.to_string()))
    }

    /// Index of the container that owns `module`.
    pub fn owner_of(&self, module: u32) -> Option<usize> {
        self.containers
            .iter()
            .position(|c| c.graph.module(module).is_some())
    }

    /// Container indices ordered downstream first.
    ///
    /// Connecting in this order lets every downstream report its buffering
    /// needs before its upstream negotiates. Cycles fall back to
    /// declaration order for the remaining containers.
    pub fn downstream_first(&self) -> Vec<usize> {
        let n = self.containers.len();
        let edges: Vec<(usize, usize)> = self
            .connections
            .iter()
            .filter_map(|c| Some((self.owner_of(c.from.module)?, self.owner_of(c.to.module)?)))
            .filter(|(a, b)| a != b)
            .collect();

        let mut order = Vec::with_capacity(n);
        let mut placed = vec![false; n];
        while order.len() < n {
            // a container is ready once all its downstreams are placed
            let next = (0..n).find(|&i| {
                !placed[i] && edges.iter().all(|&(from, to)| from != i || placed[to])
            });
            let Some(i) = next.or_else(|| (0..n).find(|&i| !placed[i])) else {
                break;
            };
            placed[i] = true;
            order.push(i);
        }
        order
    }

    /// External outputs that feed no other container.
    pub fn terminal_outputs(&self) -> Vec<PortRef> {
        self.containers
            .iter()
            .flat_map(|c| c.graph.external_outputs.iter().copied())
            .filter(|p| !self.connections.iter().any(|c| c.from == *p))
            .collect()
    }

    /// External inputs no other container feeds.
    pub fn entry_inputs(&self) -> Vec<PortRef> {
        self.containers
            .iter()
            .flat_map(|c| c.graph.external_inputs.iter().map(|e| e.port))
            .filter(|p| !self.connections.iter().any(|c| c.to == *p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphConfig, ModuleConfig};

    fn passthrough(name: &str, instance: u32, module: u32) -> ContainerConfig {
        ContainerConfig::new(name, instance).with_graph(GraphConfig {
            modules: vec![ModuleConfig::new(module, 1).with_ports(&[0], &[1])],
            external_inputs: vec![crate::graph::ExternalInputConfig {
                port: PortRef::new(module, 0),
                media: None,
            }],
            external_outputs: vec![PortRef::new(module, 1)],
            ..GraphConfig::default()
        })
    }

    fn chain() -> SystemConfig {
        SystemConfig {
            name: "chain".into(),
            containers: vec![
                passthrough("a", 0x4000, 0x10),
                passthrough("b", 0x4100, 0x20),
                passthrough("c", 0x4200, 0x30),
            ],
            connections: vec![
                ConnectionConfig {
                    from: PortRef::new(0x10, 1),
                    to: PortRef::new(0x20, 0),
                },
                ConnectionConfig {
                    from: PortRef::new(0x20, 1),
                    to: PortRef::new(0x30, 0),
                },
            ],
            paths: Vec::new(),
        }
    }

    #[test]
    fn downstream_containers_come_first() {
        assert_eq!(chain().downstream_first(), vec![2, 1, 0]);
    }

    #[test]
    fn cycles_still_order_everything() {
        let mut sys = chain();
        sys.connections.push(ConnectionConfig {
            from: PortRef::new(0x30, 1),
            to: PortRef::new(0x10, 0),
        });
        let mut order = sys.downstream_first();
        order.sort_unstable();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn entry_and_terminal_ports() {
        let sys = chain();
        assert_eq!(sys.entry_inputs(), vec![PortRef::new(0x10, 0)]);
        assert_eq!(sys.terminal_outputs(), vec![PortRef::new(0x30, 1)]);
        assert_eq!(sys.owner_of(0x20), Some(1));
        assert_eq!(sys.owner_of(0x99), None);
    }

    #[test]
    fn container_lookup_by_name() {
        let sys = chain();
        assert_eq!(sys.container("b").unwrap().instance, 0x4100);
        assert!(matches!(
            sys.container("zz"),
            Err(ConfigError::ContainerNotFound(_))
        ));
    }
}
