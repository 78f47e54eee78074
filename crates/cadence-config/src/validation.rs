//! Structural validation of container and system configurations.
//!
//! Validation collects every problem rather than stopping at the first;
//! a single problem is returned as-is, several as
//! [`ValidationError::Multiple`].

use std::collections::BTreeSet;

use thiserror::Error;

use crate::container::{ContainerConfig, FrameSizeConfig};
use crate::graph::{GraphConfig, PortRef};
use crate::system::SystemConfig;

/// Validation error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Two containers share a name.
    #[error("duplicate container name: {0}")]
    DuplicateContainer(String),

    /// An id is used twice where it must be unique.
    #[error("duplicate {what} id 0x{id:X}")]
    DuplicateId {
        /// Kind of id.
        what: &'static str,
        /// The id.
        id: u32,
    },

    /// A module names a subgraph that is not declared.
    #[error("module 0x{module:X} names unknown subgraph {subgraph}")]
    UnknownSubgraph {
        /// Module id.
        module: u32,
        /// Subgraph id.
        subgraph: u32,
    },

    /// A reference to a port that does not exist with the needed direction.
    #[error("{context}: no {direction} port {port}")]
    UnknownPort {
        /// Where the reference was found.
        context: String,
        /// Expected direction.
        direction: &'static str,
        /// The reference.
        port: PortRef,
    },

    /// A frame size of zero.
    #[error("container '{0}': frame size must be non-zero")]
    ZeroFrameSize(String),

    /// A delay path with id 0.
    #[error("path id 0 is reserved")]
    ZeroPathId,

    /// Multiple validation errors.
    #[error("multiple validation errors: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

fn collapse(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}

fn check_unique(
    what: &'static str,
    ids: impl IntoIterator<Item = u32>,
    errors: &mut Vec<ValidationError>,
) {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            errors.push(ValidationError::DuplicateId { what, id });
        }
    }
}

fn check_port(
    ok: bool,
    context: &str,
    direction: &'static str,
    port: PortRef,
    errors: &mut Vec<ValidationError>,
) {
    if !ok {
        errors.push(ValidationError::UnknownPort {
            context: context.to_string(),
            direction,
            port,
        });
    }
}

fn graph_errors(name: &str, g: &GraphConfig, errors: &mut Vec<ValidationError>) {
    check_unique("subgraph", g.subgraphs.iter().map(|s| s.id), errors);
    check_unique("module", g.modules.iter().map(|m| m.id), errors);

    let sgs: BTreeSet<u32> = g.subgraphs.iter().map(|s| s.id).collect();
    for m in &g.modules {
        if !sgs.contains(&m.subgraph) {
            errors.push(ValidationError::UnknownSubgraph {
                module: m.id,
                subgraph: m.subgraph,
            });
        }
    }

    let ctx = format!("container '{name}' link");
    for l in &g.links {
        check_port(g.is_output(l.from), &ctx, "output", l.from, errors);
        check_port(g.is_input(l.to), &ctx, "input", l.to, errors);
    }
    let ctx = format!("container '{name}' external input");
    for e in &g.external_inputs {
        check_port(g.is_input(e.port), &ctx, "input", e.port, errors);
    }
    let ctx = format!("container '{name}' external output");
    for &p in &g.external_outputs {
        check_port(g.is_output(p), &ctx, "output", p, errors);
    }
    let ctx = format!("container '{name}' external control");
    for &p in &g.external_controls {
        let ok = g
            .module(p.module)
            .is_some_and(|m| m.controls.contains(&p.port));
        check_port(ok, &ctx, "control", p, errors);
    }
}

fn container_errors(c: &ContainerConfig, errors: &mut Vec<ValidationError>) {
    let zero_frame = matches!(
        c.frame_size,
        FrameSizeConfig::TimeUs(0) | FrameSizeConfig::Samples(0)
    ) || (c.frame_size == FrameSizeConfig::Default && c.policy.default_frame_len_us == 0);
    if zero_frame {
        errors.push(ValidationError::ZeroFrameSize(c.name.clone()));
    }
    graph_errors(&c.name, &c.graph, errors);
}

/// Validates one container configuration.
pub fn validate_container(c: &ContainerConfig) -> ValidationResult<()> {
    let mut errors = Vec::new();
    container_errors(c, &mut errors);
    collapse(errors)
}

/// Validates a system: every container, unique names and ids across
/// containers, connections between existing external ports, path ids.
pub fn validate_system(sys: &SystemConfig) -> ValidationResult<()> {
    let mut errors = Vec::new();

    let mut names = BTreeSet::new();
    for c in &sys.containers {
        if !names.insert(c.name.as_str()) {
            errors.push(ValidationError::DuplicateContainer(c.name.clone()));
        }
        container_errors(c, &mut errors);
    }
    check_unique("container instance", sys.containers.iter().map(|c| c.instance), &mut errors);
    check_unique(
        "module",
        sys.containers
            .iter()
            .flat_map(|c| c.graph.modules.iter().map(|m| m.id)),
        &mut errors,
    );

    let is_ext_out = |p: PortRef| {
        sys.containers
            .iter()
            .any(|c| c.graph.external_outputs.contains(&p))
    };
    let is_ext_in = |p: PortRef| {
        sys.containers
            .iter()
            .any(|c| c.graph.external_inputs.iter().any(|e| e.port == p))
    };
    for conn in &sys.connections {
        check_port(is_ext_out(conn.from), "connection", "external output", conn.from, &mut errors);
        check_port(is_ext_in(conn.to), "connection", "external input", conn.to, &mut errors);
    }

    for path in &sys.paths {
        if path.id == 0 {
            errors.push(ValidationError::ZeroPathId);
        }
    }
    check_unique("path", sys.paths.iter().map(|p| p.id), &mut errors);

    if errors.is_empty() {
        tracing::debug!(containers = sys.containers.len(), "system config valid");
    }
    collapse(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ExternalInputConfig, LinkConfig, ModuleConfig, SubgraphConfig};
    use crate::system::{ConnectionConfig, PathConfig};

    fn container(name: &str, instance: u32, module: u32) -> ContainerConfig {
        ContainerConfig::new(name, instance).with_graph(GraphConfig {
            subgraphs: vec![SubgraphConfig {
                id: 1,
                scenario: Default::default(),
            }],
            modules: vec![ModuleConfig::new(module, 1).with_ports(&[0], &[1])],
            external_inputs: vec![ExternalInputConfig {
                port: PortRef::new(module, 0),
                media: None,
            }],
            external_outputs: vec![PortRef::new(module, 1)],
            ..GraphConfig::default()
        })
    }

    #[test]
    fn valid_container_passes() {
        assert_eq!(validate_container(&container("a", 0x4000, 0x10)), Ok(()));
    }

    #[test]
    fn zero_frame_size_is_rejected() {
        let c = container("a", 0x4000, 0x10).with_frame_size(FrameSizeConfig::TimeUs(0));
        assert_eq!(
            validate_container(&c),
            Err(ValidationError::ZeroFrameSize("a".into()))
        );
    }

    #[test]
    fn link_to_unknown_port_is_rejected() {
        let mut c = container("a", 0x4000, 0x10);
        c.graph.links.push(LinkConfig {
            from: PortRef::new(0x10, 1),
            to: PortRef::new(0x11, 0),
        });
        let err = validate_container(&c).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::UnknownPort { direction: "input", .. }
        ));
        assert!(err.to_string().contains("0x11:0"), "got: {err}");
    }

    #[test]
    fn several_problems_are_collected() {
        let mut c = container("a", 0x4000, 0x10);
        c.graph.modules.push(ModuleConfig::new(0x10, 7));
        match validate_container(&c) {
            Err(ValidationError::Multiple(errs)) => {
                assert!(errs.contains(&ValidationError::DuplicateId {
                    what: "module",
                    id: 0x10
                }));
                assert!(errs.contains(&ValidationError::UnknownSubgraph {
                    module: 0x10,
                    subgraph: 7
                }));
            }
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn system_checks_names_connections_and_paths() {
        let sys = SystemConfig {
            name: "s".into(),
            containers: vec![container("a", 0x4000, 0x10), container("a", 0x4100, 0x20)],
            connections: vec![ConnectionConfig {
                from: PortRef::new(0x10, 0),
                to: PortRef::new(0x20, 0),
            }],
            paths: vec![PathConfig {
                id: 0,
                vertices: Vec::new(),
            }],
        };
        let Err(ValidationError::Multiple(errs)) = validate_system(&sys) else {
            panic!("expected multiple errors");
        };
        assert!(errs.contains(&ValidationError::DuplicateContainer("a".into())));
        assert!(errs.contains(&ValidationError::ZeroPathId));
        assert!(errs.iter().any(|e| matches!(
            e,
            ValidationError::UnknownPort { direction: "external output", .. }
        )));
    }

    #[test]
    fn modules_must_be_unique_across_containers() {
        let sys = SystemConfig {
            containers: vec![container("a", 0x4000, 0x10), container("b", 0x4100, 0x10)],
            ..SystemConfig::default()
        };
        assert_eq!(
            validate_system(&sys),
            Err(ValidationError::DuplicateId {
                what: "module",
                id: 0x10
            })
        );
    }
}
