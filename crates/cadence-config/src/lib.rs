//! Configuration for cadence container runtimes.
//!
//! Containers and whole systems are described in TOML: container settings,
//! runtime policy tunables, the graph each container opens, and the links
//! between containers.
//!
//! # Features
//!
//! - **Containers**: settings, `[policy]` tunables and the startup graph
//! - **Systems**: several containers, cross-container connections and delay paths
//! - **Validation**: duplicate ids, dangling port references, zero frame sizes
//! - **Conversion**: into [`cadence_core::ContainerSettings`] and
//!   [`cadence_core::GraphOpenRequest`]
//!
//! # Example
//!
//! ```rust,no_run
//! use cadence_config::{SystemConfig, validate_system};
//!
//! let system = SystemConfig::load("playback.toml").unwrap();
//! validate_system(&system).unwrap();
//! for container in &system.containers {
//!     let settings = container.settings();
//!     let request = container.graph.open_request();
//!     println!("{}: {} modules", settings.name, request.modules.len());
//! }
//! ```

mod container;
mod error;
mod graph;
mod system;

/// Structural validation.
pub mod validation;

use std::path::Path;

pub use container::{ContainerConfig, FrameSizeConfig, HeapConfig, PolicyConfig};
pub use error::ConfigError;
pub use graph::{
    ExternalInputConfig, FormatKind, GraphConfig, LinkConfig, MediaFormatConfig, ModuleConfig,
    PortRef, ScenarioConfig, SubgraphConfig,
};
pub use system::{ConnectionConfig, PathConfig, SystemConfig};
pub use validation::{ValidationError, ValidationResult, validate_container, validate_system};

fn write_toml(path: &Path, content: &str) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
    }
    std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
    tracing::debug!(path = %path.display(), "config written");
    Ok(())
}
