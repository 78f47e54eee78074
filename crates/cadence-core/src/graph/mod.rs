//! Graph model consumed by the container.
//!
//! The container owns one [`Graph`]: subgraphs with their lifecycle state,
//! module instances behind the [`Module`] capability trait, their ports,
//! and the internal links between them. The sorted module list and the
//! real-time/media-format propagation passes live in `sort`.

mod model;
mod module;
mod sort;

pub use model::{Graph, InPort, ModuleFlags, ModuleNode, ModuleSpec, OutPort, Subgraph};
pub use module::{
    BasicModule, EventTracking, Module, ModuleResources, PortDirection, PortOp,
};
pub use sort::RtChanges;
