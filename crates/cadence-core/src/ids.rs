//! Identifier newtypes.
//!
//! Module instance ids, port ids and subgraph ids are assigned by the
//! orchestrator and stay stable for the lifetime of the graph. A
//! [`PortKey`] names one port of one module and is the identity used for
//! external ports across containers.

use core::fmt;
use core::num::NonZeroU32;

/// Module instance identifier. The container itself also owns one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub u32);

/// Port identifier, unique within one module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u32);

/// Subgraph identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubgraphId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SubgraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// A (module, port) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortKey {
    /// Owning module.
    pub module: ModuleId,
    /// Port id on that module.
    pub port: PortId,
}

impl PortKey {
    /// Creates a port key from raw ids.
    pub const fn new(module: u32, port: u32) -> Self {
        Self {
            module: ModuleId(module),
            port: PortId(port),
        }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.module, self.port)
    }
}

/// A delay path id. Never zero: zero is reserved for "all paths".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathId(NonZeroU32);

impl PathId {
    /// Creates a path id, rejecting the reserved value 0.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Returns the raw value.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Selects one delay path or all of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PathSelector {
    /// Every persisted path (wire value 0).
    All,
    /// A single path.
    Path(PathId),
}

impl PathSelector {
    /// Decodes a raw wire value, mapping 0 to [`PathSelector::All`].
    pub fn from_raw(raw: u32) -> Self {
        PathId::new(raw).map_or(Self::All, Self::Path)
    }

    /// Returns `true` if `id` is selected.
    pub fn matches(self, id: PathId) -> bool {
        match self {
            Self::All => true,
            Self::Path(p) => p == id,
        }
    }
}
