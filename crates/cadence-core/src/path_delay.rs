//! Path delay aggregation.
//!
//! A path is an ordered list of (module, port) vertices that may cross
//! several containers. Each container sums what it owns: algorithmic delay
//! of its modules, ingress buffering at external inputs and egress
//! buffering at external outputs. Vertices owned by other containers are
//! skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{CntrError, CntrResult};
use crate::graph::PortDirection;
use crate::ids::{ModuleId, PathId, PathSelector, PortId, PortKey};

/// Caller-owned accumulator a persisted path writes its delay into.
pub type DelaySink = Arc<AtomicU32>;

/// Where one path's delay comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DelayBreakdown {
    /// Sum of module algorithmic delays.
    pub algo_us: u32,
    /// Sum of external input buffering delays.
    pub ext_in_us: u32,
    /// Sum of external output buffering delays.
    pub ext_out_us: u32,
}

impl DelayBreakdown {
    /// Total delay.
    pub fn total_us(&self) -> u32 {
        self.algo_us
            .saturating_add(self.ext_in_us)
            .saturating_add(self.ext_out_us)
    }
}

/// Read access to the delays a container knows about.
pub trait DelaySource {
    /// Direction of a port owned by this container, `None` if not owned.
    fn direction(&self, key: PortKey) -> Option<PortDirection>;

    /// Returns `true` for source and sink modules.
    fn is_source_or_sink(&self, module: ModuleId) -> bool;

    /// Algorithmic delay of a module between two of its ports.
    fn algorithmic_delay_us(
        &self,
        module: ModuleId,
        input: Option<PortId>,
        output: Option<PortId>,
    ) -> u32;

    /// Buffering delay if `key` is an external input.
    fn ext_input_delay_us(&self, key: PortKey) -> Option<u32>;

    /// Buffering delay if `key` is an external output.
    fn ext_output_delay_us(&self, key: PortKey) -> Option<u32>;
}

fn port_as(dir: PortDirection, want: PortDirection, port: PortId) -> Option<PortId> {
    (dir == want).then_some(port)
}

/// Computes the local share of a path's delay.
///
/// Algorithmic delay is queried at source and sink vertices, and when two
/// consecutive vertices sit on the same module (its input-to-output delay,
/// counted once per traversal).
pub fn compute(path: &[PortKey], source: &impl DelaySource) -> DelayBreakdown {
    let mut out = DelayBreakdown::default();
    let mut ext_ins = 0usize;
    let mut ext_outs = 0usize;
    let mut prev: Option<(PortKey, PortDirection)> = None;

    for &v in path {
        let Some(dir) = source.direction(v) else {
            prev = None;
            continue;
        };

        if let Some(d) = source.ext_input_delay_us(v) {
            out.ext_in_us = out.ext_in_us.saturating_add(d);
            ext_ins += 1;
        }
        if let Some(d) = source.ext_output_delay_us(v) {
            out.ext_out_us = out.ext_out_us.saturating_add(d);
            ext_outs += 1;
        }

        let algo = match prev {
            Some((p, pdir)) if p.module == v.module => Some(source.algorithmic_delay_us(
                v.module,
                port_as(pdir, PortDirection::Input, p.port),
                port_as(dir, PortDirection::Output, v.port),
            )),
            _ if source.is_source_or_sink(v.module) => Some(source.algorithmic_delay_us(
                v.module,
                port_as(dir, PortDirection::Input, v.port),
                port_as(dir, PortDirection::Output, v.port),
            )),
            _ => None,
        };
        if let Some(a) = algo {
            out.algo_us = out.algo_us.saturating_add(a);
        }
        prev = Some((v, dir));
    }

    if ext_ins > 1 || ext_outs > 1 {
        tracing::debug!(ext_ins, ext_outs, "path enters this container more than once");
    }
    out
}

/// Result of re-evaluating one persisted path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathUpdate {
    /// Path id.
    pub id: PathId,
    /// New delay.
    pub delay_us: u32,
    /// Differs from the previous value.
    pub changed: bool,
}

#[derive(Debug)]
struct PersistedPath {
    id: PathId,
    vertices: Vec<PortKey>,
    sink: DelaySink,
    last_us: Option<u32>,
}

/// Paths persisted for re-evaluation.
#[derive(Debug, Default)]
pub struct PathDelayRegistry {
    paths: Vec<PersistedPath>,
}

impl PathDelayRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists a path. Duplicate ids are rejected.
    pub fn configure(&mut self, id: PathId, vertices: Vec<PortKey>, sink: DelaySink) -> CntrResult<()> {
        if self.paths.iter().any(|p| p.id == id) {
            return Err(CntrError::bad_param(format!("path {id} already configured")));
        }
        self.paths.push(PersistedPath {
            id,
            vertices,
            sink,
            last_us: None,
        });
        Ok(())
    }

    /// Destroys one path or all. Returns how many were removed.
    ///
    /// Destroying an unknown single path fails with `BadParam`.
    pub fn destroy(&mut self, selector: PathSelector) -> CntrResult<usize> {
        let before = self.paths.len();
        self.paths.retain(|p| !selector.matches(p.id));
        let removed = before - self.paths.len();
        if removed == 0
            && let PathSelector::Path(id) = selector
        {
            return Err(CntrError::bad_param(format!("no path {id}")));
        }
        Ok(removed)
    }

    /// Recomputes selected paths and writes each into its sink.
    pub fn update(
        &mut self,
        selector: PathSelector,
        source: &impl DelaySource,
    ) -> Vec<PathUpdate> {
        let mut updates = Vec::new();
        for path in self.paths.iter_mut().filter(|p| selector.matches(p.id)) {
            let delay_us = compute(&path.vertices, source).total_us();
            let changed = path.last_us != Some(delay_us);
            path.last_us = Some(delay_us);
            path.sink.store(delay_us, Ordering::Release);
            updates.push(PathUpdate {
                id: path.id,
                delay_us,
                changed,
            });
        }
        updates
    }

    /// Number of persisted paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns `true` if nothing is persisted.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Persisted path ids in configuration order.
    pub fn ids(&self) -> impl Iterator<Item = PathId> + '_ {
        self.paths.iter().map(|p| p.id)
    }
}
