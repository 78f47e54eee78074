//! Cadence Core - container runtime for signal-processing graphs
//!
//! A *container* is one thread running one event loop. It hosts any number
//! of subgraphs of processing modules and exchanges data and control with
//! other containers through queues only. An external orchestrator drives it
//! with commands: open, connect, prepare, start, stop, suspend, flush,
//! disconnect, close and configuration.
//!
//! # Core Abstractions
//!
//! ## Runtime
//!
//! - [`Container`] - graph, external ports, votes and event clients of one container
//! - [`ContainerThread`] - a container on its own OS thread, with stack relaunch
//! - [`EventLoop`] - one wait channel, one handler per signaled bit
//!
//! ## Transport
//!
//! - [`WaitChannel`] / [`Signal`] - the bitmask a container blocks on
//! - [`QueueSender`] / [`QueueReceiver`] - message queues bound to one bit
//! - [`BufferPool`] - buffers that return to their pool when dropped
//!
//! ## Boundaries
//!
//! - [`PortEndpoint`] / [`PeerLink`] - how containers find each other
//! - [`icb::negotiate`] - inter-container buffering
//! - [`PropagatedProperty`] - deduplicated property propagation
//! - [`IngressQueue`] - ingress prebuffer retention
//!
//! ## Services
//!
//! - [`PowerVoter`] - clock, bandwidth, latency and island votes
//! - [`DutyCycleState`] - island entry/exit handshake
//! - [`EventRegistry`] - client subscriptions and raised events
//! - [`PathDelayRegistry`] - persisted end-to-end delay paths
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence_core::{Command, Container, ContainerServices, ContainerSettings, ContainerThread};
//!
//! let cntr = Container::new(ContainerSettings::default(), ContainerServices::default())?;
//! let thread = ContainerThread::spawn(cntr)?;
//! let ack = thread.call(Command::GraphOpen(request), timeout)?;
//! ```

pub mod container;
pub mod duty_cycle;
pub mod error;
pub mod event_loop;
pub mod events;
pub mod flags;
pub mod graph;
pub mod icb;
pub mod ids;
pub mod media;
pub mod params;
pub mod path_delay;
pub mod ports;
pub mod power;
pub mod prebuffer;
pub mod propagation;
pub mod state;
pub mod transport;

// Re-export main types at crate root
pub use container::{
    AckPayload, CmdAck, Command, Container, ContainerServices, ContainerSettings, ContainerThread,
    DEFAULT_STACK_BYTES, Envelope, ExternalInputDecl, FrameSize, GraphOpenRequest, HeapKind,
    Opcode, PathDelayOp, RuntimePolicy, SubgraphDecl,
};
pub use duty_cycle::{DcmRequest, DutyCycleManager, DutyCycleState, IslandAck};
pub use error::{BatchResult, CntrError, CntrResult, ErrorKind};
pub use event_loop::{Dispatch, EventLoop, HandlerKind, LoopControl, LoopExit, ThreadPriority};
pub use events::{ClientAddress, EventOwner, EventRegistry, RaisedEvent};
pub use flags::FwkEventFlags;
pub use graph::{BasicModule, Graph, Module, ModuleFlags, ModuleResources, ModuleSpec};
pub use icb::{IcbInfo, IcbMode, IcbResult};
pub use ids::{ModuleId, PathId, PathSelector, PortId, PortKey, SubgraphId};
pub use media::{DataFormat, FrameLength, MediaFormat, Scenario, Timestamp};
pub use params::{Framing, ParamRecord};
pub use path_delay::{DelayBreakdown, DelaySink, PathDelayRegistry};
pub use ports::{PeerHandle, PeerLink, PortEndpoint};
pub use power::{PmMode, PowerManager, PowerVoter, TracingPowerManager};
pub use prebuffer::IngressQueue;
pub use propagation::{PortProperty, PropagatedProperty};
pub use state::{PortState, SubgraphOp, SubgraphState};
pub use transport::{
    BufferPool, DataBuffer, DataMessage, Marker, PooledBuf, QueueReceiver, QueueSender, Signal,
    WaitChannel,
};
