//! Commands a container accepts, and their acknowledgments.
//!
//! Orchestrator commands travel in an [`Envelope`] with a reply channel
//! and are answered with exactly one [`CmdAck`]. Peer messages between
//! containers use the same queue without a reply.

use core::fmt;

use crossbeam_channel::{Receiver, Sender};

use crate::duty_cycle::{DcmRequest, IslandAck};
use crate::error::CntrResult;
use crate::events::ClientAddress;
use crate::graph::ModuleSpec;
use crate::icb::IcbInfo;
use crate::ids::{PathId, PathSelector, PortKey, SubgraphId};
use crate::media::{FrameLength, MediaFormat, Scenario};
use crate::params::Framing;
use crate::path_delay::{DelayBreakdown, DelaySink};
use crate::ports::{PeerLink, PortEndpoint};
use crate::propagation::PortProperty;
use crate::state::SubgraphOp;

/// A subgraph declared in a graph-open request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubgraphDecl {
    /// Subgraph id.
    pub id: SubgraphId,
    /// Scenario tag.
    pub scenario: Scenario,
}

/// An external input declared in a graph-open request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExternalInputDecl {
    /// Port.
    pub key: PortKey,
    /// Media format known up front, if any.
    pub media: Option<MediaFormat>,
}

/// Everything created by one graph open.
#[derive(Default)]
pub struct GraphOpenRequest {
    /// Subgraphs.
    pub subgraphs: Vec<SubgraphDecl>,
    /// Modules.
    pub modules: Vec<ModuleSpec>,
    /// Internal links, output to input.
    pub links: Vec<(PortKey, PortKey)>,
    /// Inputs fed by other containers.
    pub external_inputs: Vec<ExternalInputDecl>,
    /// Outputs feeding other containers.
    pub external_outputs: Vec<PortKey>,
    /// Control ports linked to other containers.
    pub external_controls: Vec<PortKey>,
}

impl fmt::Debug for GraphOpenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphOpenRequest")
            .field("subgraphs", &self.subgraphs)
            .field(
                "modules",
                &self.modules.iter().map(|m| m.id).collect::<Vec<_>>(),
            )
            .field("links", &self.links)
            .field("external_inputs", &self.external_inputs)
            .field("external_outputs", &self.external_outputs)
            .field("external_controls", &self.external_controls)
            .finish()
    }
}

/// Path-delay operations.
#[derive(Debug)]
pub enum PathDelayOp {
    /// Compute once; nothing is kept.
    Query {
        /// Vertices in path order.
        path: Vec<PortKey>,
    },
    /// Persist a path and write its delay into `sink` now and on changes.
    Configure {
        /// Path id (never 0).
        id: PathId,
        /// Vertices in path order.
        path: Vec<PortKey>,
        /// Caller-owned accumulator.
        sink: DelaySink,
    },
    /// Recompute persisted paths.
    Update(PathSelector),
    /// Forget persisted paths.
    Destroy(PathSelector),
}

/// A message on a container's command queue.
#[derive(Debug)]
pub enum Command {
    /// Create subgraphs, modules and ports.
    GraphOpen(GraphOpenRequest),
    /// Set peer handles of external ports.
    GraphConnect(Vec<PeerLink>),
    /// Clear peer handles of external ports.
    GraphDisconnect(Vec<PortKey>),
    /// Lifecycle operation on subgraphs and connected ports.
    GraphMgmt {
        /// Operation.
        op: SubgraphOp,
        /// Subgraphs operated on.
        subgraphs: Vec<SubgraphId>,
        /// External ports whose peer is operated on too.
        ports: Vec<PortKey>,
    },
    /// Packed set-configuration.
    SetCfg {
        /// Record framing.
        framing: Framing,
        /// Packed records.
        payload: Vec<u8>,
    },
    /// Packed get-configuration; records carry the capacity to fill.
    GetCfg {
        /// Record framing.
        framing: Framing,
        /// Packed records.
        payload: Vec<u8>,
    },
    /// Per-instance records sent one fragment at a time.
    SetCfgFragmented(Vec<Vec<u8>>),
    /// Packed event (de)registrations for one client.
    RegisterEvents {
        /// Reply address of the client.
        client: ClientAddress,
        /// Packed registrations.
        payload: Vec<u8>,
    },
    /// Path-delay configure/query/update/destroy.
    PathDelay(PathDelayOp),
    /// Request from the duty-cycling manager.
    DutyCycle(DcmRequest),
    /// Peer: properties for one of our ports.
    PortProperty {
        /// Receiving port.
        port: PortKey,
        /// At most two properties.
        properties: Vec<PortProperty>,
    },
    /// Peer: buffering info from the downstream input.
    IcbInfo {
        /// Receiving external output.
        port: PortKey,
        /// Report.
        info: IcbInfo,
    },
    /// Peer: the upstream output saw our stop and stopped sending.
    UpstreamStopped {
        /// Receiving external input.
        port: PortKey,
    },
    /// Peer: media format on the control path.
    MediaFormat {
        /// Receiving external input.
        port: PortKey,
        /// Format.
        format: MediaFormat,
        /// Upstream frame length.
        frame: FrameLength,
    },
    /// Tear the container down and end its thread.
    Destroy,
    /// Anything else; always unsupported.
    Custom {
        /// Raw opcode.
        opcode: u32,
    },
}

/// Opcode of a command, for acknowledgments and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// [`Command::GraphOpen`].
    GraphOpen,
    /// [`Command::GraphConnect`].
    GraphConnect,
    /// [`Command::GraphDisconnect`].
    GraphDisconnect,
    /// [`Command::GraphMgmt`].
    GraphMgmt(SubgraphOp),
    /// [`Command::SetCfg`].
    SetCfg,
    /// [`Command::GetCfg`].
    GetCfg,
    /// [`Command::SetCfgFragmented`].
    SetCfgFragmented,
    /// [`Command::RegisterEvents`].
    RegisterEvents,
    /// [`Command::PathDelay`].
    PathDelay,
    /// [`Command::DutyCycle`].
    DutyCycle,
    /// [`Command::PortProperty`].
    PortProperty,
    /// [`Command::IcbInfo`].
    IcbInfo,
    /// [`Command::UpstreamStopped`].
    UpstreamStopped,
    /// [`Command::MediaFormat`].
    MediaFormat,
    /// [`Command::Destroy`].
    Destroy,
    /// [`Command::Custom`].
    Custom(u32),
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GraphOpen => f.write_str("graph_open"),
            Self::GraphConnect => f.write_str("graph_connect"),
            Self::GraphDisconnect => f.write_str("graph_disconnect"),
            Self::GraphMgmt(op) => write!(f, "graph_{op}"),
            Self::SetCfg => f.write_str("set_cfg"),
            Self::GetCfg => f.write_str("get_cfg"),
            Self::SetCfgFragmented => f.write_str("set_cfg_fragmented"),
            Self::RegisterEvents => f.write_str("register_events"),
            Self::PathDelay => f.write_str("path_delay"),
            Self::DutyCycle => f.write_str("duty_cycle"),
            Self::PortProperty => f.write_str("peer_port_property"),
            Self::IcbInfo => f.write_str("icb_info"),
            Self::UpstreamStopped => f.write_str("upstream_stopped"),
            Self::MediaFormat => f.write_str("media_format"),
            Self::Destroy => f.write_str("destroy"),
            Self::Custom(raw) => write!(f, "custom(0x{raw:08X})"),
        }
    }
}

impl Command {
    /// Opcode of this command.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::GraphOpen(_) => Opcode::GraphOpen,
            Self::GraphConnect(_) => Opcode::GraphConnect,
            Self::GraphDisconnect(_) => Opcode::GraphDisconnect,
            Self::GraphMgmt { op, .. } => Opcode::GraphMgmt(*op),
            Self::SetCfg { .. } => Opcode::SetCfg,
            Self::GetCfg { .. } => Opcode::GetCfg,
            Self::SetCfgFragmented(_) => Opcode::SetCfgFragmented,
            Self::RegisterEvents { .. } => Opcode::RegisterEvents,
            Self::PathDelay(_) => Opcode::PathDelay,
            Self::DutyCycle(_) => Opcode::DutyCycle,
            Self::PortProperty { .. } => Opcode::PortProperty,
            Self::IcbInfo { .. } => Opcode::IcbInfo,
            Self::UpstreamStopped { .. } => Opcode::UpstreamStopped,
            Self::MediaFormat { .. } => Opcode::MediaFormat,
            Self::Destroy => Opcode::Destroy,
            Self::Custom { opcode } => Opcode::Custom(*opcode),
        }
    }
}

/// What an acknowledgment carries besides its result.
#[derive(Debug, Default)]
pub enum AckPayload {
    /// Nothing.
    #[default]
    None,
    /// Ports created by graph open.
    Endpoints(Vec<PortEndpoint>),
    /// Packed records answering a get-configuration.
    Params(Vec<u8>),
    /// Answer to a one-time path-delay query.
    PathDelay(DelayBreakdown),
    /// Answer to a duty-cycle request.
    Island(IslandAck),
}

/// Acknowledgment of one orchestrator command.
#[derive(Debug)]
pub struct CmdAck {
    /// Acknowledged opcode.
    pub opcode: Opcode,
    /// Outcome.
    pub result: CntrResult<()>,
    /// Extra data.
    pub payload: AckPayload,
}

/// A command plus where to answer it.
#[derive(Debug)]
pub struct Envelope {
    /// The command.
    pub command: Command,
    /// Reply channel; `None` for peer messages.
    pub reply: Option<Sender<CmdAck>>,
}

impl Envelope {
    /// A message that expects no acknowledgment.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            reply: None,
        }
    }

    /// A command plus the receiver its acknowledgment arrives on.
    pub fn with_reply(command: Command) -> (Self, Receiver<CmdAck>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (
            Self {
                command,
                reply: Some(tx),
            },
            rx,
        )
    }
}
