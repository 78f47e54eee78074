//! External ports: the boundary between two containers.
//!
//! An external input owns the data queue its upstream pushes into; an
//! external output owns the buffer pool its data leaves from. Peers know
//! each other only through a [`PeerHandle`], set at connect and cleared at
//! disconnect.

use crate::container::{Command, Envelope};
use crate::error::{CntrError, CntrResult};
use crate::icb::{IcbInfo, IcbResult};
use crate::ids::{PortKey, SubgraphId};
use crate::media::{FrameLength, MediaFormat};
use crate::prebuffer::IngressQueue;
use crate::propagation::PropagatedProperty;
use crate::state::PortState;
use crate::transport::{BufferPool, DataMessage, QueueReceiver, QueueSender, Signal, queue};

/// Address of a port in another container.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    /// The peer port.
    pub port: PortKey,
    /// The peer container's command queue.
    pub control: QueueSender<Envelope>,
}

impl PeerHandle {
    /// Sends a peer message; peer messages carry no reply.
    pub fn send(&self, command: Command) -> CntrResult<()> {
        self.control.push(Envelope::new(command))
    }
}

/// A port as exposed to other containers after graph open.
#[derive(Clone, Debug)]
pub enum PortEndpoint {
    /// External input: upstream pushes data here.
    Input {
        /// Port identity.
        port: PortKey,
        /// Data queue.
        data: QueueSender<DataMessage>,
        /// Owning container's command queue.
        control: QueueSender<Envelope>,
    },
    /// External output.
    Output {
        /// Port identity.
        port: PortKey,
        /// Owning container's command queue.
        control: QueueSender<Envelope>,
    },
    /// External control port.
    Control {
        /// Port identity.
        port: PortKey,
        /// Owning container's command queue.
        control: QueueSender<Envelope>,
    },
}

impl PortEndpoint {
    /// Port identity.
    pub fn port(&self) -> PortKey {
        match self {
            Self::Input { port, .. } | Self::Output { port, .. } | Self::Control { port, .. } => {
                *port
            }
        }
    }

    /// Handle a peer uses to reach this port.
    pub fn handle(&self) -> PeerHandle {
        let control = match self {
            Self::Input { control, .. }
            | Self::Output { control, .. }
            | Self::Control { control, .. } => control.clone(),
        };
        PeerHandle {
            port: self.port(),
            control,
        }
    }
}

/// One link declared in a connect command, from the local side.
#[derive(Clone, Debug)]
pub enum PeerLink {
    /// Local external input fed by `upstream`.
    Input {
        /// Local port.
        local: PortKey,
        /// Upstream output.
        upstream: PeerHandle,
    },
    /// Local external output feeding `downstream`.
    Output {
        /// Local port.
        local: PortKey,
        /// Downstream input.
        downstream: PeerHandle,
        /// Downstream data queue.
        data: QueueSender<DataMessage>,
    },
    /// Local control port talking to `peer`.
    Control {
        /// Local port.
        local: PortKey,
        /// Peer control port.
        peer: PeerHandle,
    },
}

impl PeerLink {
    /// The local port of the link.
    pub fn local(&self) -> PortKey {
        match self {
            Self::Input { local, .. } | Self::Output { local, .. } | Self::Control { local, .. } => {
                *local
            }
        }
    }

    /// Links local output `local` to a remote input endpoint.
    pub fn output_to(local: PortKey, input: &PortEndpoint) -> CntrResult<Self> {
        match input {
            PortEndpoint::Input { data, .. } => Ok(Self::Output {
                local,
                downstream: input.handle(),
                data: data.clone(),
            }),
            _ => Err(CntrError::bad_param(format!(
                "{} is not an input endpoint",
                input.port()
            ))),
        }
    }

    /// Links local input `local` to a remote output endpoint.
    pub fn input_from(local: PortKey, output: &PortEndpoint) -> CntrResult<Self> {
        match output {
            PortEndpoint::Output { .. } => Ok(Self::Input {
                local,
                upstream: output.handle(),
            }),
            _ => Err(CntrError::bad_param(format!(
                "{} is not an output endpoint",
                output.port()
            ))),
        }
    }

    /// Links local control port `local` to a remote control endpoint.
    pub fn control_to(local: PortKey, peer: &PortEndpoint) -> CntrResult<Self> {
        match peer {
            PortEndpoint::Control { .. } => Ok(Self::Control {
                local,
                peer: peer.handle(),
            }),
            _ => Err(CntrError::bad_param(format!(
                "{} is not a control endpoint",
                peer.port()
            ))),
        }
    }
}

/// External input port.
#[derive(Debug)]
pub struct ExtInPort {
    /// Port identity.
    pub key: PortKey,
    /// Owning subgraph.
    pub sg: SubgraphId,
    /// Upstream output, once connected.
    pub upstream: Option<PeerHandle>,
    /// Retained and ready data.
    pub ingress: IngressQueue,
    /// Frame length the upstream reported with its media format.
    pub upstream_frame: FrameLength,
    /// State the orchestrator reported for the upstream side.
    pub connected_state: PortState,
    /// Downstream real-time flag last sent upstream.
    pub ds_rt_prop: PropagatedProperty<bool>,
    /// Topology state last sent upstream.
    pub state_prop: PropagatedProperty<PortState>,
    /// Buffering info last sent upstream.
    pub icb_prop: PropagatedProperty<IcbInfo>,
    data_tx: QueueSender<DataMessage>,
    data_rx: QueueReceiver<DataMessage>,
}

impl ExtInPort {
    /// Creates an input whose data queue is bound to `signal`.
    pub fn new(key: PortKey, sg: SubgraphId, signal: Signal, ingress: IngressQueue) -> Self {
        let (data_tx, data_rx) = queue(signal, None);
        Self {
            key,
            sg,
            upstream: None,
            ingress,
            upstream_frame: FrameLength::default(),
            connected_state: PortState::Stopped,
            ds_rt_prop: PropagatedProperty::new(),
            state_prop: PropagatedProperty::new(),
            icb_prop: PropagatedProperty::new(),
            data_tx,
            data_rx,
        }
    }

    /// Wait bit of the data queue.
    pub fn bit(&self) -> u32 {
        self.data_rx.signal().bit()
    }

    /// Endpoint handed to the orchestrator.
    pub fn endpoint(&self, control: QueueSender<Envelope>) -> PortEndpoint {
        PortEndpoint::Input {
            port: self.key,
            data: self.data_tx.clone(),
            control,
        }
    }

    /// Moves everything queued by the upstream into the ingress queue.
    pub fn pull(&mut self) -> usize {
        let mut n = 0;
        while let Some(msg) = self.data_rx.pop() {
            self.ingress.accept(msg);
            n += 1;
        }
        n
    }

    /// Drops queued and retained data. Returns how many messages.
    pub fn drop_data(&mut self) -> usize {
        self.data_rx.drain().len() + self.ingress.clear()
    }

    /// Forgets everything sent to the upstream.
    pub fn reset_propagation(&mut self) {
        self.ds_rt_prop.reset();
        self.state_prop.reset();
        self.icb_prop.reset();
    }
}

/// External output port.
#[derive(Debug)]
pub struct ExtOutPort {
    /// Port identity.
    pub key: PortKey,
    /// Owning subgraph.
    pub sg: SubgraphId,
    /// Downstream input, once connected.
    pub downstream: Option<PeerHandle>,
    /// Downstream data queue, once connected.
    pub data: Option<QueueSender<DataMessage>>,
    /// State the orchestrator reported for the downstream side.
    pub connected_state: PortState,
    /// State the downstream propagated (`Invalid` until received).
    pub propagated_state: PortState,
    /// Latest buffering report from downstream.
    pub ds_info: Option<IcbInfo>,
    /// Current negotiation result.
    pub icb: IcbResult,
    /// Buffers in circulation.
    pub pool: BufferPool,
    /// Upstream real-time flag last sent downstream.
    pub us_rt_prop: PropagatedProperty<bool>,
    /// Prebuffers are due before the next live buffer.
    pub prebuffers_pending: bool,
    /// Media format last sent downstream.
    pub media_sent: Option<(MediaFormat, FrameLength)>,
    /// Live buffers sent.
    pub frames_sent: u64,
    return_signal: Option<Signal>,
}

impl ExtOutPort {
    /// Creates an unconnected output.
    pub fn new(key: PortKey, sg: SubgraphId) -> Self {
        Self {
            key,
            sg,
            downstream: None,
            data: None,
            connected_state: PortState::Stopped,
            propagated_state: PortState::Invalid,
            ds_info: None,
            icb: IcbResult::default(),
            pool: BufferPool::default(),
            us_rt_prop: PropagatedProperty::new(),
            prebuffers_pending: false,
            media_sent: None,
            frames_sent: 0,
            return_signal: None,
        }
    }

    /// Binds buffer returns to `signal`; applies from the next pool.
    pub fn with_return_signal(mut self, signal: Signal) -> Self {
        self.return_signal = Some(signal);
        self
    }

    /// Wait bit set when a buffer comes back, if bound.
    pub fn bit(&self) -> Option<u32> {
        self.return_signal.as_ref().map(Signal::bit)
    }

    /// Returns `true` if a live buffer can go out now, counting the
    /// prebuffers still owed ahead of it.
    pub fn has_room(&self) -> bool {
        let owed = if self.prebuffers_pending {
            self.icb.prebufs as usize
        } else {
            0
        };
        self.pool.available() > owed
    }

    /// Endpoint handed to the orchestrator.
    pub fn endpoint(&self, control: QueueSender<Envelope>) -> PortEndpoint {
        PortEndpoint::Output {
            port: self.key,
            control,
        }
    }

    /// Replaces the pool with `count` buffers of `buf_size` bytes.
    ///
    /// Buffers still in flight are freed when they come back.
    pub fn recreate_buffers(&mut self, count: u32, buf_size: usize) {
        self.pool = match &self.return_signal {
            Some(signal) => BufferPool::with_signal(count as usize, buf_size, signal.clone()),
            None => BufferPool::new(count as usize, buf_size),
        };
        tracing::debug!(port = %self.key, count, buf_size, "ext output buffers recreated");
    }

    /// Clears peer state at disconnect.
    pub fn reset_peer(&mut self) {
        self.downstream = None;
        self.data = None;
        self.propagated_state = PortState::Invalid;
        self.ds_info = None;
        self.us_rt_prop.reset();
        self.media_sent = None;
    }
}

/// External control port.
#[derive(Debug)]
pub struct ExtCtrlPort {
    /// Port identity.
    pub key: PortKey,
    /// Owning subgraph.
    pub sg: SubgraphId,
    /// Peer, once connected.
    pub peer: Option<PeerHandle>,
    /// State the orchestrator reported for the peer side.
    pub connected_state: PortState,
}

impl ExtCtrlPort {
    /// Creates an unconnected control port.
    pub fn new(key: PortKey, sg: SubgraphId) -> Self {
        Self {
            key,
            sg,
            peer: None,
            connected_state: PortState::Stopped,
        }
    }

    /// Endpoint handed to the orchestrator.
    pub fn endpoint(&self, control: QueueSender<Envelope>) -> PortEndpoint {
        PortEndpoint::Control {
            port: self.key,
            control,
        }
    }
}
