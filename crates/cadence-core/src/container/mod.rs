//! The container: one thread, one wait channel, any number of subgraphs.
//!
//! [`Container`] owns the graph, the external ports and all per-container
//! state (votes, duty-cycle flags, event clients, delay paths). It is
//! driven by [`event_loop::run`] through its [`Dispatch`] impl; the
//! handlers live in the submodules, one concern each:
//!
//! | module | concern |
//! |--------|---------|
//! | `lifecycle` | open, connect, disconnect, prepare/start/stop/suspend/flush/close |
//! | `peer` | property propagation, ICB info, media format, upstream-stopped |
//! | `data_path` | ingress processing, prebuffers, marker draining |
//! | `cfg` | packed set/get configuration, event registration |
//! | `votes` | framework events, power votes, duty-cycle requests |
//! | `delay` | path delay queries and persisted paths |
//!
//! A handler that needs a larger thread stack stores a [`HandleRest`]
//! continuation and returns [`LoopControl::Relaunch`]; [`Container::run`]
//! resumes it first thing on the next thread.

mod cfg;
mod command;
mod data_path;
mod delay;
mod lifecycle;
mod peer;
mod settings;
mod thread;
mod votes;

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::Sender;

pub use command::{
    AckPayload, CmdAck, Command, Envelope, ExternalInputDecl, GraphOpenRequest, Opcode,
    PathDelayOp, SubgraphDecl,
};
pub use settings::{ContainerSettings, DEFAULT_STACK_BYTES, FrameSize, HeapKind, RuntimePolicy};
pub use thread::ContainerThread;

use crate::duty_cycle::{DutyCycleManager, DutyCycleState};
use crate::error::{BatchResult, CntrError, CntrResult};
use crate::event_loop::{
    self, Dispatch, EventLoop, HandlerKind, LoopControl, LoopExit, ThreadPriority,
};
use crate::events::{EventOwner, EventRegistry, RaisedEvent};
use crate::flags::FwkEventFlags;
use crate::graph::{Graph, ModuleResources};
use crate::ids::{ModuleId, PortKey, SubgraphId};
use crate::media::{FrameLength, MediaFormat, Scenario};
use crate::params::Framing;
use crate::path_delay::PathDelayRegistry;
use crate::ports::{ExtCtrlPort, ExtInPort, ExtOutPort};
use crate::power::{PmMode, PowerManager, PowerVoter, TracingPowerManager, UNITY_Q4};
use crate::state::SubgraphState;
use crate::transport::{QueueReceiver, QueueSender, WaitChannel, queue};

/// Collaborators a container talks to.
pub struct ContainerServices {
    /// Power manager votes go to.
    pub power: Box<dyn PowerManager>,
    /// Duty-cycling manager, if the platform has one.
    pub duty_cycle: Option<Box<dyn DutyCycleManager>>,
    /// Outlet for events raised to clients.
    pub events: Option<Sender<RaisedEvent>>,
    /// Priority control used to boost command handling.
    pub priority: Option<Arc<dyn ThreadPriority>>,
}

impl Default for ContainerServices {
    fn default() -> Self {
        Self {
            power: Box::new(TracingPowerManager),
            duty_cycle: None,
            events: None,
            priority: None,
        }
    }
}

/// Work left over when a handler asked for a relaunch.
#[derive(Debug)]
enum RestKind {
    /// Nothing left but the acknowledgment.
    Reply(AckPayload),
    /// Packed set-configuration, resumed after the record at `resume_after`.
    SetCfg {
        framing: Framing,
        payload: Vec<u8>,
        resume_after: usize,
        batch: BatchResult,
    },
    /// Fragmented set-configuration, resumed at fragment `next`.
    Fragments {
        fragments: Vec<Vec<u8>>,
        next: usize,
        batch: BatchResult,
    },
}

/// A command suspended across a thread relaunch.
#[derive(Debug)]
struct HandleRest {
    opcode: Opcode,
    kind: RestKind,
    stack_bytes: usize,
    reply: Option<Sender<CmdAck>>,
}

impl HandleRest {
    fn new(opcode: Opcode, kind: RestKind, stack_bytes: usize) -> Self {
        Self {
            opcode,
            kind,
            stack_bytes,
            reply: None,
        }
    }
}

/// One container instance.
pub struct Container {
    settings: ContainerSettings,
    el: EventLoop,
    cmd_tx: QueueSender<Envelope>,
    cmd_rx: QueueReceiver<Envelope>,
    graph: Graph,
    ext_in: BTreeMap<PortKey, ExtInPort>,
    ext_out: BTreeMap<PortKey, ExtOutPort>,
    ext_ctrl: BTreeMap<PortKey, ExtCtrlPort>,
    frame: FrameLength,
    period_us: u32,
    proc_duration_us: u32,
    proc_duration_override: Option<u32>,
    scale_q4: u32,
    fwk: FwkEventFlags,
    voter: PowerVoter,
    dcm: DutyCycleState,
    events: EventRegistry,
    paths: PathDelayRegistry,
    handle_rest: Option<HandleRest>,
    stack_bytes: usize,
    last_load: ModuleResources,
    in_command: bool,
}

impl core::fmt::Debug for Container {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.settings.name)
            .field("instance", &self.settings.instance)
            .field("subgraphs", &self.graph.subgraph_count())
            .field("ext_in", &self.ext_in.len())
            .field("ext_out", &self.ext_out.len())
            .field("frame_us", &self.frame.us)
            .field("stack_bytes", &self.stack_bytes)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Creates a container and registers it with the power manager.
    pub fn new(settings: ContainerSettings, services: ContainerServices) -> CntrResult<Self> {
        let channel = WaitChannel::new();
        let signal = channel
            .allocate()
            .ok_or_else(|| CntrError::failed("no wait bit left for the command queue"))?;
        let bit = signal.bit();
        let (cmd_tx, cmd_rx) = queue(signal, None);
        let mut el = EventLoop::new(channel);
        el.register(bit, HandlerKind::Command);
        if let (Some(priority), Some(control)) = (settings.priority_boost, services.priority) {
            el.set_command_boost(control, priority);
        }

        let mut voter = PowerVoter::new(services.power, settings.policy.votes());
        voter.register(&settings.name, PmMode::Default)?;

        let frame = settings.frame_length(MediaFormat::default());
        let stack_bytes = settings.stack_bytes;
        let mut cntr = Self {
            el,
            cmd_tx,
            cmd_rx,
            graph: Graph::new(),
            ext_in: BTreeMap::new(),
            ext_out: BTreeMap::new(),
            ext_ctrl: BTreeMap::new(),
            frame,
            period_us: 0,
            proc_duration_us: 0,
            proc_duration_override: None,
            scale_q4: UNITY_Q4,
            fwk: FwkEventFlags::default(),
            voter,
            dcm: DutyCycleState::new(services.duty_cycle),
            events: EventRegistry::new(services.events),
            paths: PathDelayRegistry::new(),
            handle_rest: None,
            stack_bytes,
            last_load: ModuleResources::default(),
            in_command: false,
            settings,
        };
        cntr.update_frame_len();
        tracing::info!(
            name = %cntr.settings.name,
            instance = %cntr.settings.instance,
            frame_us = cntr.frame.us,
            "container created"
        );
        Ok(cntr)
    }

    /// Queue that commands and peer messages are pushed to.
    pub fn command_sender(&self) -> QueueSender<Envelope> {
        self.cmd_tx.clone()
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Container instance id.
    pub fn instance(&self) -> ModuleId {
        self.settings.instance
    }

    /// Settings the container runs with.
    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    /// The module graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// State of one subgraph, `Invalid` if unknown.
    pub fn sg_state(&self, id: SubgraphId) -> SubgraphState {
        self.graph.sg_state(id)
    }

    /// An external input.
    pub fn ext_input(&self, key: PortKey) -> Option<&ExtInPort> {
        self.ext_in.get(&key)
    }

    /// An external output.
    pub fn ext_output(&self, key: PortKey) -> Option<&ExtOutPort> {
        self.ext_out.get(&key)
    }

    /// An external control port.
    pub fn ext_control(&self, key: PortKey) -> Option<&ExtCtrlPort> {
        self.ext_ctrl.get(&key)
    }

    /// Container frame length.
    pub fn frame(&self) -> FrameLength {
        self.frame
    }

    /// Container period in microseconds (0 when not periodic).
    pub fn period_us(&self) -> u32 {
        self.period_us
    }

    /// Processing duration in microseconds.
    pub fn proc_duration_us(&self) -> u32 {
        self.proc_duration_us
    }

    /// Power votes.
    pub fn voter(&self) -> &PowerVoter {
        &self.voter
    }

    /// Duty-cycle state.
    pub fn duty_cycle(&self) -> &DutyCycleState {
        &self.dcm
    }

    /// Event subscriptions.
    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    /// Persisted delay paths.
    pub fn paths(&self) -> &PathDelayRegistry {
        &self.paths
    }

    /// Stack the container thread runs with.
    pub fn stack_bytes(&self) -> usize {
        self.stack_bytes
    }

    /// Returns `true` while a command waits for a relaunch.
    pub fn has_pending_relaunch(&self) -> bool {
        self.handle_rest.is_some()
    }

    /// Wait mask of the event loop.
    pub fn wait_mask(&self) -> u32 {
        self.el.mask()
    }

    /// Raises a module event to the clients the container tracks for it.
    pub fn raise_module_event(&self, module: ModuleId, event_id: u32, payload: &[u8]) -> usize {
        self.events
            .raise(EventOwner::Module(module), event_id, payload)
    }

    /// Runs the event loop until a terminal command or a relaunch request.
    ///
    /// A continuation left by the previous thread runs before the loop.
    pub fn run(&mut self) -> LoopExit {
        let span = tracing::info_span!(
            "container",
            name = %self.settings.name,
            instance = %self.settings.instance
        );
        let _enter = span.enter();
        if let Some(exit) = self.resume_handle_rest() {
            return exit;
        }
        event_loop::run(self)
    }

    /// Handles everything signaled right now, then returns.
    ///
    /// `None` means the loop went idle.
    pub fn run_until_idle(&mut self) -> Option<LoopExit> {
        let span = tracing::info_span!(
            "container",
            name = %self.settings.name,
            instance = %self.settings.instance
        );
        let _enter = span.enter();
        if let Some(exit) = self.resume_handle_rest() {
            return Some(exit);
        }
        event_loop::run_until_idle(self)
    }

    fn resume_handle_rest(&mut self) -> Option<LoopExit> {
        let rest = self.handle_rest.take()?;
        self.stack_bytes = self.stack_bytes.max(rest.stack_bytes);
        tracing::info!(
            opcode = %rest.opcode,
            stack_bytes = self.stack_bytes,
            "resuming command after relaunch"
        );
        self.in_command = rest.reply.is_some();
        let done = match rest.kind {
            RestKind::Reply(payload) => Some((Ok(()), payload)),
            RestKind::SetCfg {
                framing,
                payload,
                resume_after,
                batch,
            } => self
                .apply_set_cfg(rest.opcode, framing, payload, Some(resume_after), batch)
                .map(|b| (b.into_result(), AckPayload::None)),
            RestKind::Fragments {
                fragments,
                next,
                batch,
            } => self
                .apply_fragments(fragments, next, batch)
                .map(|b| (b.into_result(), AckPayload::None)),
        };
        self.handle_fwk_events();
        self.in_command = false;

        match done {
            Some((result, payload)) => {
                self.acknowledge(rest.opcode, rest.reply, result, payload);
                None
            }
            None => {
                if let Some(next) = self.handle_rest.as_mut() {
                    next.reply = rest.reply;
                }
                Some(LoopExit::Relaunch)
            }
        }
    }

    fn on_command(&mut self) -> LoopControl {
        let Some(envelope) = self.cmd_rx.pop() else {
            return LoopControl::Continue;
        };
        let Envelope { command, reply } = envelope;
        let opcode = command.opcode();
        tracing::debug!(%opcode, "command");

        self.in_command = reply.is_some();
        let (result, payload) = self.handle_command(command);
        self.handle_fwk_events();
        self.in_command = false;

        if let Some(rest) = self.handle_rest.as_mut() {
            rest.reply = reply;
            tracing::info!(%opcode, stack_bytes = rest.stack_bytes, "relaunch requested");
            return LoopControl::Relaunch;
        }
        self.acknowledge(opcode, reply, result, payload);
        if opcode == Opcode::Destroy {
            LoopControl::Terminate
        } else {
            LoopControl::Continue
        }
    }

    fn handle_command(&mut self, command: Command) -> (CntrResult<()>, AckPayload) {
        let result = match command {
            Command::GraphOpen(req) => self.graph_open(req),
            Command::GraphConnect(links) => self.graph_connect(links),
            Command::GraphDisconnect(ports) => self.graph_disconnect(ports),
            Command::GraphMgmt {
                op,
                subgraphs,
                ports,
            } => self.graph_mgmt(op, subgraphs, ports),
            Command::SetCfg { framing, payload } => self.set_cfg(framing, payload),
            Command::GetCfg { framing, payload } => return self.get_cfg(framing, &payload),
            Command::SetCfgFragmented(fragments) => self.set_cfg_fragmented(fragments),
            Command::RegisterEvents { client, payload } => self.register_events(client, &payload),
            Command::PathDelay(op) => self.path_delay(op),
            Command::DutyCycle(req) => self.duty_cycle_request(req),
            Command::PortProperty { port, properties } => self.peer_property(port, properties),
            Command::IcbInfo { port, info } => self.peer_icb_info(port, info),
            Command::UpstreamStopped { port } => self.peer_upstream_stopped(port),
            Command::MediaFormat {
                port,
                format,
                frame,
            } => self.peer_media_format(port, format, frame),
            Command::Destroy => self.destroy(),
            Command::Custom { opcode } => Err(CntrError::unsupported(format!(
                "opcode 0x{opcode:08X}"
            ))),
        };
        match result {
            Ok(payload) => (Ok(()), payload),
            Err(err) => (Err(err), AckPayload::None),
        }
    }

    fn acknowledge(
        &self,
        opcode: Opcode,
        reply: Option<Sender<CmdAck>>,
        result: CntrResult<()>,
        payload: AckPayload,
    ) {
        match &result {
            Ok(()) => tracing::debug!(%opcode, "command done"),
            Err(err) => tracing::error!(%opcode, error = %err, "command failed"),
        }
        let Some(reply) = reply else {
            return;
        };
        let ack = CmdAck {
            opcode,
            result,
            payload,
        };
        if reply.send(ack).is_err() {
            tracing::warn!(%opcode, "command issuer is gone, dropping acknowledgment");
        }
    }

    fn stack_needed(&self) -> Option<usize> {
        let required = self.graph.required_stack_bytes();
        (required > self.stack_bytes).then_some(required)
    }

    fn any_started(&self) -> bool {
        self.graph
            .subgraphs()
            .any(|s| s.state == SubgraphState::Started)
    }

    fn is_voice(&self) -> bool {
        self.graph
            .subgraphs()
            .any(|s| s.scenario == Scenario::Voice)
    }

    fn is_real_time(&self) -> bool {
        self.settings.signal_triggered || self.graph.modules().any(|m| m.flags.real_time)
    }

    fn scenario_of(&self, module: ModuleId) -> Scenario {
        self.graph
            .sg_of(module)
            .and_then(|sg| self.graph.subgraph(sg))
            .map_or(Scenario::Default, |s| s.scenario)
    }

    fn container_media(&self) -> MediaFormat {
        self.ext_in
            .keys()
            .filter_map(|&k| self.graph.in_port(k))
            .map(|p| p.media)
            .find(MediaFormat::is_valid)
            .or_else(|| {
                self.graph
                    .modules()
                    .flat_map(|m| m.outputs.values())
                    .map(|o| o.media)
                    .find(MediaFormat::is_valid)
            })
            .unwrap_or_default()
    }

    /// Re-derives frame length, period and processing duration.
    fn update_frame_len(&mut self) {
        let frame = self.settings.frame_length(self.container_media());
        if frame != self.frame {
            if frame.differs_from(&self.frame) {
                self.fwk.frame_len_change = true;
            }
            tracing::debug!(us = frame.us, samples = frame.samples, "container frame length");
            self.frame = frame;
        }
        self.period_us = if self.is_voice() || self.settings.signal_triggered {
            frame.us
        } else {
            0
        };
        self.update_proc_duration();
    }

    fn update_proc_duration(&mut self) {
        let us = self.proc_duration_override.unwrap_or_else(|| {
            ((u64::from(self.frame.us) << 4) / u64::from(self.scale_q4.max(1))) as u32
        });
        if us != self.proc_duration_us {
            self.proc_duration_us = us;
            self.fwk.proc_dur_change = true;
        }
    }
}

impl Dispatch for Container {
    fn event_loop(&mut self) -> &mut EventLoop {
        &mut self.el
    }

    fn dispatch(&mut self, kind: HandlerKind) -> LoopControl {
        match kind {
            HandlerKind::Command => self.on_command(),
            HandlerKind::ExtInputData(key) => {
                self.on_ext_input(key);
                self.handle_fwk_events();
                LoopControl::Continue
            }
            HandlerKind::ExtOutputReturn(key) => {
                self.on_buffer_return(key);
                self.handle_fwk_events();
                LoopControl::Continue
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crossbeam_channel::Receiver;

    use crate::graph::{BasicModule, ModuleFlags, ModuleSpec};
    use crate::ids::PortId;
    use crate::power::{PowerCall, RecordingPowerManager};

    pub(crate) fn container() -> (Container, RecordingPowerManager) {
        let rec = RecordingPowerManager::new();
        let services = ContainerServices {
            power: Box::new(rec.clone()),
            ..ContainerServices::default()
        };
        let mut settings = ContainerSettings::new("test", ModuleId(0x4000));
        settings.policy.ingress_prebuffer_retention = 0;
        (Container::new(settings, services).unwrap(), rec)
    }

    pub(crate) fn module(id: u32, sg: u32, inputs: &[u32], outputs: &[u32]) -> ModuleSpec {
        ModuleSpec {
            id: ModuleId(id),
            subgraph: SubgraphId(sg),
            flags: ModuleFlags::default(),
            inputs: inputs.iter().map(|&p| PortId(p)).collect(),
            outputs: outputs.iter().map(|&p| PortId(p)).collect(),
            controls: Vec::new(),
            module: Box::new(BasicModule::new()),
        }
    }

    /// Pushes `command` and runs the loop until idle; returns the ack.
    pub(crate) fn exec(cntr: &mut Container, command: Command) -> CmdAck {
        let (env, rx): (Envelope, Receiver<CmdAck>) = Envelope::with_reply(command);
        cntr.command_sender().push(env).unwrap();
        let _ = cntr.run_until_idle();
        rx.try_recv().unwrap()
    }

    pub(crate) fn one_sg_request() -> GraphOpenRequest {
        let mut m = module(0x10, 1, &[0], &[1]);
        m.flags = ModuleFlags {
            propagates_metadata: true,
            ..ModuleFlags::default()
        };
        GraphOpenRequest {
            subgraphs: vec![SubgraphDecl {
                id: SubgraphId(1),
                scenario: Scenario::Default,
            }],
            modules: vec![m],
            external_inputs: vec![ExternalInputDecl {
                key: PortKey::new(0x10, 0),
                media: Some(MediaFormat::pcm(48_000, 2, 16)),
            }],
            external_outputs: vec![PortKey::new(0x10, 1)],
            ..GraphOpenRequest::default()
        }
    }

    #[test]
    fn registers_with_power_manager_on_creation() {
        let (cntr, rec) = container();
        assert_eq!(
            rec.calls().first(),
            Some(&PowerCall::Register("test".into(), PmMode::Default))
        );
        assert_eq!(cntr.proc_duration_us(), 1_000);
    }

    #[test]
    fn unknown_opcode_is_acknowledged_unsupported() {
        let (mut cntr, _) = container();
        let ack = exec(&mut cntr, Command::Custom { opcode: 0xDEAD });
        assert_eq!(
            ack.result.unwrap_err().kind(),
            crate::ErrorKind::Unsupported
        );
    }

    #[test]
    fn destroy_terminates_the_loop() {
        let (mut cntr, _) = container();
        let (env, rx) = Envelope::with_reply(Command::Destroy);
        cntr.command_sender().push(env).unwrap();
        assert_eq!(cntr.run_until_idle(), Some(LoopExit::Terminated));
        assert!(rx.try_recv().unwrap().result.is_ok());
    }

    #[test]
    fn graph_open_replies_with_endpoints() {
        let (mut cntr, _) = container();
        let ack = exec(&mut cntr, Command::GraphOpen(one_sg_request()));
        assert!(ack.result.is_ok());
        let AckPayload::Endpoints(eps) = ack.payload else {
            panic!("endpoints expected");
        };
        assert_eq!(eps.len(), 2);
        assert!(cntr.ext_input(PortKey::new(0x10, 0)).is_some());
        // command bit, one data bit, one buffer-return bit
        assert_eq!(cntr.wait_mask().count_ones(), 3);
        assert_eq!(cntr.frame().samples, 48);
    }

    #[test]
    fn large_stack_module_requests_relaunch_then_acks() {
        let (mut cntr, _) = container();
        let mut req = one_sg_request();
        req.modules[0].module =
            Box::new(BasicModule::new().with_stack_bytes(DEFAULT_STACK_BYTES * 2));
        let (env, rx) = Envelope::with_reply(Command::GraphOpen(req));
        cntr.command_sender().push(env).unwrap();
        assert_eq!(cntr.run_until_idle(), Some(LoopExit::Relaunch));
        assert!(rx.try_recv().is_err());
        assert!(cntr.has_pending_relaunch());

        assert_eq!(cntr.run_until_idle(), None);
        assert_eq!(cntr.stack_bytes(), DEFAULT_STACK_BYTES * 2);
        assert!(matches!(
            rx.try_recv().unwrap().payload,
            AckPayload::Endpoints(_)
        ));
    }
}
