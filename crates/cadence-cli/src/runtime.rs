//! A configured system of containers running on their own threads.
//!
//! Brings a [`SystemConfig`] up the way an orchestrator does: spawn every
//! container, open its graph, connect external ports downstream first so
//! each upstream sees its peer's buffering report before it negotiates,
//! then start downstream first. Terminal outputs feed local sinks.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use cadence_config::{PortRef, SystemConfig};
use cadence_core::params::{self, PARAM_PROC_PARAMS_INFO, ParamIter};
use cadence_core::transport::{BufferFlags, queue};
use cadence_core::{
    AckPayload, CmdAck, Command, Container, ContainerServices, ContainerThread, DataBuffer,
    DataMessage, DelayBreakdown, Envelope, FrameLength, Framing, IcbInfo, MediaFormat, ModuleId,
    ParamRecord, PathDelayOp, PeerLink, PooledBuf, PortEndpoint, PortKey, QueueReceiver,
    SubgraphId, SubgraphOp, WaitChannel,
};

/// Module id the local sinks pose as; one input port per sink.
const SINK_MODULE: u32 = 0xFFFF_0000;

/// Processing parameters a container reports after graph open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcInfo {
    /// Frame length in microseconds.
    pub frame_us: u32,
    /// Period in microseconds.
    pub period_us: u32,
    /// Processing duration in microseconds.
    pub proc_us: u32,
    /// Runs at a real-time cadence.
    pub real_time: bool,
}

/// Local stand-in for the container a terminal output would feed.
struct Sink {
    port: PortRef,
    channel: WaitChannel,
    data: QueueReceiver<DataMessage>,
    _control: QueueReceiver<Envelope>,
    endpoint: PortEndpoint,
}

impl Sink {
    fn new(port: PortRef, index: u32) -> anyhow::Result<Self> {
        let channel = WaitChannel::new();
        let data_bit = channel.allocate().context("sink channel exhausted")?;
        let ctrl_bit = channel.allocate().context("sink channel exhausted")?;
        let (data_tx, data) = queue(data_bit, None);
        let (ctrl_tx, control) = queue(ctrl_bit, None);
        let endpoint = PortEndpoint::Input {
            port: PortKey::new(SINK_MODULE, index),
            data: data_tx,
            control: ctrl_tx,
        };
        Ok(Self {
            port,
            channel,
            data,
            _control: control,
            endpoint,
        })
    }

    /// Counts buffers until `expected` arrived or `deadline` passed.
    fn collect(&self, expected: usize, deadline: Instant) -> SinkReport {
        let mut report = SinkReport {
            port: self.port,
            buffers: 0,
            bytes: 0,
            markers: 0,
        };
        while report.buffers < expected {
            while let Some(msg) = self.data.pop() {
                match msg {
                    DataMessage::Buffer(buf) => {
                        report.buffers += 1;
                        report.bytes += buf.payload.len();
                    }
                    DataMessage::Marker(_) => report.markers += 1,
                }
            }
            let now = Instant::now();
            if report.buffers >= expected || now >= deadline {
                break;
            }
            self.channel
                .wait_timeout(self.data.signal().mask(), deadline - now);
        }
        report
    }
}

/// What one terminal output delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkReport {
    /// Terminal output.
    pub port: PortRef,
    /// Buffers received.
    pub buffers: usize,
    /// Payload bytes received.
    pub bytes: usize,
    /// Markers received.
    pub markers: usize,
}

/// Every container of a system, opened, connected and started.
pub struct RunningSystem {
    config: SystemConfig,
    threads: Vec<ContainerThread>,
    endpoints: BTreeMap<PortKey, PortEndpoint>,
    info: Vec<ProcInfo>,
    sinks: Vec<Sink>,
    timeout: Duration,
}

fn check(name: &str, ack: CmdAck) -> anyhow::Result<AckPayload> {
    ack.result
        .map_err(|e| anyhow!("container '{name}': {:?} failed: {e}", ack.opcode))?;
    Ok(ack.payload)
}

impl RunningSystem {
    /// Spawns, opens, connects and starts every container of `config`.
    pub fn launch(config: SystemConfig, timeout: Duration) -> anyhow::Result<Self> {
        let mut system = Self {
            config,
            threads: Vec::new(),
            endpoints: BTreeMap::new(),
            info: Vec::new(),
            sinks: Vec::new(),
            timeout,
        };
        match system.bring_up() {
            Ok(()) => Ok(system),
            Err(err) => {
                system.shutdown();
                Err(err)
            }
        }
    }

    fn bring_up(&mut self) -> anyhow::Result<()> {
        for c in &self.config.containers {
            let cntr = Container::new(c.settings(), ContainerServices::default())
                .with_context(|| format!("creating container '{}'", c.name))?;
            self.threads.push(ContainerThread::spawn(cntr)?);
        }

        for (i, c) in self.config.containers.iter().enumerate() {
            let request = c.graph.open_request();
            let ack = self.threads[i].call(Command::GraphOpen(request), self.timeout)?;
            let AckPayload::Endpoints(eps) = check(&c.name, ack)? else {
                bail!("container '{}': graph open returned no endpoints", c.name);
            };
            for ep in eps {
                self.endpoints.insert(ep.port(), ep);
            }
            let info = self.query_info(i)?;
            tracing::info!(container = %c.name, ?info, "graph opened");
            self.info.push(info);
        }

        for port in self.config.terminal_outputs() {
            self.add_sink(port)?;
        }

        let order = self.config.downstream_first();
        for &i in &order {
            self.connect(i)?;
        }
        for &i in &order {
            self.start(i)?;
        }
        tracing::info!(
            system = %self.config.name,
            containers = self.threads.len(),
            "system started"
        );
        Ok(())
    }

    fn query_info(&self, i: usize) -> anyhow::Result<ProcInfo> {
        let c = &self.config.containers[i];
        let instance = ModuleId(c.instance);
        let framing = Framing::PerInstance;
        let payload = params::encode(
            framing,
            &[ParamRecord::new(instance, PARAM_PROC_PARAMS_INFO, Vec::new())],
        );
        let ack = self.threads[i].call(Command::GetCfg { framing, payload }, self.timeout)?;
        let AckPayload::Params(reply) = check(&c.name, ack)? else {
            bail!("container '{}': no parameter reply", c.name);
        };
        let entry = ParamIter::new(&reply, framing)
            .find(|e| e.param_id == PARAM_PROC_PARAMS_INFO)
            .with_context(|| format!("container '{}': processing info missing", c.name))?;
        let words: Vec<u32> = entry
            .payload
            .chunks_exact(4)
            .filter_map(|w| w.try_into().ok().map(u32::from_le_bytes))
            .collect();
        let [frame_us, period_us, proc_us, rt] = words[..] else {
            bail!("container '{}': malformed processing info", c.name);
        };
        Ok(ProcInfo {
            frame_us,
            period_us,
            proc_us,
            real_time: rt != 0,
        })
    }

    fn add_sink(&mut self, port: PortRef) -> anyhow::Result<()> {
        let owner = self
            .config
            .owner_of(port.module)
            .with_context(|| format!("no container owns {port}"))?;
        let frame_us = self.info[owner].frame_us;
        let name = &self.config.containers[owner].name;
        // The sink consumes one frame of its upstream at a time.
        let ack = self.threads[owner].call(
            Command::IcbInfo {
                port: port.into(),
                info: IcbInfo {
                    frame: FrameLength::from_us(frame_us),
                    ..IcbInfo::default()
                },
            },
            self.timeout,
        )?;
        check(name, ack)?;
        let index = self.sinks.len() as u32;
        self.sinks.push(Sink::new(port, index)?);
        Ok(())
    }

    fn endpoint(&self, port: PortRef) -> anyhow::Result<&PortEndpoint> {
        self.endpoints
            .get(&port.into())
            .with_context(|| format!("no endpoint for {port}"))
    }

    fn connect(&self, i: usize) -> anyhow::Result<()> {
        let c = &self.config.containers[i];
        let mut links = Vec::new();
        for conn in &self.config.connections {
            if c.graph.is_input(conn.to) {
                links.push(PeerLink::input_from(conn.to.into(), self.endpoint(conn.from)?)?);
            }
            if c.graph.is_output(conn.from) {
                links.push(PeerLink::output_to(conn.from.into(), self.endpoint(conn.to)?)?);
            }
        }
        for sink in &self.sinks {
            if c.graph.is_output(sink.port) {
                links.push(PeerLink::output_to(sink.port.into(), &sink.endpoint)?);
            }
        }
        if links.is_empty() {
            return Ok(());
        }
        tracing::debug!(container = %c.name, links = links.len(), "connecting");
        let ack = self.threads[i].call(Command::GraphConnect(links), self.timeout)?;
        check(&c.name, ack)?;
        Ok(())
    }

    fn start(&self, i: usize) -> anyhow::Result<()> {
        let c = &self.config.containers[i];
        let g = &c.graph;
        let ack = self.threads[i].call(
            Command::GraphMgmt {
                op: SubgraphOp::Start,
                subgraphs: g.subgraphs.iter().map(|s| SubgraphId(s.id)).collect(),
                ports: g
                    .external_inputs
                    .iter()
                    .map(|e| e.port.into())
                    .chain(g.external_outputs.iter().map(|&p| p.into()))
                    .collect(),
            },
            self.timeout,
        )?;
        check(&c.name, ack)?;
        Ok(())
    }

    /// Processing parameters per container, in configuration order.
    pub fn proc_info(&self) -> &[ProcInfo] {
        &self.info
    }

    /// The running configuration.
    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Relaunch count per container, in configuration order.
    pub fn relaunches(&self) -> Vec<usize> {
        self.threads.iter().map(ContainerThread::relaunch_count).collect()
    }

    /// Pushes `frames` frames into every entry input.
    ///
    /// Each frame covers the owning container's frame length in the
    /// input's media format. Inputs without a media format are skipped.
    pub fn feed(&self, frames: usize) -> anyhow::Result<usize> {
        let mut fed = 0;
        for port in self.config.entry_inputs() {
            let Some(owner) = self.config.owner_of(port.module) else {
                continue;
            };
            let media = self.config.containers[owner]
                .graph
                .external_inputs
                .iter()
                .find(|e| e.port == port)
                .and_then(|e| e.media);
            let Some(media) = media else {
                tracing::warn!(%port, "entry input has no media format, not fed");
                continue;
            };
            let PortEndpoint::Input { data, .. } = self.endpoint(port)? else {
                bail!("{port} is not an input");
            };
            let frame_us = self.info[owner].frame_us;
            let bytes = MediaFormat::from(media).bytes_for_us(frame_us);
            for n in 0..frames {
                data.push(DataMessage::Buffer(DataBuffer {
                    payload: PooledBuf::detached(vec![0; bytes]),
                    timestamp: Some(n as i64 * i64::from(frame_us)),
                    flags: BufferFlags::default(),
                }))?;
            }
            tracing::debug!(%port, frames, bytes, "fed");
            fed += 1;
        }
        Ok(fed)
    }

    /// Waits until every sink received `expected` buffers or `wait` passed.
    pub fn collect(&self, expected: usize, wait: Duration) -> Vec<SinkReport> {
        let deadline = Instant::now() + wait;
        self.sinks
            .iter()
            .map(|s| s.collect(expected, deadline))
            .collect()
    }

    /// Sums each container's share of a path's delay.
    pub fn path_delay(&self, vertices: &[PortRef]) -> anyhow::Result<DelayBreakdown> {
        let path: Vec<PortKey> = vertices.iter().map(|&v| v.into()).collect();
        let mut total = DelayBreakdown::default();
        for (i, c) in self.config.containers.iter().enumerate() {
            if !vertices.iter().any(|v| c.graph.module(v.module).is_some()) {
                continue;
            }
            let ack = self.threads[i].call(
                Command::PathDelay(PathDelayOp::Query { path: path.clone() }),
                self.timeout,
            )?;
            let AckPayload::PathDelay(d) = check(&c.name, ack)? else {
                bail!("container '{}': no delay reply", c.name);
            };
            total.algo_us += d.algo_us;
            total.ext_in_us += d.ext_in_us;
            total.ext_out_us += d.ext_out_us;
        }
        Ok(total)
    }

    /// Destroys every container, upstream first.
    pub fn shutdown(&mut self) {
        let order = self.config.downstream_first();
        let mut threads: Vec<Option<ContainerThread>> =
            self.threads.drain(..).map(Some).collect();
        for &i in order.iter().rev() {
            let Some(thread) = threads.get_mut(i).and_then(Option::take) else {
                continue;
            };
            let name = thread.name().to_string();
            match thread.destroy(self.timeout) {
                Ok(_) => tracing::debug!(container = %name, "destroyed"),
                Err(err) => tracing::warn!(container = %name, %err, "destroy failed"),
            }
        }
    }
}

impl Drop for RunningSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
