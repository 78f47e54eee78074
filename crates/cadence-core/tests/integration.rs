//! Integration tests for cadence-core containers.
//!
//! Two containers run on their own threads and are chained through their
//! external ports the way an orchestrator would do it: open, connect, start,
//! then push data into the first and watch it leave the second.

use std::time::{Duration, Instant};

use cadence_core::transport::{BufferFlags, queue};
use cadence_core::{
    AckPayload, BasicModule, CmdAck, Command, Container, ContainerServices, ContainerSettings,
    ContainerThread, DataBuffer, DataMessage, Envelope, ExternalInputDecl, FrameLength,
    GraphOpenRequest, IcbInfo, Marker, MediaFormat, ModuleFlags, ModuleId, ModuleSpec, PathDelayOp,
    PeerLink, PooledBuf, PortEndpoint, PortId, PortKey, QueueReceiver, Scenario, SubgraphDecl,
    SubgraphId, SubgraphOp, WaitChannel,
};

const WAIT: Duration = Duration::from_secs(5);

fn spawn(name: &str, instance: u32) -> ContainerThread {
    let mut settings = ContainerSettings::new(name, ModuleId(instance));
    settings.policy.ingress_prebuffer_retention = 0;
    let cntr = Container::new(settings, ContainerServices::default()).unwrap();
    ContainerThread::spawn(cntr).unwrap()
}

/// One pass-through module with an external input on port 0 and an
/// external output on port 1.
fn passthrough(module: u32, sg: u32) -> GraphOpenRequest {
    GraphOpenRequest {
        subgraphs: vec![SubgraphDecl {
            id: SubgraphId(sg),
            scenario: Scenario::Default,
        }],
        modules: vec![ModuleSpec {
            id: ModuleId(module),
            subgraph: SubgraphId(sg),
            flags: ModuleFlags {
                propagates_metadata: true,
                ..ModuleFlags::default()
            },
            inputs: vec![PortId(0)],
            outputs: vec![PortId(1)],
            controls: Vec::new(),
            module: Box::new(BasicModule::new().with_delay_us(250)),
        }],
        external_inputs: vec![ExternalInputDecl {
            key: PortKey::new(module, 0),
            media: Some(MediaFormat::pcm(48_000, 2, 16)),
        }],
        external_outputs: vec![PortKey::new(module, 1)],
        ..GraphOpenRequest::default()
    }
}

fn ok(ack: CmdAck) -> AckPayload {
    assert!(ack.result.is_ok(), "{:?} failed: {:?}", ack.opcode, ack.result);
    ack.payload
}

fn endpoints(th: &ContainerThread, req: GraphOpenRequest) -> Vec<PortEndpoint> {
    match ok(th.call(Command::GraphOpen(req), WAIT).unwrap()) {
        AckPayload::Endpoints(eps) => eps,
        other => panic!("endpoints expected, got {other:?}"),
    }
}

fn endpoint_of(eps: &[PortEndpoint], key: PortKey) -> PortEndpoint {
    eps.iter().find(|e| e.port() == key).cloned().unwrap()
}

fn mgmt(th: &ContainerThread, op: SubgraphOp, sg: u32, ports: &[PortKey]) -> CmdAck {
    th.call(
        Command::GraphMgmt {
            op,
            subgraphs: vec![SubgraphId(sg)],
            ports: ports.to_vec(),
        },
        WAIT,
    )
    .unwrap()
}

fn buffer(ts: i64) -> DataMessage {
    DataMessage::Buffer(DataBuffer {
        payload: PooledBuf::detached(vec![ts as u8; 192]),
        timestamp: Some(ts),
        flags: BufferFlags::default(),
    })
}

/// Test-owned input that stands in for a third container.
struct Sink {
    channel: WaitChannel,
    data: QueueReceiver<DataMessage>,
    _control: QueueReceiver<Envelope>,
    endpoint: PortEndpoint,
}

impl Sink {
    fn new() -> Self {
        let channel = WaitChannel::new();
        let (data_tx, data) = queue(channel.allocate().unwrap(), None);
        let (ctrl_tx, control) = queue(channel.allocate().unwrap(), None);
        let endpoint = PortEndpoint::Input {
            port: PortKey::new(0x90, 0),
            data: data_tx,
            control: ctrl_tx,
        };
        Self {
            channel,
            data,
            _control: control,
            endpoint,
        }
    }

    fn recv(&self, timeout: Duration) -> Option<DataMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.data.pop() {
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.channel
                .wait_timeout(self.data.signal().mask(), deadline - now);
        }
    }
}

/// A (0x10) feeding B (0x20) feeding a test sink; both started.
struct Chain {
    a: ContainerThread,
    b: ContainerThread,
    a_ingress: cadence_core::QueueSender<DataMessage>,
    sink: Sink,
}

fn chain() -> Chain {
    let a = spawn("upstream", 0x4100);
    let b = spawn("downstream", 0x4200);
    let a_eps = endpoints(&a, passthrough(0x10, 1));
    let b_eps = endpoints(&b, passthrough(0x20, 2));
    let sink = Sink::new();

    let (a_in, a_out) = (PortKey::new(0x10, 0), PortKey::new(0x10, 1));
    let (b_in, b_out) = (PortKey::new(0x20, 0), PortKey::new(0x20, 1));

    ok(b
        .call(
            Command::IcbInfo {
                port: b_out,
                info: IcbInfo {
                    frame: FrameLength::from_us(1_000),
                    ..IcbInfo::default()
                },
            },
            WAIT,
        )
        .unwrap());

    // B first: its connect reports buffering needs onto A's queue.
    let b_links = vec![
        PeerLink::input_from(b_in, &endpoint_of(&a_eps, a_out)).unwrap(),
        PeerLink::output_to(b_out, &sink.endpoint).unwrap(),
    ];
    ok(b.call(Command::GraphConnect(b_links), WAIT).unwrap());
    let a_link = PeerLink::output_to(a_out, &endpoint_of(&b_eps, b_in)).unwrap();
    ok(a.call(Command::GraphConnect(vec![a_link]), WAIT).unwrap());

    ok(mgmt(&b, SubgraphOp::Start, 2, &[b_in, b_out]));
    ok(mgmt(&a, SubgraphOp::Start, 1, &[a_in, a_out]));

    let PortEndpoint::Input { data, .. } = endpoint_of(&a_eps, a_in) else {
        panic!("input endpoint expected");
    };
    Chain {
        a,
        b,
        a_ingress: data,
        sink,
    }
}

fn teardown(a: ContainerThread, b: ContainerThread) -> (Container, Container) {
    let a = a.destroy(WAIT).unwrap();
    let b = b.destroy(WAIT).unwrap();
    (a, b)
}

// ============================================================================
// 1. Data across two containers
// ============================================================================

#[test]
fn buffers_cross_two_containers_in_order() {
    let Chain {
        a,
        b,
        a_ingress,
        sink,
    } = chain();

    for ts in 1..=2 {
        a_ingress.push(buffer(ts)).unwrap();
    }
    for ts in 1..=2 {
        let Some(DataMessage::Buffer(got)) = sink.recv(WAIT) else {
            panic!("buffer {ts} did not arrive");
        };
        assert_eq!(got.timestamp, Some(ts));
        assert_eq!(got.payload.len(), 192);
        assert!(got.payload.as_slice().iter().all(|&b| b == ts as u8));
        assert!(got.payload.is_pooled());
    }

    let (a, b) = teardown(a, b);
    assert_eq!(a.graph().subgraph_count(), 0);
    assert_eq!(b.graph().subgraph_count(), 0);
}

#[test]
fn steady_stream_recycles_pool_buffers() {
    let Chain {
        a,
        b,
        a_ingress,
        sink,
    } = chain();

    // More frames than either pool holds; each is released before the next.
    for ts in 0..16 {
        a_ingress.push(buffer(ts)).unwrap();
        let Some(DataMessage::Buffer(got)) = sink.recv(WAIT) else {
            panic!("frame {ts} lost");
        };
        assert_eq!(got.timestamp, Some(ts));
    }
    teardown(a, b);
}

// ============================================================================
// 2. Control across two containers
// ============================================================================

#[test]
fn downstream_stop_blocks_the_upstream_output() {
    let Chain {
        a,
        b,
        a_ingress,
        sink,
    } = chain();

    a_ingress.push(buffer(1)).unwrap();
    assert!(matches!(sink.recv(WAIT), Some(DataMessage::Buffer(_))));

    ok(mgmt(&b, SubgraphOp::Stop, 2, &[PortKey::new(0x20, 0)]));
    // The unlisted output is flushed toward the sink.
    assert!(matches!(
        sink.recv(WAIT),
        Some(DataMessage::Marker(Marker::FlushingEos))
    ));
    a_ingress.push(buffer(2)).unwrap();
    assert!(sink.recv(Duration::from_millis(100)).is_none());

    teardown(a, b);
}

#[test]
fn path_delay_query_runs_on_each_thread() {
    let Chain { a, b, .. } = chain();

    let path = vec![
        PortKey::new(0x10, 0),
        PortKey::new(0x10, 1),
        PortKey::new(0x20, 0),
        PortKey::new(0x20, 1),
    ];
    let query = |th: &ContainerThread| match ok(th
        .call(Command::PathDelay(PathDelayOp::Query { path: path.clone() }), WAIT)
        .unwrap())
    {
        AckPayload::PathDelay(d) => d,
        other => panic!("breakdown expected, got {other:?}"),
    };
    // Each container only accounts for its own vertices.
    assert_eq!(query(&a).algo_us, 250);
    assert_eq!(query(&b).algo_us, 250);

    teardown(a, b);
}

#[test]
fn disconnect_then_destroy_is_clean() {
    let Chain { a, b, .. } = chain();

    ok(mgmt(&a, SubgraphOp::Stop, 1, &[PortKey::new(0x10, 1)]));
    ok(a
        .call(
            Command::GraphDisconnect(vec![PortKey::new(0x10, 1)]),
            WAIT,
        )
        .unwrap());
    ok(b
        .call(
            Command::GraphDisconnect(vec![PortKey::new(0x20, 0)]),
            WAIT,
        )
        .unwrap());

    let (a, _) = teardown(a, b);
    assert!(!a.has_pending_relaunch());
}
