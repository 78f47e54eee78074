//! Property-based tests for cadence-core.
//!
//! Tests buffering negotiation bounds, packed-parameter parsing robustness,
//! port state combination, property deduplication, vote suppression and
//! ingress ordering using proptest for randomized input generation.

use proptest::prelude::*;

use cadence_core::graph::PortDirection;
use cadence_core::icb::{IcbInputs, IcbLocal, IcbMode, IcbPolicy, negotiate};
use cadence_core::params::{self, Framing, ParamIter, ParamRecord};
use cadence_core::path_delay::{self, DelaySource};
use cadence_core::power::{
    PowerCall, PowerRequest, PowerResource, PowerVoter, RecordingPowerManager, UNITY_Q4,
    VotePolicy,
};
use cadence_core::propagation::{PropagatedProperty, PropagationState};
use cadence_core::transport::BufferFlags;
use cadence_core::{
    CntrError, DataBuffer, DataFormat, DataMessage, FrameLength, IcbInfo, IngressQueue, Marker,
    ModuleId, ModuleResources, PooledBuf, PortId, PortKey, PortState,
};

fn icb_inputs(own_us: u32, ds_us: u32, own_rt: bool, ds_rt: bool, single: bool) -> IcbInputs {
    IcbInputs {
        connected: true,
        format: DataFormat::Pcm,
        local: IcbLocal {
            frame: FrameLength::from_us(own_us),
            real_time: own_rt,
            ..IcbLocal::default()
        },
        downstream: Some(IcbInfo {
            frame: FrameLength::from_us(ds_us),
            real_time: ds_rt,
            single_buffer_mode: single,
            ..IcbInfo::default()
        }),
    }
}

fn port_state() -> impl Strategy<Value = PortState> {
    prop_oneof![
        Just(PortState::Invalid),
        Just(PortState::Stopped),
        Just(PortState::Suspended),
        Just(PortState::Prepared),
        Just(PortState::Started),
    ]
}

/// Ingress item: `None` is an end-of-stream marker.
fn ingress_item() -> impl Strategy<Value = Option<bool>> {
    prop_oneof![
        8 => any::<bool>().prop_map(Some),
        1 => Just(None),
    ]
}

#[derive(Clone, Copy, Debug)]
enum Vote {
    Clock(u32),
    Latency(u32, bool),
    Island(bool),
}

fn vote() -> impl Strategy<Value = Vote> {
    prop_oneof![
        (0u32..3).prop_map(|k| Vote::Clock(k * 100)),
        (prop_oneof![Just(1_000u32), Just(5_000)], any::<bool>())
            .prop_map(|(us, rt)| Vote::Latency(us, rt)),
        any::<bool>().prop_map(Vote::Island),
    ]
}

/// Modules 0..4 are local with ports 0 (input) and 1 (output); port 1 of
/// module 0 is an external output, port 0 of module 3 an external input.
struct TableSource;

impl DelaySource for TableSource {
    fn direction(&self, key: PortKey) -> Option<PortDirection> {
        if key.module.0 >= 4 {
            return None;
        }
        match key.port.0 {
            0 => Some(PortDirection::Input),
            1 => Some(PortDirection::Output),
            _ => None,
        }
    }

    fn is_source_or_sink(&self, _module: ModuleId) -> bool {
        false
    }

    fn algorithmic_delay_us(&self, module: ModuleId, _i: Option<PortId>, _o: Option<PortId>) -> u32 {
        100 * (module.0 + 1)
    }

    fn ext_input_delay_us(&self, key: PortKey) -> Option<u32> {
        (key == PortKey::new(3, 0)).then_some(700)
    }

    fn ext_output_delay_us(&self, key: PortKey) -> Option<u32> {
        (key == PortKey::new(0, 1)).then_some(2_000)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Connected PCM with both frame lengths known always negotiates, and
    /// the regular buffers cover a slower downstream plus one in flight.
    #[test]
    fn icb_buffers_cover_downstream_frame(
        own_us in 1u32..100_000,
        ds_us in 1u32..100_000,
        own_rt in any::<bool>(),
        ds_rt in any::<bool>(),
    ) {
        let policy = IcbPolicy::default();
        let r = negotiate(&icb_inputs(own_us, ds_us, own_rt, ds_rt, false), &policy);
        prop_assert_eq!(r.mode, IcbMode::Negotiated);
        prop_assert!(r.reg_bufs >= policy.default_reg_bufs);
        if ds_us > own_us {
            prop_assert!(u64::from(r.reg_bufs) * u64::from(own_us) >= u64::from(ds_us) + u64::from(own_us));
        }
        prop_assert!(r.prebufs <= 1);
        prop_assert!(r.otp_us < own_us);
        if !(own_rt && ds_rt) {
            prop_assert_eq!(r.prebufs, 0);
            prop_assert_eq!(r.otp_us, 0);
        }
    }

    /// Identical inputs give identical results.
    #[test]
    fn icb_negotiation_is_deterministic(
        own_us in 0u32..50_000,
        ds_us in 0u32..50_000,
        own_rt in any::<bool>(),
        ds_rt in any::<bool>(),
        single in any::<bool>(),
    ) {
        let inputs = icb_inputs(own_us, ds_us, own_rt, ds_rt, single);
        let policy = IcbPolicy::default();
        prop_assert_eq!(negotiate(&inputs, &policy), negotiate(&inputs, &policy));
    }

    /// Single-buffer downstreams with no real-time side get exactly enough
    /// buffers for one downstream frame.
    #[test]
    fn icb_single_buffer_mode_is_minimal(
        own_us in 1u32..20_000,
        ds_us in 1u32..20_000,
    ) {
        let r = negotiate(&icb_inputs(own_us, ds_us, false, false, true), &IcbPolicy::default());
        prop_assert_eq!(r.reg_bufs, ds_us.div_ceil(own_us).max(1));
        prop_assert_eq!(r.total_bufs(), r.reg_bufs);
    }

    /// An unconnected output never holds buffers.
    #[test]
    fn icb_unconnected_is_deferred(
        own_us in 0u32..50_000,
        ds_us in 0u32..50_000,
        raw in any::<bool>(),
    ) {
        let mut inputs = icb_inputs(own_us, ds_us, true, true, false);
        inputs.connected = false;
        if raw {
            inputs.format = DataFormat::RawCompressed;
        }
        let r = negotiate(&inputs, &IcbPolicy::default());
        prop_assert!(r.is_deferred());
        prop_assert_eq!(r.total_bufs(), 0);
    }

    /// Arbitrary bytes never panic the parser and every payload lies
    /// inside the buffer, in increasing offset order.
    #[test]
    fn param_iter_survives_arbitrary_bytes(
        bytes in prop::collection::vec(any::<u8>(), 0..256),
        per_instance in any::<bool>(),
    ) {
        let framing = if per_instance {
            Framing::PerInstance
        } else {
            Framing::SharedPersistent { module: ModuleId(0x10) }
        };
        let mut last = 0usize;
        for entry in ParamIter::new(&bytes, framing) {
            prop_assert!(entry.offset >= last);
            prop_assert!(entry.offset + entry.payload.len() <= bytes.len());
            last = entry.offset + entry.payload.len();
        }
    }

    /// Cutting an encoded buffer yields a prefix of its records, flagged
    /// truncated whenever a record is lost.
    #[test]
    fn truncated_buffer_yields_record_prefix(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..24), 1..6),
        cut in any::<prop::sample::Index>(),
    ) {
        let records: Vec<ParamRecord> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| ParamRecord::new(ModuleId(0x10 + i as u32), i as u32, p.clone()))
            .collect();
        let encoded = params::encode(Framing::PerInstance, &records);
        let cut = cut.index(encoded.len() + 1);

        let mut iter = ParamIter::new(&encoded[..cut], Framing::PerInstance);
        let parsed: Vec<_> = iter.by_ref().collect();
        prop_assert!(parsed.len() <= records.len());
        for (entry, record) in parsed.iter().zip(&records) {
            prop_assert_eq!(entry.module, record.module);
            prop_assert_eq!(entry.param_id, record.param_id);
            prop_assert_eq!(entry.payload, record.payload.as_slice());
        }
        // Without the flag, nothing past the last parsed record was cut off.
        let end = parsed
            .last()
            .map_or(0, |e| e.offset + params::padded(e.payload.len()));
        if !iter.truncated() {
            prop_assert!(cut <= end);
        }
    }

    /// Downgrading is symmetric, never exceeds either side, and `Invalid`
    /// absorbs everything.
    #[test]
    fn downgrade_takes_the_lower_state(a in port_state(), b in port_state()) {
        let d = a.downgrade(b);
        prop_assert_eq!(d, b.downgrade(a));
        if a == PortState::Invalid || b == PortState::Invalid {
            prop_assert_eq!(d, PortState::Invalid);
        } else {
            prop_assert!(d <= a && d <= b);
            prop_assert!(d == a || d == b);
        }
    }

    /// A value the peer already holds is suppressed; a failed send is
    /// retried on the next attempt even for the same value.
    #[test]
    fn propagated_property_sends_only_changes(
        attempts in prop::collection::vec((any::<bool>(), any::<bool>()), 1..40),
    ) {
        let mut prop = PropagatedProperty::<bool>::new();
        let mut peer: Option<bool> = None;
        for (value, fails) in attempts {
            let settled = prop.state() == PropagationState::Sent && peer == Some(value);
            let mut delivered = false;
            let outcome = prop.try_send(value, |v| {
                if fails {
                    return Err(CntrError::failed("queue full"));
                }
                delivered = true;
                peer = Some(v);
                Ok(())
            });
            prop_assert_eq!(outcome.was_sent(), delivered);
            if settled {
                prop_assert!(!delivered);
                prop_assert_eq!(prop.state(), PropagationState::Sent);
            } else if fails {
                prop_assert_eq!(prop.state(), PropagationState::SendFailedPendingRetry);
                prop_assert_eq!(prop.last_sent(), None);
            } else {
                prop_assert_eq!(prop.last_sent(), Some(value));
            }
        }
    }

    /// Whatever mix of live buffers, prebuffers and markers arrives, the
    /// queue stays within capacity and releases buffers in arrival order.
    #[test]
    fn ingress_preserves_order_within_capacity(
        items in prop::collection::vec(ingress_item(), 0..64),
        retain in 0usize..4,
        cap in 1usize..16,
    ) {
        let mut q = IngressQueue::new(retain, cap);
        q.start_retention();
        let mut popped = Vec::new();
        let mut saw_marker = false;
        for (i, item) in items.iter().enumerate() {
            let msg = match item {
                Some(prebuffer) => DataMessage::Buffer(DataBuffer {
                    payload: PooledBuf::detached(Vec::new()),
                    timestamp: Some(i as i64),
                    flags: BufferFlags { prebuffer: *prebuffer },
                }),
                None => {
                    saw_marker = true;
                    DataMessage::Marker(Marker::FlushingEos)
                }
            };
            q.accept(msg);
            // Markers are never dropped, so only buffers are bounded.
            if !saw_marker {
                prop_assert!(q.retained() + q.ready() <= cap);
            }
            if i % 3 == 0
                && let Some(DataMessage::Buffer(b)) = q.pop()
            {
                popped.extend(b.timestamp);
            }
        }
        q.release_side();
        while let Some(msg) = q.pop() {
            if let DataMessage::Buffer(b) = msg {
                popped.extend(b.timestamp);
            }
        }
        prop_assert!(popped.windows(2).all(|w| w[0] < w[1]));
    }

    /// Foreign vertices contribute nothing, wherever they appear.
    #[test]
    fn path_delay_ignores_foreign_vertices(
        path in prop::collection::vec((0u32..4, 0u32..2), 0..12),
        foreign in prop::collection::vec((4u32..64, any::<prop::sample::Index>()), 0..4),
    ) {
        let local: Vec<PortKey> = path.iter().map(|&(m, p)| PortKey::new(m, p)).collect();
        let base = path_delay::compute(&local, &TableSource);

        let mut mixed = local.clone();
        for (m, at) in foreign {
            mixed.insert(at.index(mixed.len() + 1), PortKey::new(m, 0));
        }
        let with_foreign = path_delay::compute(&mixed, &TableSource);
        prop_assert_eq!(with_foreign.ext_in_us, base.ext_in_us);
        prop_assert_eq!(with_foreign.ext_out_us, base.ext_out_us);
        prop_assert!(with_foreign.algo_us <= base.algo_us);
    }

    /// Repeating a vote never sends the same request twice in a row for
    /// one resource.
    #[test]
    fn repeated_votes_reach_the_manager_once(
        votes in prop::collection::vec(vote(), 1..40),
        repeats in 1usize..4,
    ) {
        let rec = RecordingPowerManager::new();
        let mut voter = PowerVoter::new(Box::new(rec.clone()), VotePolicy::default());
        for v in &votes {
            for _ in 0..repeats {
                let outcome = match *v {
                    Vote::Clock(kpps) => voter.vote_clock(
                        ModuleResources { kpps, bw_bytes_per_sec: kpps * 10 },
                        UNITY_Q4,
                        false,
                        false,
                    ),
                    Vote::Latency(us, rt) => voter.vote_latency(us, rt, false),
                    Vote::Island(allow) => voter.vote_island(allow, false),
                };
                prop_assert!(outcome.is_ok());
            }
        }

        // per resource: last request sent, or `None` after a release
        let mut last: [Option<Option<PowerRequest>>; 3] = [None; 3];
        let mut sent = 0usize;
        for call in rec.calls() {
            let (slot, key) = match call {
                PowerCall::Request(r @ PowerRequest::MipsBandwidth { .. }, _) => (0, Some(r)),
                PowerCall::Release(PowerResource::MipsBandwidth, _) => (0, None),
                PowerCall::Request(r @ PowerRequest::SleepLatency { .. }, _) => (1, Some(r)),
                PowerCall::Request(r @ PowerRequest::IslandVote { .. }, _) => (2, Some(r)),
                _ => continue,
            };
            prop_assert_ne!(last[slot], Some(key));
            last[slot] = Some(key);
            sent += 1;
        }
        prop_assert!(sent <= votes.len());
    }
}
