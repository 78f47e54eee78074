//! Prebuffering on both sides of a container boundary.
//!
//! Egress: when an external output first becomes active it pushes a
//! zero-filled one-time prebuffer (OTP) and its steady-state prebuffers
//! ahead of live data, timestamped so that they precede the first real
//! buffer by their cumulative duration.
//!
//! Ingress: an external input holds recently received buffers in a side
//! FIFO so a transient threshold disable (e.g. resync) does not starve the
//! processing loop. See [`IngressQueue`].

use std::collections::VecDeque;

use crate::error::CntrResult;
use crate::media::Timestamp;
use crate::transport::{
    BufferFlags, BufferPool, DataBuffer, DataMessage, Marker, PooledBuf, QueueSender,
};

/// What to send ahead of the first live buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrebufferPlan {
    /// One-time prebuffer size in bytes (0 for none).
    pub otp_bytes: usize,
    /// One-time prebuffer duration.
    pub otp_us: u32,
    /// Steady-state prebuffers drawn from the pool.
    pub prebufs: u32,
    /// Duration of one regular buffer.
    pub frame_us: u32,
}

/// What was actually sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrebufferReport {
    /// An OTP went out.
    pub otp_sent: bool,
    /// Steady-state prebuffers that went out.
    pub prebufs_sent: u32,
    /// Steady-state prebuffers skipped because the pool was empty.
    pub prebufs_missed: u32,
}

/// Sends the OTP and steady-state prebuffers downstream.
///
/// `first_ts` is the timestamp of the first live buffer, when valid. A
/// pool miss is not an error: fewer prebuffers go out this round.
pub fn send_prebuffers(
    pool: &BufferPool,
    downstream: &QueueSender<DataMessage>,
    plan: &PrebufferPlan,
    first_ts: Option<Timestamp>,
) -> CntrResult<PrebufferReport> {
    let mut report = PrebufferReport::default();
    let lead_us =
        i64::from(plan.otp_us) + i64::from(plan.prebufs) * i64::from(plan.frame_us);
    let mut ts = first_ts.map(|t| t - lead_us);
    let flags = BufferFlags { prebuffer: true };

    if plan.otp_bytes > 0 {
        downstream.push(DataMessage::Buffer(DataBuffer {
            payload: PooledBuf::detached(vec![0; plan.otp_bytes]),
            timestamp: ts,
            flags,
        }))?;
        report.otp_sent = true;
        ts = ts.map(|t| t + i64::from(plan.otp_us));
    }

    for _ in 0..plan.prebufs {
        let Some(mut buf) = pool.poll() else {
            report.prebufs_missed += 1;
            continue;
        };
        buf.zero();
        downstream.push(DataMessage::Buffer(DataBuffer {
            payload: buf,
            timestamp: ts,
            flags,
        }))?;
        report.prebufs_sent += 1;
        ts = ts.map(|t| t + i64::from(plan.frame_us));
    }

    tracing::debug!(
        otp = report.otp_sent,
        sent = report.prebufs_sent,
        missed = report.prebufs_missed,
        "prebuffers sent"
    );
    Ok(report)
}

/// Ingress queue of an external input with prebuffer retention.
///
/// While retention is active, arriving buffers go to a side FIFO. The
/// FIFO keeps at least `retain_min` buffers; the oldest move to the main
/// queue once a live (non-prebuffer) arrival pushes it past that floor. A
/// marker moves the whole FIFO to the main queue first, oldest first, so
/// the container wakes up and processes the gap.
#[derive(Debug)]
pub struct IngressQueue {
    side: VecDeque<DataBuffer>,
    main: VecDeque<DataMessage>,
    retain_min: usize,
    max_elements: usize,
    retaining: bool,
    dropped: u64,
}

impl IngressQueue {
    /// Creates a queue retaining `retain_min` buffers, holding at most
    /// `max_elements` in total.
    pub fn new(retain_min: usize, max_elements: usize) -> Self {
        Self {
            side: VecDeque::new(),
            main: VecDeque::new(),
            retain_min,
            max_elements: max_elements.max(1),
            retaining: false,
            dropped: 0,
        }
    }

    /// Starts retaining (first data after a gap).
    pub fn start_retention(&mut self) {
        self.retaining = true;
    }

    /// Returns `true` while arrivals are routed through the side FIFO.
    pub fn is_retaining(&self) -> bool {
        self.retaining
    }

    /// Accepts one message from the data queue.
    pub fn accept(&mut self, msg: DataMessage) {
        match msg {
            DataMessage::Marker(marker) => {
                self.release_side();
                self.retaining = false;
                self.push_main(DataMessage::Marker(marker));
            }
            DataMessage::Buffer(mut buf) if self.retaining => {
                // retained data must not hold the upstream's pool hostage
                buf.payload = buf.payload.unpinned();
                let live = !buf.flags.prebuffer;
                self.side.push_back(buf);
                if live {
                    while self.side.len() > self.retain_min {
                        if let Some(old) = self.side.pop_front() {
                            self.push_main(DataMessage::Buffer(old));
                        }
                    }
                }
                self.enforce_cap();
            }
            DataMessage::Buffer(buf) => self.push_main(DataMessage::Buffer(buf)),
        }
    }

    /// Moves the whole side FIFO to the main queue, oldest first.
    pub fn release_side(&mut self) {
        while let Some(buf) = self.side.pop_front() {
            self.push_main(DataMessage::Buffer(buf));
        }
    }

    /// Next message ready for processing.
    pub fn pop(&mut self) -> Option<DataMessage> {
        self.main.pop_front()
    }

    /// Drops everything held. Returns how many messages were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.side.len() + self.main.len();
        self.side.clear();
        self.main.clear();
        self.retaining = false;
        n
    }

    /// Buffers held in the side FIFO.
    pub fn retained(&self) -> usize {
        self.side.len()
    }

    /// Messages ready for processing.
    pub fn ready(&self) -> usize {
        self.main.len()
    }

    /// Messages dropped because the queue was over capacity.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Pushes a marker directly, ahead of nothing already held.
    pub fn push_marker(&mut self, marker: Marker) {
        self.accept(DataMessage::Marker(marker));
    }

    fn push_main(&mut self, msg: DataMessage) {
        self.main.push_back(msg);
        self.enforce_cap();
    }

    fn enforce_cap(&mut self) {
        while self.side.len() + self.main.len() > self.max_elements {
            let dropped = if self.main.front().is_some_and(|m| !m.is_marker()) {
                self.main.pop_front().is_some()
            } else {
                self.side.pop_front().is_some()
            };
            if !dropped {
                break;
            }
            self.dropped += 1;
            tracing::warn!(dropped = self.dropped, "ingress queue over capacity");
        }
    }
}
