//! The data path engines. Both are generic over [`Transport`] and busy-poll without ever
//! blocking; a stalled link stalls its lane.
pub mod one_sided;
pub mod transport;
pub mod two_sided;

#[cfg(test)]
pub(crate) mod loopback;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quanta::{Clock, Instant};

use crate::config::{Capabilities, EngineKind, Role};
use crate::ibverbs::completion::{PollCompletionQueueError, WorkCompletionOperationType, WorkCompletionStatus};
use crate::ibverbs::queue_pair::{PostRecvError, PostSendError};
use crate::ring::{RecvRing, RemoteRing, StagingArea};

pub use self::transport::{Completion, CompletionKind, LaneTransport, RemoteWrite, Transport};

/// Completions fetched per poll.
pub const POLL_BATCH: usize = 20;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("failed to post receive for peer {peer}")]
    PostRecv {
        peer: usize,
        #[source]
        source: PostRecvError,
    },
    #[error("failed to post send to peer {peer}")]
    PostSend {
        peer: usize,
        #[source]
        source: PostSendError,
    },
    #[error(transparent)]
    Poll(#[from] PollCompletionQueueError),
    #[error("work request {wr_id:#x} ({opcode:?}) completed with {status} (vendor error {vendor_err:#x})")]
    CompletionFailed {
        wr_id: u64,
        opcode: WorkCompletionOperationType,
        status: WorkCompletionStatus,
        vendor_err: u32,
    },
    #[error("work request {wr_id:#x} completed with unexpected opcode {opcode:?}")]
    UnexpectedOpcode {
        wr_id: u64,
        opcode: WorkCompletionOperationType,
    },
    #[error("unexpected {kind:?} completion of work request {wr_id:#x}")]
    UnexpectedCompletion { wr_id: u64, kind: CompletionKind },
    #[error("message from unknown peer {peer}")]
    UnknownPeer { peer: u64 },
}

/// Per-lane settings shared by both engines.
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub role: Role,
    pub caps: Capabilities,
    /// Our own rank, sent as immediate data by multi-peer clients.
    pub rank: u32,
    /// Global index of the lane's first peer.
    pub first_peer: usize,
    pub batch_size: usize,
    pub signal_interval: u64,
    pub warmup_ops: u64,
    pub total_ops: u64,
}

impl EngineParams {
    /// Writes per posted chain; 1 unless batched signaling is on.
    pub fn chain_len(&self) -> usize {
        if self.caps.batched_signaling {
            self.batch_size.max(1)
        } else {
            1
        }
    }
}

/// Counts completed operations and timestamps the warm-up and end thresholds.
///
/// The running count is mirrored into a shared counter so the driver can report progress while
/// the lane spins.
pub struct OpMeter {
    clock: Clock,
    counter: Arc<AtomicU64>,
    warmup_ops: u64,
    ops: u64,
    warmup: Option<(u64, Instant)>,
    end: Option<(u64, Instant)>,
}

impl OpMeter {
    pub fn new(clock: Clock, counter: Arc<AtomicU64>, warmup_ops: u64) -> Self {
        OpMeter {
            clock,
            counter,
            warmup_ops,
            ops: 0,
            warmup: None,
            end: None,
        }
    }

    /// Mark the beginning of the run; only meaningful when there is no warm-up at all.
    pub fn start(&mut self) {
        if self.warmup_ops == 0 && self.warmup.is_none() {
            self.warmup = Some((0, self.clock.now()));
        }
    }

    /// Count one operation, returning the new total.
    pub fn record(&mut self) -> u64 {
        self.ops += 1;
        self.counter.store(self.ops, Ordering::Relaxed);
        if self.ops == self.warmup_ops {
            self.warmup = Some((self.ops, self.clock.now()));
        }
        self.ops
    }

    pub fn ops(&self) -> u64 {
        self.ops
    }

    /// Take the end timestamp; later calls keep the first one.
    pub fn finish(&mut self) {
        if self.end.is_none() {
            self.end = Some((self.ops, self.clock.now()));
        }
    }

    pub fn outcome(&self, signaled_completions: u64, stops_acknowledged: usize) -> LaneOutcome {
        let (measured_ops, elapsed) = match (self.warmup, self.end) {
            (Some((warm_ops, warm_at)), Some((end_ops, end_at))) => {
                (end_ops - warm_ops, end_at.saturating_duration_since(warm_at))
            },
            _ => (0, Duration::ZERO),
        };
        let throughput = if measured_ops > 0 && !elapsed.is_zero() {
            Some(measured_ops as f64 / elapsed.as_secs_f64() / 1e6)
        } else {
            None
        };

        LaneOutcome {
            ops: self.ops,
            measured_ops,
            elapsed,
            throughput,
            signaled_completions,
            stops_acknowledged,
        }
    }
}

/// What a lane did, as measured by its [`OpMeter`].
#[derive(Debug, Clone, PartialEq)]
pub struct LaneOutcome {
    pub ops: u64,
    /// Operations between the warm-up and end timestamps.
    pub measured_ops: u64,
    pub elapsed: Duration,
    /// Mops/s over the measured window, `None` when the warm-up threshold was never crossed.
    pub throughput: Option<f64>,
    /// Signaled one-sided writes whose completion was observed.
    pub signaled_completions: u64,
    /// Stop messages whose delivery was observed (server) or received (client).
    pub stops_acknowledged: usize,
}

/// Run the engine selected by `engine` and `params.role` to completion.
pub fn run<T: Transport>(
    engine: EngineKind, transport: &mut T, rings: &[RecvRing<'_>], remotes: &[RemoteRing], staging: &StagingArea<'_>,
    params: &EngineParams, meter: OpMeter,
) -> Result<LaneOutcome, EngineError> {
    match (engine, params.role) {
        (EngineKind::TwoSided, Role::Server) => two_sided::run_server(transport, rings, staging, params, meter),
        (EngineKind::TwoSided, Role::Client) => two_sided::run_client(transport, rings, staging, params, meter),
        (EngineKind::OneSided, _) => one_sided::run(transport, rings, remotes, staging, params, meter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_measures_after_warmup() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut meter = OpMeter::new(Clock::new(), Arc::clone(&counter), 10);
        meter.start();
        for _ in 0..50 {
            meter.record();
        }
        std::thread::sleep(Duration::from_millis(1));
        meter.finish();
        meter.record();
        meter.finish();

        let outcome = meter.outcome(0, 1);
        assert_eq!(outcome.ops, 51);
        assert_eq!(outcome.measured_ops, 40);
        assert!(outcome.throughput.unwrap() > 0.0);
        assert_eq!(counter.load(Ordering::Relaxed), 51);
    }

    #[test]
    fn test_meter_without_reaching_warmup() {
        let mut meter = OpMeter::new(Clock::new(), Arc::new(AtomicU64::new(0)), 100);
        meter.start();
        meter.record();
        meter.finish();
        assert_eq!(meter.outcome(0, 0).throughput, None);
    }

    #[test]
    fn test_meter_without_warmup_starts_at_zero() {
        let mut meter = OpMeter::new(Clock::new(), Arc::new(AtomicU64::new(0)), 0);
        meter.start();
        for _ in 0..5 {
            meter.record();
        }
        std::thread::sleep(Duration::from_millis(1));
        meter.finish();
        assert_eq!(meter.outcome(0, 0).measured_ops, 5);
    }
}
