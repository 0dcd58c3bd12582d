//! The per-role driver: open the resources, run the handshake, then run one pinned worker thread
//! per lane until every lane reached its operation count.
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byte_unit::{Byte, UnitType};
use quanta::Clock;
use tracing::{debug, error, info};

use crate::config::{BenchConfig, EngineKind, NodeIdentity, Role};
use crate::engine::{self, EngineParams, LaneOutcome, LaneTransport, OpMeter};
use crate::error::Error;
use crate::handshake::{self, HandshakeListener};
use crate::resources::{LaneContext, ResourcePlan, Resources};
use crate::ring::RemoteRing;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// What one lane did.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneReport {
    pub index: usize,
    /// Global indices of the lane's peers.
    pub peers: Range<usize>,
    pub cpu: Option<usize>,
    pub outcome: LaneOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub role: Role,
    pub rank: u32,
    pub engine: EngineKind,
    pub msg_size: usize,
    pub lanes: Vec<LaneReport>,
}

impl BenchReport {
    pub fn total_ops(&self) -> u64 {
        self.lanes.iter().map(|lane| lane.outcome.ops).sum()
    }

    /// Sum of the lanes' throughput in Mops/s, `None` if no lane got past its warm-up.
    pub fn throughput(&self) -> Option<f64> {
        self.lanes
            .iter()
            .filter_map(|lane| lane.outcome.throughput)
            .reduce(|acc, mops| acc + mops)
    }

    pub fn log(&self) {
        for lane in &self.lanes {
            match lane.outcome.throughput {
                Some(mops) => info!(
                    "lane[{}]: throughput = {:.6} (Mops/s), {}",
                    lane.index,
                    mops,
                    bandwidth(mops, self.msg_size)
                ),
                None => info!(
                    "lane[{}]: {} ops, warm-up threshold never crossed",
                    lane.index, lane.outcome.ops
                ),
            }
        }
        if let Some(mops) = self.throughput() {
            info!(
                role = self.role.as_str(),
                rank = self.rank,
                ops = self.total_ops(),
                "total throughput = {:.6} (Mops/s), {}",
                mops,
                bandwidth(mops, self.msg_size)
            );
        }
    }
}

fn bandwidth(mops: f64, msg_size: usize) -> String {
    let bytes_per_second = mops * 1e6 * msg_size as f64;
    match Byte::from_f64(bytes_per_second) {
        Some(byte) => format!("{:.2}/s", byte.get_appropriate_unit(UnitType::Binary)),
        None => "-".to_string(),
    }
}

/// Run a whole benchmark as `id`, tearing everything down before returning.
pub fn run(config: &BenchConfig, id: NodeIdentity) -> Result<BenchReport, Error> {
    config.validate(&id)?;
    let caps = config.capabilities(id.role);
    let link = config.link_params()?;
    let layout = config.layout(id.role)?;
    let plan = ResourcePlan {
        device: config.device.clone(),
        link,
        rank: id.rank,
        layout,
        lanes: config.threads,
        shared_receive_queue: caps.shared_receive_queue,
        send_depth: config.send_queue_depth(),
    };

    let mut resources = Resources::open(&plan)?;
    info!(device = %resources.device_name(), lanes = resources.num_lanes(), "resources ready");

    let remote_infos = {
        let mut endpoints = resources.endpoints();
        match id.role {
            Role::Server => {
                let listener = HandshakeListener::bind(config.port)?;
                info!(port = config.port, clients = endpoints.len(), "waiting for clients");
                handshake::serve(&listener, &mut endpoints, &link)?
            },
            Role::Client => handshake::join(config.peers(Role::Client), config.port, &mut endpoints, &link)?,
        }
    };
    let remotes: Vec<RemoteRing> = remote_infos
        .iter()
        .map(|info| RemoteRing::new(info.raddr, info.rkey, layout.slots(), layout.msg_size()))
        .collect();
    info!(peers = remotes.len(), "handshake complete");

    let params = EngineParams {
        role: id.role,
        caps,
        rank: id.rank,
        first_peer: 0,
        batch_size: config.batch_size,
        signal_interval: config.signal_interval,
        warmup_ops: config.warmup_ops,
        total_ops: config.total_ops,
    };
    let kind = config.engine;
    let remotes = remotes.as_slice();

    let tasks = resources
        .split()
        .into_iter()
        .map(|ctx| {
            let index = ctx.index;
            let peers = ctx.peers.clone();
            let params = EngineParams {
                first_peer: peers.start,
                ..params.clone()
            };
            LaneTask {
                index,
                peers: peers.clone(),
                cpu: Some(config.first_cpu + index),
                work: move |meter: OpMeter| -> Result<LaneOutcome, Error> {
                    let LaneContext {
                        qps,
                        cq,
                        srq,
                        rings,
                        staging,
                        lkey,
                        ..
                    } = ctx;
                    let mut transport = LaneTransport::new(qps, cq, srq, lkey);
                    Ok(engine::run(
                        kind,
                        &mut transport,
                        &rings,
                        &remotes[peers],
                        &staging,
                        &params,
                        meter,
                    )?)
                },
            }
        })
        .collect();
    let lanes = drive(tasks, config.warmup_ops)?;

    resources.close();
    Ok(BenchReport {
        role: id.role,
        rank: id.rank,
        engine: kind,
        msg_size: config.msg_size,
        lanes,
    })
}

/// A unit of work for one worker thread.
pub(crate) struct LaneTask<F> {
    pub index: usize,
    pub peers: Range<usize>,
    /// CPU to pin the thread to, left unpinned when `None`.
    pub cpu: Option<usize>,
    pub work: F,
}

/// Run every task on its own scoped thread and wait for all of them, logging progress at debug
/// level meanwhile. Any panicking or failing task fails the whole run once all have been joined.
pub(crate) fn drive<F>(tasks: Vec<LaneTask<F>>, warmup_ops: u64) -> Result<Vec<LaneReport>, Error>
where
    F: FnOnce(OpMeter) -> Result<LaneOutcome, Error> + Send,
{
    let clock = Clock::new();
    let total = tasks.len();
    let counters: Vec<Arc<AtomicU64>> = (0..total).map(|_| Arc::new(AtomicU64::new(0))).collect();

    thread::scope(|s| {
        let mut handles = Vec::with_capacity(total);
        let mut failed = 0;

        for (task, counter) in tasks.into_iter().zip(&counters) {
            let LaneTask { index, peers, cpu, work } = task;
            let lane_peers = peers.clone();
            let meter = OpMeter::new(clock.clone(), Arc::clone(counter), warmup_ops);
            let spawned = thread::Builder::new()
                .name(format!("lane-{index}"))
                .spawn_scoped(s, move || {
                    if let Some(cpu) = cpu {
                        if !core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
                            return Err(Error::Affinity { cpu });
                        }
                    }
                    debug!(lane = index, ?peers, ?cpu, "lane running");
                    work(meter)
                });
            match spawned {
                Ok(handle) => handles.push((index, lane_peers, cpu, handle)),
                Err(err) => {
                    error!(lane = index, error = %err, "failed to spawn lane");
                    failed += 1;
                },
            }
        }

        let mut last_report = clock.now();
        while handles.iter().any(|(_, _, _, handle)| !handle.is_finished()) {
            thread::sleep(JOIN_POLL);
            let now = clock.now();
            if now.saturating_duration_since(last_report) >= PROGRESS_INTERVAL {
                for (lane, counter) in counters.iter().enumerate() {
                    debug!(lane, ops = counter.load(Ordering::Relaxed), "progress");
                }
                last_report = now;
            }
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (index, peers, cpu, handle) in handles {
            match handle.join() {
                Ok(Ok(outcome)) => reports.push(LaneReport {
                    index,
                    peers,
                    cpu,
                    outcome,
                }),
                Ok(Err(err)) => {
                    error!(lane = index, error = %err, "lane failed");
                    failed += 1;
                },
                Err(_) => {
                    error!(lane = index, "lane panicked");
                    failed += 1;
                },
            }
        }

        if failed > 0 {
            Err(Error::WorkersFailed { failed, total })
        } else {
            Ok(reports)
        }
    })
}
