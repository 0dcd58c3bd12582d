//! Send / receive echo. The server pre-posts every receive slot, tells each client to start,
//! echoes every message from the slot it landed in and reposts that slot. Once the configured
//! total is reached it sends a stop message to every client and waits until each one was
//! delivered. A client is done as soon as every server has stopped it.
use tracing::{debug, trace};

use super::transport::{data_wr_id, split_wr_id, IMM_REGULAR, IMM_START, IMM_STOP, START_WR_ID, STOP_WR_ID};
use super::{Completion, CompletionKind, EngineError, EngineParams, LaneOutcome, OpMeter, Transport, POLL_BATCH};
use crate::ring::{RecvRing, StagingArea};

/// Map the immediate data of a message to the lane-local peer that sent it.
fn sender(imm: u32, params: &EngineParams, num_peers: usize) -> Result<usize, EngineError> {
    if !params.caps.multi_peer {
        return Ok(0);
    }
    (imm as usize)
        .checked_sub(params.first_peer)
        .filter(|&peer| peer < num_peers)
        .ok_or(EngineError::UnknownPeer { peer: u64::from(imm) })
}

fn data_slot(completion: &Completion) -> Result<(usize, usize), EngineError> {
    split_wr_id(completion.wr_id).ok_or(EngineError::UnexpectedCompletion {
        wr_id: completion.wr_id,
        kind: completion.kind,
    })
}

fn pre_post<T: Transport>(transport: &mut T, rings: &[RecvRing<'_>]) -> Result<(), EngineError> {
    for (peer, ring) in rings.iter().enumerate() {
        for slot in 0..ring.slots() {
            transport.post_recv(peer, data_wr_id(peer, slot), ring.slice(slot))?;
        }
    }
    Ok(())
}

pub fn run_server<T: Transport>(
    transport: &mut T, rings: &[RecvRing<'_>], staging: &StagingArea<'_>, params: &EngineParams, mut meter: OpMeter,
) -> Result<LaneOutcome, EngineError> {
    let num_peers = rings.len();
    let mut wcs = [Completion::default(); POLL_BATCH];

    pre_post(transport, rings)?;
    for peer in 0..num_peers {
        transport.post_send(peer, START_WR_ID, IMM_START, staging.control_slice())?;
    }
    meter.start();
    debug!(peers = num_peers, "server lane started");

    'running: loop {
        let num = transport.poll(&mut wcs)?;
        for wc in &wcs[..num] {
            let CompletionKind::Recv { imm } = wc.kind else {
                continue;
            };

            if meter.record() >= params.total_ops {
                meter.finish();
                break 'running;
            }

            let to = sender(imm, params, num_peers)?;
            let (owner, slot) = data_slot(wc)?;
            let buf = rings[owner].slice(slot);
            transport.post_send(to, wc.wr_id, IMM_REGULAR, buf)?;
            transport.post_recv(owner, wc.wr_id, buf)?;
        }
    }

    debug!(ops = meter.ops(), "total reached, stopping clients");
    for peer in 0..num_peers {
        transport.post_send(peer, STOP_WR_ID, IMM_STOP, staging.control_slice())?;
    }

    // every earlier send on a QP completes before its stop message does
    let mut acked = 0;
    while acked < num_peers {
        let num = transport.poll(&mut wcs)?;
        acked += wcs[..num]
            .iter()
            .filter(|wc| wc.kind == CompletionKind::Send && wc.wr_id == STOP_WR_ID)
            .count();
    }

    Ok(meter.outcome(0, acked))
}

#[derive(Debug, Default, Clone, Copy)]
struct ServerLink {
    stopped: bool,
    in_flight: usize,
}

pub fn run_client<T: Transport>(
    transport: &mut T, rings: &[RecvRing<'_>], staging: &StagingArea<'_>, params: &EngineParams, mut meter: OpMeter,
) -> Result<LaneOutcome, EngineError> {
    let num_peers = rings.len();
    let imm = if params.caps.multi_peer { params.rank } else { IMM_REGULAR };
    let payload = staging.slice(0);
    let mut links = vec![ServerLink::default(); num_peers];
    let mut stopped = 0;
    let mut wcs = [Completion::default(); POLL_BATCH];

    pre_post(transport, rings)?;
    meter.start();

    while stopped < num_peers {
        let num = transport.poll(&mut wcs)?;
        for wc in &wcs[..num] {
            match wc.kind {
                CompletionKind::Send => {
                    let (peer, _) = data_slot(wc)?;
                    links[peer].in_flight = links[peer].in_flight.saturating_sub(1);
                },
                CompletionKind::Recv { imm: IMM_START } => {
                    let (peer, slot) = data_slot(wc)?;
                    transport.post_recv(peer, wc.wr_id, rings[peer].slice(slot))?;
                    for slot in 0..rings[peer].slots() {
                        transport.post_send(peer, data_wr_id(peer, slot), imm, payload)?;
                        links[peer].in_flight += 1;
                    }
                    debug!(peer = params.first_peer + peer, "server started us");
                },
                CompletionKind::Recv { imm: IMM_STOP } => {
                    let (peer, _) = data_slot(wc)?;
                    if !links[peer].stopped {
                        links[peer].stopped = true;
                        stopped += 1;
                    }
                    if stopped == num_peers {
                        meter.finish();
                    }
                    debug!(peer = params.first_peer + peer, ops = meter.ops(), "server stopped us");
                },
                CompletionKind::Recv { .. } => {
                    let (peer, slot) = data_slot(wc)?;
                    meter.record();
                    transport.post_recv(peer, wc.wr_id, rings[peer].slice(slot))?;
                    if !links[peer].stopped {
                        transport.post_send(peer, data_wr_id(peer, slot), imm, payload)?;
                        links[peer].in_flight += 1;
                    }
                    trace!(peer, slot, "echo received");
                },
                CompletionKind::Write => {
                    return Err(EngineError::UnexpectedCompletion {
                        wr_id: wc.wr_id,
                        kind: wc.kind,
                    })
                },
            }
        }
    }

    // the servers may already be tearing down, sends still in flight are left behind
    let abandoned: usize = links.iter().map(|link| link.in_flight).sum();
    debug!(ops = meter.ops(), abandoned, "client lane done");
    Ok(meter.outcome(0, stopped))
}
