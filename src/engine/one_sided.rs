//! Remote-write echo with software-detected arrival.
//!
//! A write lands without any receive completion, so each side busy-polls the sentinel bytes of
//! the slot it expects next. Both ends of a link walk the same slot index: a message arriving
//! in local slot `k` is answered by a write into remote slot `k`, which the peer cleared before
//! it wrote to us. The server initiates every link and both sides perform exactly `total_ops`
//! exchanges per link.
//!
//! Only every `signal_interval`-th write of a link asks for a completion, plus the last one;
//! the others complete silently and are reclaimed by the next signaled write on the same QP.
use tracing::{debug, trace};

use super::transport::data_wr_id;
use super::{Completion, CompletionKind, EngineError, EngineParams, LaneOutcome, OpMeter, RemoteWrite, Transport};
use super::POLL_BATCH;
use crate::config::Role;
use crate::ring::{RecvRing, RemoteRing, RingCursor, StagingArea};

struct Link<'a> {
    peer: usize,
    ring: &'a RecvRing<'a>,
    remote: RemoteRing,
    cursor: RingCursor,
    arrivals: u64,
    written: u64,
    pending: Vec<RemoteWrite>,
}

struct Writer<'s> {
    staging: &'s StagingArea<'s>,
    total_ops: u64,
    signal_interval: u64,
    chain_len: usize,
    signaled_in_flight: u64,
}

impl Writer<'_> {
    /// Queue a write of the next payload into remote `slot`, posting the link's chain once it
    /// is full or holds the link's last write.
    fn push<T: Transport>(&mut self, transport: &mut T, link: &mut Link<'_>, slot: usize) -> Result<(), EngineError> {
        link.written += 1;
        let last = link.written == self.total_ops;
        let signaled = last || link.written % self.signal_interval == 0;
        if signaled {
            self.signaled_in_flight += 1;
        }

        link.pending.push(RemoteWrite {
            wr_id: data_wr_id(link.peer, slot),
            local: self.staging.slice(slot % self.staging.slots()),
            remote_addr: link.remote.slot_addr(slot),
            rkey: link.remote.rkey(),
            signaled,
        });

        if last || link.pending.len() >= self.chain_len {
            transport.post_writes(link.peer, &link.pending)?;
            link.pending.clear();
        }
        Ok(())
    }
}

pub fn run<T: Transport>(
    transport: &mut T, rings: &[RecvRing<'_>], remotes: &[RemoteRing], staging: &StagingArea<'_>,
    params: &EngineParams, mut meter: OpMeter,
) -> Result<LaneOutcome, EngineError> {
    let initiator = params.role == Role::Server;
    let total = params.total_ops;
    let chain_len = params.chain_len();

    let mut links: Vec<Link<'_>> = rings
        .iter()
        .zip(remotes)
        .enumerate()
        .map(|(peer, (ring, remote))| Link {
            peer,
            ring,
            remote: *remote,
            cursor: RingCursor::new(ring.slots()),
            arrivals: 0,
            written: 0,
            pending: Vec::with_capacity(chain_len),
        })
        .collect();
    let mut writer = Writer {
        staging,
        total_ops: total,
        signal_interval: params.signal_interval.max(1),
        chain_len,
        signaled_in_flight: 0,
    };
    let mut signaled_completions = 0;
    let mut wcs = [Completion::default(); POLL_BATCH];

    meter.start();
    if initiator {
        for link in &mut links {
            let first = (link.ring.slots() as u64).min(total) as usize;
            for slot in 0..first {
                writer.push(transport, link, slot)?;
            }
            if !link.pending.is_empty() {
                transport.post_writes(link.peer, &link.pending)?;
                link.pending.clear();
            }
        }
    }
    debug!(links = links.len(), initiator, "one-sided lane started");

    let mut done = links.iter().filter(|link| link.arrivals >= total).count();
    if done == links.len() {
        meter.finish();
    }

    while done < links.len() || writer.signaled_in_flight > 0 {
        for link in &mut links {
            if link.arrivals >= total {
                continue;
            }
            let slot = link.cursor.slot();
            if !link.ring.has_arrived(slot) {
                continue;
            }

            link.ring.clear(slot);
            link.cursor.advance();
            link.arrivals += 1;
            meter.record();
            trace!(peer = link.peer, slot, "arrival");

            if !initiator || link.written < total {
                writer.push(transport, link, slot)?;
            }
            if link.arrivals == total {
                done += 1;
                if done == links.len() {
                    meter.finish();
                }
            }
        }

        if writer.signaled_in_flight > 0 {
            let num = transport.poll(&mut wcs)?;
            for wc in &wcs[..num] {
                if wc.kind != CompletionKind::Write {
                    return Err(EngineError::UnexpectedCompletion {
                        wr_id: wc.wr_id,
                        kind: wc.kind,
                    });
                }
                writer.signaled_in_flight -= 1;
                signaled_completions += 1;
            }
        }
    }

    Ok(meter.outcome(signaled_completions, 0))
}
