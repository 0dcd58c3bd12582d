//! An in-process [`Transport`] for driving the engines without an adapter.
//!
//! Two [`LoopbackEnd`]s form a link. Sends are copied into the peer's inbox and matched against
//! its posted receives when the peer polls; writes are copied straight into the peer's memory with
//! the last and first byte stored last, the way an adapter's DMA may land.
//!
//! With a shared receive queue every receive goes into one pool. An SRQ hands out any posted
//! buffer; this one prefers buffers owned by a peer other than the sender, so the engine has to
//! route each echo by its immediate data.
use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use super::transport::split_wr_id;
use super::{Completion, CompletionKind, EngineError, RemoteWrite, Transport};
use crate::ibverbs::completion::{WorkCompletionOperationType, WorkCompletionStatus};
use crate::ibverbs::memory_region::AlignedBuffer;
use crate::ring::{LocalSlice, MemoryLayout, RecvRing, RemoteRing, StagingArea, SENTINEL};

struct Packet {
    imm: u32,
    data: Vec<u8>,
}

type Mailbox = Arc<Mutex<VecDeque<Packet>>>;

pub(crate) struct LoopbackEnd {
    inbox: Mailbox,
    outbox: Mailbox,
}

pub(crate) fn link() -> (LoopbackEnd, LoopbackEnd) {
    let forward = Mailbox::default();
    let backward = Mailbox::default();
    (
        LoopbackEnd {
            inbox: Arc::clone(&backward),
            outbox: Arc::clone(&forward),
        },
        LoopbackEnd {
            inbox: forward,
            outbox: backward,
        },
    )
}

pub(crate) struct LoopbackTransport {
    ends: Vec<LoopbackEnd>,
    posted: Vec<VecDeque<(u64, LocalSlice)>>,
    shared: bool,
    completions: VecDeque<Completion>,
    writes: u64,
    chains: Vec<usize>,
    crossed: u64,
    delivered: u64,
    fail_after: Option<u64>,
}

impl LoopbackTransport {
    pub(crate) fn new(ends: Vec<LoopbackEnd>) -> Self {
        let posted = ends.iter().map(|_| VecDeque::new()).collect();
        LoopbackTransport {
            ends,
            posted,
            shared: false,
            completions: VecDeque::new(),
            writes: 0,
            chains: Vec::new(),
            crossed: 0,
            delivered: 0,
            fail_after: None,
        }
    }

    /// Receives of every peer go into one pool, like a server with a shared receive queue.
    pub(crate) fn with_shared_receive_queue(ends: Vec<LoopbackEnd>) -> Self {
        LoopbackTransport {
            posted: vec![VecDeque::new()],
            shared: true,
            ..Self::new(ends)
        }
    }

    /// Report a failed completion once `delivered` completions have been handed out.
    pub(crate) fn fail_after(mut self, delivered: u64) -> Self {
        self.fail_after = Some(delivered);
        self
    }

    /// Messages that landed in a buffer owned by a peer other than their sender.
    pub(crate) fn crossed(&self) -> u64 {
        self.crossed
    }

    /// Remote writes posted so far.
    pub(crate) fn writes(&self) -> u64 {
        self.writes
    }

    /// Length of every posted write chain, in post order.
    pub(crate) fn chains(&self) -> Vec<usize> {
        self.chains.clone()
    }

    fn end(&self, peer: usize) -> Result<&LoopbackEnd, EngineError> {
        self.ends.get(peer).ok_or(EngineError::UnknownPeer { peer: peer as u64 })
    }
}

impl Transport for LoopbackTransport {
    fn post_recv(&mut self, peer: usize, wr_id: u64, buf: LocalSlice) -> Result<(), EngineError> {
        self.end(peer)?;
        let queue = if self.shared { 0 } else { peer };
        self.posted[queue].push_back((wr_id, buf));
        Ok(())
    }

    fn post_send(&mut self, peer: usize, wr_id: u64, imm: u32, buf: LocalSlice) -> Result<(), EngineError> {
        let data = unsafe { std::slice::from_raw_parts(buf.addr as *const u8, buf.len as usize).to_vec() };
        self.end(peer)?.outbox.lock().unwrap().push_back(Packet { imm, data });
        self.completions.push_back(Completion {
            wr_id,
            kind: CompletionKind::Send,
        });
        Ok(())
    }

    fn post_writes(&mut self, peer: usize, writes: &[RemoteWrite]) -> Result<(), EngineError> {
        self.end(peer)?;
        for write in writes {
            let len = write.local.len as usize;
            let src = write.local.addr as *const u8;
            let dst = write.remote_addr as *mut u8;
            unsafe {
                if len > 2 {
                    ptr::copy_nonoverlapping(src.add(1), dst.add(1), len - 2);
                }
                if len > 0 {
                    AtomicU8::from_ptr(dst.add(len - 1)).store(*src.add(len - 1), Ordering::Release);
                    AtomicU8::from_ptr(dst).store(*src, Ordering::Release);
                }
            }
            if write.signaled {
                self.completions.push_back(Completion {
                    wr_id: write.wr_id,
                    kind: CompletionKind::Write,
                });
            }
        }
        self.writes += writes.len() as u64;
        self.chains.push(writes.len());
        Ok(())
    }

    fn poll(&mut self, out: &mut [Completion]) -> Result<usize, EngineError> {
        if self.fail_after.is_some_and(|limit| self.delivered >= limit) {
            let next = self.completions.front().copied().unwrap_or_default();
            return Err(EngineError::CompletionFailed {
                wr_id: next.wr_id,
                opcode: WorkCompletionOperationType::Send,
                status: WorkCompletionStatus::RetryCounterExceededError,
                vendor_err: 0x81,
            });
        }
        let cap = match self.fail_after {
            Some(limit) => ((limit - self.delivered) as usize).min(out.len()),
            None => out.len(),
        };
        let out = &mut out[..cap];

        let mut num = 0;
        while num < out.len() {
            let Some(completion) = self.completions.pop_front() else {
                break;
            };
            out[num] = completion;
            num += 1;
        }

        for (sender, end) in self.ends.iter().enumerate() {
            let mut inbox = end.inbox.lock().unwrap();
            let pool = &mut self.posted[if self.shared { 0 } else { sender }];
            while num < out.len() && !inbox.is_empty() && !pool.is_empty() {
                let pick = if self.shared {
                    pool.iter()
                        .position(|(wr_id, _)| split_wr_id(*wr_id).is_some_and(|(owner, _)| owner != sender))
                        .unwrap_or(0)
                } else {
                    0
                };
                let (Some(packet), Some((wr_id, buf))) = (inbox.pop_front(), pool.remove(pick)) else {
                    break;
                };
                assert!(packet.data.len() <= buf.len as usize, "message overruns its receive buffer");
                unsafe {
                    ptr::copy_nonoverlapping(packet.data.as_ptr(), buf.addr as *mut u8, packet.data.len());
                }
                if split_wr_id(wr_id).is_some_and(|(owner, _)| owner != sender) {
                    self.crossed += 1;
                }
                out[num] = Completion {
                    wr_id,
                    kind: CompletionKind::Recv { imm: packet.imm },
                };
                num += 1;
            }
        }

        self.delivered += num as u64;
        if num == 0 {
            thread::yield_now();
        }
        Ok(num)
    }
}

/// A node's buffer, laid out and filled the way [`crate::resources::Resources`] does it.
pub(crate) struct LoopbackNode {
    layout: MemoryLayout,
    buffer: AlignedBuffer,
}

impl LoopbackNode {
    pub(crate) fn new(msg_size: usize, slots: usize, num_peers: usize, staging_slots: usize) -> Self {
        let layout = MemoryLayout::new(msg_size, slots, num_peers, staging_slots).unwrap();
        let buffer = AlignedBuffer::zeroed(layout.total_len()).unwrap();
        unsafe {
            ptr::write_bytes(
                buffer.as_ptr().as_ptr().add(layout.staging_offset()),
                SENTINEL,
                staging_slots * msg_size,
            );
        }
        LoopbackNode { layout, buffer }
    }

    /// The receive rings; call once per node.
    pub(crate) fn rings(&self) -> Vec<RecvRing<'_>> {
        (0..self.layout.num_peers())
            .map(|peer| unsafe {
                RecvRing::from_raw(self.at(self.layout.recv_ring_offset(peer)), self.layout.slots(), self.layout.msg_size())
            })
            .collect()
    }

    pub(crate) fn staging(&self) -> StagingArea<'_> {
        unsafe {
            StagingArea::from_raw(
                self.at(self.layout.staging_offset()),
                self.layout.staging_slots(),
                self.layout.msg_size(),
            )
        }
    }

    /// `peer`'s receive ring as the peer sees it.
    pub(crate) fn remote_ring(&self, peer: usize) -> RemoteRing {
        let base = self.at(self.layout.recv_ring_offset(peer)).as_ptr() as u64;
        RemoteRing::new(base, 0, self.layout.slots(), self.layout.msg_size())
    }

    fn at(&self, offset: usize) -> ptr::NonNull<u8> {
        unsafe { ptr::NonNull::new_unchecked(self.buffer.as_ptr().as_ptr().add(offset)) }
    }
}
