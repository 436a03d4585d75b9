//! Sliding reassembly window
//!
//! N producer tasks pull monotonically increasing sequence numbers from a
//! shared counter and run one part operation each; the consumer receives the
//! results strictly in sequence order no matter how the operations complete.
//! Buffering is bounded by the window size: a producer can never run more
//! than a window ahead of the oldest unflushed sequence, because the hand-off
//! channel and the worker pool are both capped at `concurrency`.
//!
//! A producer returning `Ok(None)` marks the end of data at its sequence:
//! earlier sequences still flush, later ones are discarded. This is how
//! unknown-length downloads stop on a range-not-satisfiable response. The
//! first error (in sequence order) is surfaced exactly once and terminates
//! the window. Dropping the window aborts every producer task.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as MemOrdering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::TransferError;

enum Slot<T> {
    Item(T),
    End,
    Failed(TransferError),
}

struct Pending<T> {
    seq: u64,
    slot: Slot<T>,
}

impl<T> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for Pending<T> {}

impl<T> PartialOrd for Pending<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Pending<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq.cmp(&other.seq)
    }
}

pub(crate) struct SlidingWindow<T> {
    rx: mpsc::Receiver<Pending<T>>,
    pending: BinaryHeap<Reverse<Pending<T>>>,
    next_seq: u64,
    done: bool,
    // Aborts all producers on drop.
    _producers: JoinSet<()>,
}

impl<T: Send + 'static> SlidingWindow<T> {
    /// Spawn `concurrency` producers, each repeatedly taking the next
    /// sequence number and running `produce` for it.
    pub(crate) fn spawn<F, Fut>(concurrency: usize, produce: F) -> Self
    where
        F: Fn(u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<T>, TransferError>> + Send + 'static,
    {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::channel(concurrency);
        let next = Arc::new(AtomicU64::new(0));
        let halted = Arc::new(AtomicBool::new(false));
        let produce = Arc::new(produce);

        let mut producers = JoinSet::new();
        for _ in 0..concurrency {
            let tx = tx.clone();
            let next = Arc::clone(&next);
            let halted = Arc::clone(&halted);
            let produce = Arc::clone(&produce);

            producers.spawn(async move {
                loop {
                    if halted.load(MemOrdering::SeqCst) {
                        break;
                    }
                    let seq = next.fetch_add(1, MemOrdering::SeqCst);
                    let slot = match produce(seq).await {
                        Ok(Some(item)) => Slot::Item(item),
                        Ok(None) => {
                            halted.store(true, MemOrdering::SeqCst);
                            Slot::End
                        }
                        Err(err) => {
                            halted.store(true, MemOrdering::SeqCst);
                            Slot::Failed(err)
                        }
                    };
                    let terminal = !matches!(slot, Slot::Item(_));
                    if tx.send(Pending { seq, slot }).await.is_err() {
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
            });
        }

        Self {
            rx,
            pending: BinaryHeap::new(),
            next_seq: 0,
            done: false,
            _producers: producers,
        }
    }

    /// Receive the next result in sequence order. `Ok(None)` means the
    /// window has drained; after a terminal result every later call returns
    /// `Ok(None)`.
    pub(crate) async fn recv(&mut self) -> Result<Option<T>, TransferError> {
        while !self.done {
            // Flush the head if it is the next expected sequence.
            let head_ready =
                matches!(self.pending.peek(), Some(Reverse(p)) if p.seq == self.next_seq);
            if head_ready {
                if let Some(Reverse(pending)) = self.pending.pop() {
                    self.next_seq += 1;
                    match pending.slot {
                        Slot::Item(item) => return Ok(Some(item)),
                        Slot::End => {
                            self.done = true;
                            return Ok(None);
                        }
                        Slot::Failed(err) => {
                            self.done = true;
                            return Err(err);
                        }
                    }
                }
                continue;
            }

            match self.rx.recv().await {
                Some(pending) => self.pending.push(Reverse(pending)),
                None => self.done = true,
            }
        }
        Ok(None)
    }
}
