//! Hand-off queues for the compression pipeline.
//!
//! Raw blocks travel from the reader to the matcher workers over a bounded
//! `sync_channel` whose receiver the workers share; `OrderedBlockQueue`
//! collects worker results and releases them strictly in block-id order.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Condvar, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| anyhow!("pipeline queue lock poisoned"))
}

/// Receiving end of the raw-block channel, shared by the matcher workers.
pub struct BlockReceiver<T> {
    rx: Mutex<Option<Receiver<T>>>,
}

/// Bounded channel: `send` blocks while `capacity` blocks are in flight.
pub fn block_channel<T>(capacity: usize) -> (SyncSender<T>, BlockReceiver<T>) {
    let (tx, rx) = sync_channel(capacity.max(1));
    (tx, BlockReceiver { rx: Mutex::new(Some(rx)) })
}

impl<T> BlockReceiver<T> {
    /// Next block, or `None` once the sender is gone or the channel was closed.
    pub fn recv(&self) -> Result<Option<T>> {
        let rx = lock(&self.rx)?;
        Ok(rx.as_ref().and_then(|rx| rx.recv().ok()))
    }

    /// Drop the receiver: pending blocks are freed and a blocked sender fails.
    pub fn close(&self) {
        if let Ok(mut rx) = self.rx.lock() {
            *rx = None;
        }
    }
}

struct OrderedState<T> {
    items: BTreeMap<u32, T>,
    workers_left: usize,
    aborted: bool,
}

/// Results keyed by block id, released in id order.
pub struct OrderedBlockQueue<T> {
    state: Mutex<OrderedState<T>>,
    ready: Condvar,
}

impl<T> OrderedBlockQueue<T> {
    pub fn new(workers: usize) -> Self {
        Self {
            state: Mutex::new(OrderedState {
                items: BTreeMap::new(),
                workers_left: workers,
                aborted: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn push(&self, block_id: u32, item: T) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.items.insert(block_id, item);
        self.ready.notify_all();
        Ok(())
    }

    /// A worker finished; wakes the consumer so it can notice completion.
    pub fn worker_done(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.workers_left = state.workers_left.saturating_sub(1);
        }
        self.ready.notify_all();
    }

    /// Wait for block `expected`. Returns `None` when every worker has
    /// finished and that block never arrived, or on abort.
    pub fn pop(&self, expected: u32) -> Result<Option<T>> {
        let mut state = lock(&self.state)?;
        loop {
            if state.aborted {
                return Ok(None);
            }
            if let Some(item) = state.items.remove(&expected) {
                return Ok(Some(item));
            }
            if state.workers_left == 0 {
                return Ok(None);
            }
            state = self
                .ready
                .wait(state)
                .map_err(|_| anyhow!("pipeline queue lock poisoned"))?;
        }
    }

    pub fn abort(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.aborted = true;
            state.items.clear();
        }
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_channel_drains_after_sender_drop() {
        let (tx, rx) = block_channel(4);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        drop(tx);
        assert_eq!(rx.recv().unwrap(), Some(1));
        assert_eq!(rx.recv().unwrap(), Some(2));
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn test_workers_share_receiver() {
        let (tx, rx) = block_channel(1);
        let mut got: Vec<u32> = std::thread::scope(|scope| {
            let rx = &rx;
            let workers: Vec<_> = (0..3)
                .map(|_| {
                    scope.spawn(move || {
                        let mut mine = Vec::new();
                        while let Some(x) = rx.recv().unwrap() {
                            mine.push(x);
                        }
                        mine
                    })
                })
                .collect();
            for i in 0..50u32 {
                tx.send(i).unwrap();
            }
            drop(tx);
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });
        got.sort_unstable();
        assert_eq!(got, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_close_releases_sender() {
        let (tx, rx) = block_channel(1);
        tx.send(1).unwrap();
        rx.close();
        assert!(tx.send(2).is_err());
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn test_ordered_release() {
        let q = Arc::new(OrderedBlockQueue::new(2));
        let workers: Vec<_> = [vec![3u32, 1], vec![2, 0]]
            .into_iter()
            .map(|ids| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for id in ids {
                        q.push(id, id * 10).unwrap();
                    }
                    q.worker_done();
                })
            })
            .collect();
        let mut got = Vec::new();
        let mut next = 0;
        while let Some(x) = q.pop(next).unwrap() {
            got.push(x);
            next += 1;
        }
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(got, vec![0, 10, 20, 30]);
    }

    #[test]
    fn test_ordered_gap_ends_when_workers_finish() {
        let q = OrderedBlockQueue::new(1);
        q.push(1, "b").unwrap();
        q.worker_done();
        assert_eq!(q.pop(0).unwrap(), None);
    }
}
