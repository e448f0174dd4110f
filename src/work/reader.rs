// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! `QueueReader`: a per-kernel prefetch adapter over `WorkQueue` (§4.7).
//!
//! Dedicated kernel threads are plain OS threads, not async tasks — they
//! can't await a `WorkQueue::fetch_range()` call directly without either
//! blocking the coordination thread or spinning up a runtime per kernel.
//! `QueueReader` bridges the two worlds: an async task keeps at most one
//! preprocessed `NonceRange` sitting in a bounded(1) channel, and the
//! kernel thread calls the blocking `recv()` to pull it out, which also
//! kicks off prefetching the next one. Grounded on phoenix2's
//! `util/QueueReader.py`.

use crate::work::NonceRange;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

const SAMPLES: usize = 3;

/// What a `QueueReader` pulls ranges from. Implemented for
/// `Arc<work::queue::WorkQueue<C>>` so this module has no direct
/// dependency on the queue's `Coordinator` generic.
#[async_trait]
pub trait RangeSource: Send + Sync {
    async fn fetch_range(&self, size: Option<u64>) -> NonceRange;
}

#[async_trait]
impl<C> RangeSource for Arc<crate::work::queue::WorkQueue<C>>
where
    C: crate::work::queue::Coordinator + 'static,
{
    async fn fetch_range(&self, size: Option<u64>) -> NonceRange {
        crate::work::queue::WorkQueue::fetch_range(self, size).await
    }
}

/// One handoff: the preprocessed value a kernel actually consumes, plus
/// the raw `NonceRange` the reader needs back to time the execution and
/// detect staleness.
struct Item<P> {
    processed: P,
    raw: NonceRange,
}

struct Shared<P> {
    execution_time_samples: Mutex<VecDeque<Duration>>,
    execution_size: Mutex<Option<u64>>,
    work_size_callback: Option<Box<dyn Fn(Option<Duration>, u64) -> u64 + Send + Sync>>,
    preprocessor: Option<Box<dyn Fn(&NonceRange) -> P + Send + Sync>>,
    index: Option<usize>,
}

pub struct QueueReader<P: Send + 'static> {
    source: Arc<dyn RangeSource>,
    shared: Arc<Shared<P>>,
    /// `None` once `stop()` has run; dropping the sender is what makes a
    /// blocked `recv_blocking` wake up with `None` (§4.7 "push a sentinel").
    /// A plain `std::sync::Mutex` (not `tokio::sync::Mutex`) so `stop()` can
    /// clear it synchronously from a non-async caller.
    tx: std::sync::Mutex<Option<mpsc::Sender<Item<P>>>>,
    rx: Mutex<mpsc::Receiver<Item<P>>>,
    /// The unit backing whatever item is currently sitting in the
    /// bounded(1) channel, not yet pulled out by `recv_blocking`. Lets
    /// `purge_stale` recognize a buffered (as opposed to already-delivered)
    /// item that needs dropping.
    buffered: Mutex<Option<NonceRange>>,
    current: Mutex<Option<NonceRange>>,
    started_at: Mutex<Instant>,
}

impl<P: Send + 'static> QueueReader<P> {
    pub fn new(
        source: Arc<dyn RangeSource>,
        preprocessor: Option<Box<dyn Fn(&NonceRange) -> P + Send + Sync>>,
        work_size_callback: Option<Box<dyn Fn(Option<Duration>, u64) -> u64 + Send + Sync>>,
        index: Option<usize>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        Arc::new(Self {
            source,
            shared: Arc::new(Shared {
                execution_time_samples: Mutex::new(VecDeque::with_capacity(SAMPLES)),
                execution_size: Mutex::new(None),
                work_size_callback,
                preprocessor,
                index,
            }),
            tx: std::sync::Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            buffered: Mutex::new(None),
            current: Mutex::new(None),
            started_at: Mutex::new(Instant::now()),
        })
    }

    /// Called once by the owning kernel when it actually starts running.
    pub async fn start(self: &Arc<Self>) {
        self.update_work_size(None, 0).await;
        self.request_more().await;
    }

    async fn update_work_size(&self, time: Option<Duration>, size: u64) {
        if let Some(cb) = &self.shared.work_size_callback {
            let size = cb(time, size);
            *self.shared.execution_size.lock().await = Some(size);
        }
    }

    async fn request_more(self: &Arc<Self>) {
        let sender = {
            let guard = self.tx.lock().expect("sender lock poisoned");
            match guard.as_ref() {
                Some(tx) => {
                    if tx.capacity() == 0 {
                        // a prepared item is already sitting in the channel
                        return;
                    }
                    tx.clone()
                }
                None => return, // stopped
            }
        };

        let size = *self.shared.execution_size.lock().await;
        let range = self.source.fetch_range(size).await;

        let reader = self.clone();
        let range_for_stale = range.clone();
        range.unit.on_stale(move || {
            let reader = reader.clone();
            tokio::spawn(async move {
                reader.purge_stale(&range_for_stale).await;
            });
        });

        let processed = match &self.shared.preprocessor {
            Some(pre) => pre(&range),
            None => return, // P must be produced by a preprocessor when used generically
        };

        *self.buffered.lock().await = Some(range.clone());
        if sender.send(Item { processed, raw: range }).await.is_err() {
            *self.buffered.lock().await = None;
        }
    }

    /// Drops any prefetched item belonging to a unit that just went stale
    /// — whether it's already been delivered to the kernel thread
    /// (`current`) or is still sitting unread in the bounded(1) channel
    /// (`buffered`) — and immediately requests a replacement if that
    /// emptied the channel.
    async fn purge_stale(self: &Arc<Self>, stale: &NonceRange) {
        let buffered_is_stale = self
            .buffered
            .lock()
            .await
            .as_ref()
            .map(|r| Arc::ptr_eq(&r.unit, &stale.unit))
            .unwrap_or(false);
        if buffered_is_stale {
            // tokio::mpsc has no peek API; try_recv drains the buffered
            // item before a kernel thread can receive it. If a concurrent
            // recv_blocking already won the race, try_recv comes back
            // empty and `current`'s check below catches it instead.
            let mut rx = self.rx.lock().await;
            if rx.try_recv().is_ok() {
                *self.buffered.lock().await = None;
            }
        }

        let holds_stale = self
            .current
            .lock()
            .await
            .as_ref()
            .map(|r| Arc::ptr_eq(&r.unit, &stale.unit))
            .unwrap_or(false);
        let slot_empty = match self.tx.lock().expect("sender lock poisoned").as_ref() {
            Some(tx) => tx.capacity() == 1,
            None => false,
        };
        if holds_stale || slot_empty {
            self.request_more().await;
        }
    }

    async fn ran_execution(self: &Arc<Self>, nr: &NonceRange, dt: Duration) {
        if dt.as_secs_f64() > 0.0 {
            if let Some(index) = self.shared.index {
                let khps = (nr.size as f64 / dt.as_secs_f64() / 1000.0) as i64;
                tracing::trace!(index, khps, "kernel execution rate sample");
            }
        }

        let mut samples = self.shared.execution_time_samples.lock().await;
        samples.push_back(dt);
        while samples.len() > SAMPLES {
            samples.pop_front();
        }
        if samples.len() == SAMPLES {
            let total: Duration = samples.iter().sum();
            let average = total / SAMPLES as u32;
            drop(samples);
            self.update_work_size(Some(average), nr.size).await;
        }
    }

    /// Blocking pull for a dedicated kernel thread: returns the next
    /// preprocessed item, or `None` once the reader has been stopped.
    pub fn recv_blocking(self: &Arc<Self>) -> Option<P> {
        let previous = {
            let rt = tokio::runtime::Handle::current();
            rt.block_on(self.current.lock()).clone()
        };
        if let Some(prev) = previous {
            let started_at = {
                let rt = tokio::runtime::Handle::current();
                *rt.block_on(self.started_at.lock())
            };
            let now = Instant::now();
            let dt = now.saturating_duration_since(started_at);
            let this = self.clone();
            let rt = tokio::runtime::Handle::current();
            rt.block_on(self.started_at.lock()).clone_from(&now);
            rt.spawn(async move { this.ran_execution(&prev, dt).await });
        }

        let rt = tokio::runtime::Handle::current();
        let item = rt.block_on(async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        })?;

        *rt.block_on(self.buffered.lock()) = None;
        *rt.block_on(self.current.lock()) = Some(item.raw.clone());

        let this = self.clone();
        rt.spawn(async move { this.request_more().await });

        Some(item.processed)
    }

    /// Stops delivering new work: drops the sender so any already-queued
    /// item is still delivered, but the channel closes behind it — a
    /// kernel thread blocked in (or about to call) `recv_blocking` then
    /// unblocks with `None` once that last item is drained (§4.7 "drain
    /// the channel and push a sentinel").
    pub fn stop(&self) {
        self.tx.lock().expect("sender lock poisoned").take();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hash;
    use crate::work::{queue, AssignedWork};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Default)]
    struct TestCoordinator {
        requests: AtomicU64,
        idle: AtomicBool,
    }

    impl queue::Coordinator for Arc<TestCoordinator> {
        fn request_work(&self) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }
        fn report_idle(&self, idle: bool) {
            self.idle.store(idle, Ordering::SeqCst);
        }
        fn is_idle(&self) -> bool {
            self.idle.load(Ordering::SeqCst)
        }
    }

    fn work(identifier: u8, nonces: u64) -> AssignedWork {
        let mut data = [0u8; 80];
        data[0] = identifier;
        hash::set_header_timestamp(&mut data, 1_700_000_000);
        let mut aw = AssignedWork::new(data, [0xffu8; 32], vec![identifier; 32]);
        aw.nonces = Some(nonces);
        aw.set_max_time_increment(3600);
        aw
    }

    #[tokio::test]
    async fn delivers_preprocessed_ranges_in_order() {
        let coordinator = Arc::new(TestCoordinator::default());
        let q = queue::WorkQueue::new(queue::QueueConfig::default(), coordinator);
        q.store_work(work(1, 1000)).await;

        let reader: Arc<QueueReader<u64>> = QueueReader::new(
            Arc::new(q) as Arc<dyn RangeSource>,
            Some(Box::new(|nr: &NonceRange| nr.base)),
            None,
            Some(0),
        );
        reader.start().await;
        tokio::task::yield_now().await;

        let r = tokio::task::spawn_blocking({
            let reader = reader.clone();
            move || reader.recv_blocking()
        })
        .await
        .unwrap();
        assert_eq!(r, Some(0));
    }

    /// Hands out one fixed `NonceRange` per call, in order, cycling to the
    /// last one once exhausted — enough to drive `purge_stale` without a
    /// full `WorkQueue`.
    struct FixedRanges {
        ranges: Vec<NonceRange>,
        next: AtomicU64,
    }

    #[async_trait]
    impl RangeSource for FixedRanges {
        async fn fetch_range(&self, _size: Option<u64>) -> NonceRange {
            let i = self.next.fetch_add(1, Ordering::SeqCst) as usize;
            self.ranges[i.min(self.ranges.len() - 1)].clone()
        }
    }

    fn unit_range(identifier: u8) -> NonceRange {
        let aw = work(identifier, 1000);
        let unit = std::sync::Arc::new(crate::work::WorkUnit::new(&aw));
        let (spec, _depleted) = unit.take_range(100);
        NonceRange::new(unit, spec)
    }

    #[tokio::test]
    async fn purge_stale_drops_a_buffered_item_not_just_the_delivered_one() {
        let first = unit_range(1);
        let second = unit_range(2);
        let source = Arc::new(FixedRanges {
            ranges: vec![first.clone(), second.clone()],
            next: AtomicU64::new(0),
        });

        let reader: Arc<QueueReader<u8>> = QueueReader::new(
            source as Arc<dyn RangeSource>,
            Some(Box::new(|nr: &NonceRange| nr.unit.identifier[0])),
            None,
            Some(0),
        );
        reader.start().await;

        // `first` is now sitting buffered in the channel, unread. Staling
        // its unit must purge that buffered item, not the (nonexistent)
        // `current` one, and pull a replacement.
        first.unit.mark_stale();
        reader.purge_stale(&first).await;

        let r = tokio::task::spawn_blocking({
            let reader = reader.clone();
            move || reader.recv_blocking()
        })
        .await
        .unwrap();
        assert_eq!(r, Some(2));
    }

    #[tokio::test]
    async fn stop_unblocks_a_pending_recv_with_none() {
        let coordinator = Arc::new(TestCoordinator::default());
        let q = queue::WorkQueue::new(queue::QueueConfig::default(), coordinator);

        let reader: Arc<QueueReader<u64>> = QueueReader::new(
            Arc::new(q) as Arc<dyn RangeSource>,
            Some(Box::new(|nr: &NonceRange| nr.base)),
            None,
            Some(0),
        );
        // nothing has been store_work'd, so the channel is empty and
        // recv_blocking would otherwise hang forever.
        reader.stop();

        let r = tokio::task::spawn_blocking({
            let reader = reader.clone();
            move || reader.recv_blocking()
        })
        .await
        .unwrap();
        assert_eq!(r, None);
    }
}
