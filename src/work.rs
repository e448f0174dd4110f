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

//! Work unit data model: `AssignedWork` (wire-facing), `WorkUnit` (the
//! queue's internal, nonce-carving representation), `NonceRange` (what a
//! kernel actually receives) and `Submission` (what goes back out).
//!
//! A `ProtocolClient` hands the queue an `AssignedWork`; the queue wraps it
//! in a `WorkUnit`, which tracks how many of its nonces have been handed out
//! (`base`) and whether the block has moved on since it was issued
//! (`is_stale`). Everything downstream of the queue — kernels, the
//! `QueueReader` prefetcher — only ever sees `NonceRange`s borrowed from a
//! `WorkUnit`.

pub mod queue;
pub mod reader;

use crate::hash::{self, Digest, Midstate};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// A unit of work as handed to the queue by a `ProtocolClient`, before it
/// has been wrapped in a `WorkUnit`. Mirrors phoenix2's `AssignedWork`: a
/// dumb bag of fields the client fills in from whatever wire format it
/// speaks.
#[derive(Debug, Clone)]
pub struct AssignedWork {
    /// 80-byte block header as given by the server (timestamp already baked
    /// in at its initial value).
    pub data: [u8; 80],
    pub target: Digest,
    /// Per-protocol block-change detector: MMP's 32-byte identifier, or
    /// RPC's `identifier` field / header bytes 4..36 fallback.
    pub identifier: Vec<u8>,
    /// log2(nonce count), when the server expresses it as a mask (MMP
    /// `WORK`). Mutually exclusive with `nonces`.
    pub mask: Option<u8>,
    /// Explicit nonce count, when the server gives one directly (RPC
    /// `mask` field, or an explicit nonce count in future dialects).
    pub nonces: Option<u64>,
    /// Seconds beyond `data`'s embedded timestamp this unit may be rolled
    /// forward (0 disables rolling). Set via `set_max_time_increment`.
    pub time: u32,
    /// Absolute timestamp ceiling: `header_timestamp(data) + time`.
    pub maxtime: u32,
}

impl AssignedWork {
    pub fn new(data: [u8; 80], target: Digest, identifier: Vec<u8>) -> Self {
        Self {
            data,
            target,
            identifier,
            mask: None,
            nonces: None,
            time: 0,
            maxtime: hash::header_timestamp(&data),
        }
    }

    /// Sets how far (in seconds) this unit's timestamp may be rolled
    /// forward, deriving the absolute `maxtime` ceiling from it.
    pub fn set_max_time_increment(&mut self, n: u32) {
        self.time = n;
        self.maxtime = hash::header_timestamp(&self.data) + n;
    }

    fn nonce_count(&self) -> u64 {
        match (self.mask, self.nonces) {
            (Some(mask), _) => 1u64 << mask,
            (None, Some(nonces)) => nonces,
            (None, None) => 1u64 << 32,
        }
    }
}

type StaleCallback = Box<dyn FnOnce() + Send>;

/// A single getwork response, up to 2^32 nonces, tracked by the queue. Not
/// `Clone`: every live reference to a unit is an `Arc<WorkUnit>` so that
/// `base` and staleness are shared, not copied.
#[derive(Debug)]
pub struct WorkUnit {
    pub data: [u8; 80],
    pub target: Digest,
    pub identifier: Vec<u8>,
    pub midstate: Midstate,
    nonces: u64,
    base: AtomicU64,
    is_stale: AtomicBool,
    /// Seconds this unit is expected to remain relevant once downloaded
    /// (phoenix2's `aw.time`), used for the expiry/lifetime checks.
    pub lifetime_secs: u32,
    pub maxtime: u32,
    pub downloaded: Instant,
    callbacks: Mutex<Vec<StaleCallback>>,
}

impl WorkUnit {
    pub fn new(aw: &AssignedWork) -> Self {
        let mut first64 = [0u8; 64];
        first64.copy_from_slice(&aw.data[..64]);

        Self {
            data: aw.data,
            target: aw.target,
            identifier: aw.identifier.clone(),
            midstate: hash::midstate(&first64),
            nonces: aw.nonce_count(),
            base: AtomicU64::new(0),
            is_stale: AtomicBool::new(false),
            lifetime_secs: aw.time,
            maxtime: aw.maxtime,
            downloaded: Instant::now(),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn nonces(&self) -> u64 {
        self.nonces
    }

    pub fn base(&self) -> u64 {
        self.base.load(Ordering::SeqCst)
    }

    pub fn nonces_left(&self) -> u64 {
        self.nonces.saturating_sub(self.base())
    }

    /// Carves off up to `size` nonces from the front of the remaining
    /// range. Returns the range actually granted and whether this exhausted
    /// the unit.
    pub fn take_range(&self, size: u64) -> (NonceRangeSpec, bool) {
        let remaining = self.nonces_left();
        if remaining >= size {
            let base = self.base.fetch_add(size, Ordering::SeqCst);
            let depleted = size >= remaining;
            (NonceRangeSpec { base, size }, depleted)
        } else {
            let base = self.base.fetch_add(remaining, Ordering::SeqCst);
            (
                NonceRangeSpec {
                    base,
                    size: remaining,
                },
                true,
            )
        }
    }

    pub fn timestamp(&self) -> u32 {
        hash::header_timestamp(&self.data)
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale.load(Ordering::SeqCst)
    }

    /// Registers `callback` to run once this unit goes stale; runs it
    /// immediately if it already has (mirrors `addStaleCallback`'s
    /// already-stale fast path).
    pub fn on_stale<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stale() {
            callback();
            return;
        }
        self.callbacks
            .lock()
            .expect("stale callback list poisoned")
            .push(Box::new(callback));
    }

    /// Marks the unit stale and fires every registered callback exactly
    /// once. Idempotent: a second call is a no-op.
    pub fn mark_stale(&self) {
        if self.is_stale.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks =
            std::mem::take(&mut *self.callbacks.lock().expect("stale callback list poisoned"));
        for cb in callbacks {
            cb();
        }
    }

    /// Builds a rolled-forward copy of this unit if rolling is both
    /// supported and still worthwhile (§4.5 "roll_time"). `queue_delay` and
    /// `queue_len` are needed for the same heuristics `checkRollTime` uses.
    pub fn try_roll(&self, queue_delay_secs: u32, queue_len: usize) -> Option<WorkUnit> {
        if self.maxtime <= self.timestamp() || self.is_stale() {
            return None;
        }
        let remaining =
            (self.downloaded + std::time::Duration::from_secs(self.lifetime_secs as u64))
                .saturating_duration_since(Instant::now());
        let remaining_secs = remaining.as_secs() as u32;
        let worth_rolling = remaining_secs > queue_delay_secs || queue_len < 1;
        if !worth_rolling {
            return None;
        }
        if self.downloaded.elapsed().as_secs() >= 300 {
            return None;
        }

        let mut data = self.data;
        hash::set_header_timestamp(&mut data, self.timestamp() + 1);
        let mut first64 = [0u8; 64];
        first64.copy_from_slice(&data[..64]);

        Some(WorkUnit {
            data,
            target: self.target,
            identifier: self.identifier.clone(),
            midstate: hash::midstate(&first64),
            nonces: self.nonces,
            base: AtomicU64::new(0),
            is_stale: AtomicBool::new(false),
            lifetime_secs: self.lifetime_secs,
            maxtime: self.maxtime,
            downloaded: self.downloaded,
            callbacks: Mutex::new(Vec::new()),
        })
    }
}

/// The base/size a `NonceRange` was carved with, before it's wrapped with
/// an `Arc` back to its originating unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceRangeSpec {
    pub base: u64,
    pub size: u64,
}

/// A contiguous slice of nonces from one `WorkUnit`, handed to a kernel for
/// a single execution pass. Carries no behavior of its own — kernels pull
/// `unit.data`/`unit.midstate`/`unit.target` out of it directly.
#[derive(Debug, Clone)]
pub struct NonceRange {
    pub unit: std::sync::Arc<WorkUnit>,
    pub base: u64,
    pub size: u64,
}

impl NonceRange {
    pub fn new(unit: std::sync::Arc<WorkUnit>, spec: NonceRangeSpec) -> Self {
        Self {
            unit,
            base: spec.base,
            size: spec.size,
        }
    }
}

/// The 128-byte payload sent back to a pool for a candidate solution (§3,
/// §6): header bytes 0..68, the timestamp actually used, header bytes
/// 72..76, the little-endian nonce, then 48 zero bytes the protocol
/// reserves but neither side inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub payload: [u8; 128],
}

impl Submission {
    pub fn new(unit: &WorkUnit, timestamp: u32, nonce: u32) -> Self {
        Self {
            payload: hash::build_submission(&unit.data, timestamp, nonce),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.payload)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn header(byte0: u8) -> [u8; 80] {
        let mut h = [0u8; 80];
        h[0] = byte0;
        h
    }

    fn aw(identifier: u8) -> AssignedWork {
        let mut work = AssignedWork::new(header(1), [0xffu8; 32], vec![identifier; 32]);
        work.nonces = Some(100);
        work
    }

    #[test]
    fn take_range_carves_sequential_non_overlapping_spans() {
        let unit = WorkUnit::new(&aw(1));
        let (r1, depleted1) = unit.take_range(40);
        let (r2, depleted2) = unit.take_range(40);
        let (r3, depleted3) = unit.take_range(40);

        assert_eq!(r1, NonceRangeSpec { base: 0, size: 40 });
        assert_eq!(r2, NonceRangeSpec { base: 40, size: 40 });
        // only 20 nonces left for the third request
        assert_eq!(r3, NonceRangeSpec { base: 80, size: 20 });
        assert!(!depleted1);
        assert!(!depleted2);
        assert!(depleted3);
        assert_eq!(unit.nonces_left(), 0);
    }

    #[test]
    fn take_range_exact_fit_reports_depleted() {
        let unit = WorkUnit::new(&aw(1));
        let (r, depleted) = unit.take_range(100);
        assert_eq!(r, NonceRangeSpec { base: 0, size: 100 });
        assert!(depleted);
    }

    #[test]
    fn mark_stale_is_idempotent_and_runs_callbacks_once() {
        let unit = WorkUnit::new(&aw(1));
        let count = std::sync::Arc::new(AtomicU64::new(0));

        let c = count.clone();
        unit.on_stale(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        unit.mark_stale();
        unit.mark_stale();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_stale_after_already_stale_runs_immediately() {
        let unit = WorkUnit::new(&aw(1));
        unit.mark_stale();

        let count = std::sync::Arc::new(AtomicU64::new(0));
        let c = count.clone();
        unit.on_stale(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mask_and_explicit_nonces_are_mutually_exclusive() {
        let mut work = AssignedWork::new(header(1), [0u8; 32], vec![1; 32]);
        work.mask = Some(4);
        assert_eq!(work.nonce_count(), 16);

        work.mask = None;
        work.nonces = Some(7);
        assert_eq!(work.nonce_count(), 7);
    }

    #[test]
    fn set_max_time_increment_derives_absolute_maxtime() {
        let mut data = header(1);
        hash::set_header_timestamp(&mut data, 1_000);
        let mut work = AssignedWork::new(data, [0u8; 32], vec![1; 32]);
        work.set_max_time_increment(30);
        assert_eq!(work.time, 30);
        assert_eq!(work.maxtime, 1_030);
    }
}
