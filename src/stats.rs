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

//! Ambient aggregate statistics surface (SPEC_FULL §B): `spec.md` names
//! the console renderer and admin JSON-RPC server as external
//! collaborators without specifying their wire formats, but something
//! inside the core has to hold the numbers they'd report — accepted,
//! rejected and stale-dropped submission counts, process uptime. This is
//! that something: a small set of atomics `KernelManager` updates as
//! submissions resolve, readable as an immutable snapshot from any thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide submission accounting. Cheap to update from any thread;
/// `snapshot()` is the only allocation.
#[derive(Debug)]
pub struct CoreStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    stale_dropped: AtomicU64,
    started_at: Instant,
}

impl Default for CoreStats {
    fn default() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            stale_dropped: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

impl CoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of a submission that actually reached the wire
    /// (§4.6 `found_nonce`'s ack).
    pub fn record_submission(&self, accepted: bool) {
        if accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a solution dropped without submission because its unit was
    /// stale and `submit_old` wasn't set (§7 `StaleWork`).
    pub fn record_stale_drop(&self) {
        self.stale_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Point-in-time read of `CoreStats`, cheap to clone and serialize for
/// whatever status surface (console renderer, admin RPC) ends up
/// reporting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub stale_dropped: u64,
    pub uptime_secs: u64,
}

impl Snapshot {
    /// Fraction of resolved submissions (accepted + rejected) that were
    /// accepted; `1.0` when nothing has resolved yet (nothing to be wrong
    /// about).
    pub fn accept_ratio(&self) -> f64 {
        let resolved = self.accepted + self.rejected;
        if resolved == 0 {
            1.0
        } else {
            self.accepted as f64 / resolved as f64
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counts_accumulate_independently() {
        let stats = CoreStats::new();
        stats.record_submission(true);
        stats.record_submission(true);
        stats.record_submission(false);
        stats.record_stale_drop();

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.stale_dropped, 1);
    }

    #[test]
    fn accept_ratio_ignores_stale_drops_and_handles_no_data() {
        let stats = CoreStats::new();
        assert_eq!(stats.snapshot().accept_ratio(), 1.0);

        stats.record_submission(true);
        stats.record_submission(false);
        stats.record_submission(false);
        assert!((stats.snapshot().accept_ratio() - (1.0 / 3.0)).abs() < 1e-9);
    }
}
