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

//! Sliding-window hash rate aggregation (§4.6), grounded on phoenix2's
//! `KernelInterface.updateRate`/`getRate`: each bucket (a kernel may report
//! more than one, e.g. one per GPU compute unit) keeps the last
//! `ratesamples` measurements and contributes its average to the total.

use std::collections::HashMap;
use std::sync::Mutex;

const DEFAULT_SAMPLES: usize = 10;

#[derive(Debug)]
pub struct RateTracker {
    samples: usize,
    buckets: Mutex<HashMap<Option<usize>, Vec<f64>>>,
}

impl RateTracker {
    pub fn new(samples: usize) -> Self {
        Self {
            samples: samples.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Records one rate sample (Khash/s) for `bucket` (`None` for kernels
    /// that report a single aggregate rate), trimming to the configured
    /// window.
    pub fn update(&self, khps: f64, bucket: Option<usize>) {
        let mut buckets = self.buckets.lock().expect("rate tracker poisoned");
        let entry = buckets.entry(bucket).or_default();
        entry.push(khps);
        let len = entry.len();
        if len > self.samples {
            entry.drain(0..len - self.samples);
        }
    }

    /// Sums each bucket's running average (`getRate`).
    pub fn total(&self) -> f64 {
        let buckets = self.buckets.lock().expect("rate tracker poisoned");
        buckets
            .values()
            .map(|samples| samples.iter().sum::<f64>() / samples.len() as f64)
            .sum()
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLES)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_bucket_averages_its_samples() {
        let tracker = RateTracker::new(3);
        tracker.update(10.0, None);
        tracker.update(20.0, None);
        tracker.update(30.0, None);
        assert_eq!(tracker.total(), 20.0);
    }

    #[test]
    fn window_drops_oldest_samples_beyond_capacity() {
        let tracker = RateTracker::new(2);
        tracker.update(10.0, None);
        tracker.update(20.0, None);
        tracker.update(100.0, None);
        // the 10.0 sample should have fallen out of the window
        assert_eq!(tracker.total(), 60.0);
    }

    #[test]
    fn distinct_buckets_are_summed_independently() {
        let tracker = RateTracker::new(10);
        tracker.update(100.0, Some(0));
        tracker.update(200.0, Some(1));
        assert_eq!(tracker.total(), 300.0);
    }

    #[test]
    fn empty_tracker_reports_zero() {
        let tracker = RateTracker::default();
        assert_eq!(tracker.total(), 0.0);
    }
}
