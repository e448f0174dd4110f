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

//! Shared test fixtures (SPEC_FULL §B.4): a handful of synthetic but
//! internally consistent block headers, in the same spirit as the
//! teacher's `TEST_BLOCKS` — enough to drive `hash`, `work` and the
//! protocol clients' tests without each one hand-rolling header bytes.

use crate::hash::{self, Digest};

/// An 80-byte header with a deterministic, non-trivial byte pattern (not a
/// real block) plus the target/identifier a `WorkUnit` would be built
/// from. Useful wherever a test needs "some valid-shaped header" rather
/// than a specific block's bytes.
pub struct TestHeader {
    pub data: [u8; 80],
    pub target: Digest,
}

impl TestHeader {
    pub fn new(seed: u8) -> Self {
        let mut data = [0u8; 80];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31).wrapping_add(seed);
        }
        hash::set_header_timestamp(&mut data, 1_700_000_000);

        let mut target = [0xffu8; 32];
        target[28..].fill(0);

        Self { data, target }
    }

    pub fn identifier(&self) -> Vec<u8> {
        self.data[4..36].to_vec()
    }

    pub fn midstate(&self) -> hash::Midstate {
        let mut first64 = [0u8; 64];
        first64.copy_from_slice(&self.data[..64]);
        hash::midstate(&first64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distinct_seeds_produce_distinct_headers_and_midstates() {
        let a = TestHeader::new(1);
        let b = TestHeader::new(2);
        assert_ne!(a.data, b.data);
        assert_ne!(a.midstate(), b.midstate());
    }

    #[test]
    fn identifier_is_header_bytes_4_to_36() {
        let h = TestHeader::new(7);
        assert_eq!(h.identifier(), h.data[4..36].to_vec());
    }
}
