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

//! Error taxonomy for the work coordination core.
//!
//! Mirrors the domains laid out in the design: transient network failures
//! and malformed peer messages never escape the coordination thread as
//! panics or process aborts, they become `Event`s. The types here exist for
//! the handful of places that truly need a `Result` (config loading, queue
//! invariants, kernel option validation) rather than an event callback.

use thiserror::Error;

/// Failures that can occur while talking to a pool server, for either
/// protocol dialect. Callers generally downgrade these into
/// `client::Event::Failure` rather than propagating them.
#[derive(Debug, Error)]
pub enum Client {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("server returned an error: {0}")]
    Server(String),

    #[error("client is not connected")]
    NotConnected,

    #[error("malformed URL: {0}")]
    Url(String),
}

/// Internal invariant violations in `WorkQueue`/`NonceRange` bookkeeping.
/// These indicate a bug in the core itself, not a misbehaving peer.
#[derive(Debug, Error)]
pub enum Queue {
    #[error("requested nonce range exceeds remaining nonces in work unit")]
    RangeExceedsUnit,

    #[error("work unit is missing required fields (data/target/midstate/nonces)")]
    IncompleteUnit,
}

/// A kernel's init or runtime reported a condition it cannot continue
/// operating under (§7 `KernelFatal`/`ConfigInvalid`).
#[derive(Debug, Error)]
pub enum Kernel {
    #[error("required option '{0}' not provided")]
    MissingOption(String),

    #[error("option '{0}' has the wrong type, expected {1}")]
    WrongOptionType(String, &'static str),

    #[error("kernel reported a fatal error: {0}")]
    Fatal(String),
}

/// Process-level configuration problems.
#[derive(Debug, Error)]
pub enum Config {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, Client>;
