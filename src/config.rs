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

//! Process-level configuration surface (SPEC_FULL §B.3): `spec.md` treats
//! the config-file parser as an external collaborator but doesn't specify
//! its shape. This follows the teacher's `bosminer-config` split: a
//! `serde`-derived file descriptor plus a `clap` CLI layer for overrides,
//! loaded once at startup and handed down to `WorkQueue`, the protocol
//! clients, and `KernelManager`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::error;

pub const DEFAULT_QUEUE_SIZE: usize = 1;
pub const DEFAULT_QUEUE_DELAY_SECS: u32 = 5;
pub const DEFAULT_RATESAMPLES: usize = 10;

/// One pool connection descriptor. `dialect` picks which `ProtocolClient`
/// implementation handles `url`; left unspecified, it's inferred from the
/// URL scheme (`mmp://` → streaming, `http(s)://` → polling), mirroring how
/// phoenix2's connection strings carry their own dialect.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    /// Whether a stale unit's solution should still be submitted
    /// (`core.connection.submitold`).
    #[serde(default)]
    pub submit_old: bool,
    /// Polling-dialect-only overrides; ignored by the streaming dialect.
    #[serde(default)]
    pub askrate: Option<u64>,
    #[serde(default)]
    pub retryrate: Option<u64>,
    #[serde(default)]
    pub lpaskrate: Option<u64>,
    #[serde(default)]
    pub maxtime: Option<u32>,
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_queue_delay() -> u32 {
    DEFAULT_QUEUE_DELAY_SECS
}

fn default_ratesamples() -> usize {
    DEFAULT_RATESAMPLES
}

/// Top-level descriptor loaded from an optional TOML file. Only the
/// `[[pools]]` entry list is required; every other field defaults to the
/// values named throughout §4 of the specification.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default, rename = "pool", alias = "pools")]
    pub pools: Vec<PoolConfig>,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_queue_delay")]
    pub queue_delay: u32,
    #[serde(default = "default_ratesamples")]
    pub ratesamples: usize,
    /// Per-device option maps handed to `kernel::Options`, keyed by the
    /// lowercase `<type>:<index>` device id (or a kernel family name for
    /// options shared across every device of that type).
    #[serde(default)]
    pub kernels: HashMap<String, HashMap<String, String>>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            queue_size: DEFAULT_QUEUE_SIZE,
            queue_delay: DEFAULT_QUEUE_DELAY_SECS,
            ratesamples: DEFAULT_RATESAMPLES,
            kernels: HashMap::new(),
        }
    }
}

impl CoreConfig {
    /// Reads and parses a TOML config file (`error::Config::Read`/`Parse`
    /// on failure).
    pub fn load(path: &Path) -> Result<Self, error::Config> {
        let text = std::fs::read_to_string(path).map_err(|source| error::Config::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| error::Config::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Applies the CLI's pool-URL override, if any, by prepending a pool
    /// built from it (so it takes priority over whatever's in the file).
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(url) = &cli.pool_url {
            self.pools.insert(
                0,
                PoolConfig {
                    url: url.clone(),
                    user: cli.pool_user.clone().unwrap_or_default(),
                    pass: cli.pool_pass.clone().unwrap_or_default(),
                    submit_old: cli.submit_old,
                    askrate: None,
                    retryrate: None,
                    lpaskrate: None,
                    maxtime: None,
                },
            );
        }
    }
}

/// Process-level overrides, mirroring the split `bosminer`'s backends use
/// when they extend the shared `clap` parser with their own arguments.
#[derive(Debug, Parser)]
#[command(name = "orecore", about = "Bitcoin mining work-coordination core")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Pool connection string, overriding (and taking priority over) any
    /// `[[pool]]` entries in the config file.
    #[arg(long = "pool")]
    pub pool_url: Option<String>,

    #[arg(long = "user", requires = "pool_url")]
    pub pool_user: Option<String>,

    #[arg(long = "pass", requires = "pool_url")]
    pub pool_pass: Option<String>,

    /// Submit solutions found on work that has since gone stale.
    #[arg(long)]
    pub submit_old: bool,

    /// Increase log verbosity; repeatable (`-v`, `-vv`, ...).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
