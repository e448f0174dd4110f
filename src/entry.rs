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

//! Process entry point: wires a loaded `CoreConfig` into a running
//! `ProtocolClient` + `WorkQueue` + `KernelManager` graph and drives it
//! until a shutdown signal arrives. Kept separate from `main.rs` so it
//! stays testable without going through `std::process`/`clap` parsing,
//! the same split the teacher draws between its binary's `main` and the
//! library's `entry::main`.

use std::sync::Arc;

use tokio::sync::mpsc;
use url::Url;

use crate::client::polling::{PollingClient, PollingConfig};
use crate::client::streaming::{StreamingClient, StreamingConfig};
use crate::client::{Event, ProtocolClient};
use crate::config::{CoreConfig, PoolConfig};
use crate::error;
use crate::kernel::KernelManager;
use crate::work::queue::{QueueConfig, WorkQueue};

const SHORTNAME: &str = "orecore";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds the one `ProtocolClient` this process talks to, picking the
/// dialect from the pool URL's scheme: `mmp://` (or a bare `host:port`)
/// gets the persistent streaming protocol, `http://`/`https://` gets the
/// polling/getwork dialect.
fn build_client(pool: &PoolConfig) -> Result<Arc<dyn ProtocolClient>, error::Client> {
    if pool.url.starts_with("http://") || pool.url.starts_with("https://") {
        let url = Url::parse(&pool.url).map_err(|e| error::Client::Url(e.to_string()))?;
        let mut config = PollingConfig::new(url, pool.user.clone(), pool.pass.clone());
        if let Some(askrate) = pool.askrate {
            config.askrate = askrate;
        }
        if let Some(retryrate) = pool.retryrate {
            config.retryrate = retryrate;
        }
        if let Some(lpaskrate) = pool.lpaskrate {
            config.lpaskrate = lpaskrate;
        }
        if let Some(maxtime) = pool.maxtime {
            config.maxtime = maxtime.min(3600);
        }
        Ok(PollingClient::new(config))
    } else {
        let without_scheme = pool.url.splitn(2, "://").last().unwrap_or(&pool.url);
        let (host, port) = without_scheme
            .rsplit_once(':')
            .ok_or_else(|| error::Client::Url(format!("missing port in '{}'", pool.url)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| error::Client::Url(format!("invalid port in '{}'", pool.url)))?;
        Ok(StreamingClient::new(StreamingConfig {
            host: host.to_string(),
            port,
            username: pool.user.clone(),
            password: pool.pass.clone(),
        }))
    }
}

/// Drains `events` onto `queue`, forwarding work and logging everything
/// else. Runs until the client drops its sender (it never does today,
/// since clients reconnect internally, but a closed channel still ends
/// the loop cleanly rather than panicking).
async fn run_event_loop(
    mut events: mpsc::UnboundedReceiver<Event>,
    queue: Arc<WorkQueue<Arc<KernelManager>>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Connect => tracing::info!("connected"),
            Event::Disconnect => tracing::warn!("disconnected"),
            Event::Failure => tracing::warn!("connection attempt failed"),
            Event::Msg(msg) => tracing::info!(%msg, "server message"),
            Event::Block(height) => tracing::info!(height, "block changed"),
            Event::Push(work) | Event::Work(work) => queue.store_work(work).await,
            Event::LongPoll(on) => tracing::debug!(enabled = on, "long-poll channel"),
            Event::Debug(msg) => tracing::debug!(%msg),
        }
    }
}

/// Builds the full coordination graph for `config` and runs it until
/// `shutdown` resolves. No kernel types are registered here — drivers for
/// specific hardware are the caller's responsibility to register via
/// `KernelManager::register_kernel_type` before calling this, or
/// separately against the `Arc<KernelManager>` this returns.
pub async fn run(
    config: CoreConfig,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<Arc<KernelManager>, error::Client> {
    let pool = config
        .pools
        .first()
        .ok_or_else(|| error::Client::Connect("no pool configured".to_string()))?;

    let client = build_client(pool)?;
    client.set_version(SHORTNAME, Some("Orecore"), Some(VERSION), None);

    let manager = KernelManager::new(Arc::clone(&client));

    let queue = WorkQueue::new(
        QueueConfig {
            queue_size: config.queue_size,
            queue_delay_secs: config.queue_delay,
        },
        Arc::clone(&manager),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    Arc::clone(&client).connect(tx);

    let event_task = tokio::spawn(run_event_loop(rx, queue));

    shutdown.await;
    tracing::info!("shutting down");
    client.disconnect();
    manager.stop_all();
    event_task.abort();

    Ok(manager)
}
