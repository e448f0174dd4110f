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

//! `ProtocolClient`: the contract both pool dialects implement (§4.2), the
//! `Event` stream they report through, and the submission dedup map that
//! keeps a retried `send_result` call from hitting the wire twice for the
//! same payload.
//!
//! Grounded on phoenix2's `backend/ClientBase.py` (the `runCallback`
//! dispatch this crate turns into `Event`s) and `MMPClient.sendResult`'s
//! `deferreds` dict (the payload-keyed dedup here).

pub mod polling;
pub mod streaming;

use crate::work::{AssignedWork, Submission};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Everything a `ProtocolClient` reports back to the coordination thread.
/// Mirrors the set of `runCallback` names in `ClientBase`
/// (`connect`/`disconnect`/`failure`/`msg`/`block`/`work`/`push`/
/// `longpoll`/`debug`).
#[derive(Debug, Clone)]
pub enum Event {
    Connect,
    Disconnect,
    /// A connection attempt failed outright (never got as far as a login).
    Failure,
    /// A human-readable message from the server (MMP's `MSG`, an RPC
    /// `error.message`).
    Msg(String),
    /// The server-reported block height changed.
    Block(u64),
    /// New work, pushed unsolicited by a long-poll or `WORK` line.
    Push(AssignedWork),
    /// New work, however it arrived (every `Push` is also followed by a
    /// plain `Work`, matching `handleWork`'s unconditional
    /// `runCallback('work', ...)`).
    Work(AssignedWork),
    /// Long-poll side channel toggled on (`true`) or off (`false`).
    LongPoll(bool),
    Debug(String),
}

/// A `set_meta` value: the streaming dialect renders these differently on
/// the wire (`sendMeta`'s `colon = '' if isinstance(value, int) else ':'`
/// — integers go out bare, everything else gets the `:`-prefixed verbatim
/// form), so the distinction has to survive past the trait boundary rather
/// than collapsing to a plain `String` at the call site.
#[derive(Debug, Clone)]
pub enum MetaValue {
    Int(i64),
    Str(String),
}

impl std::fmt::Display for MetaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetaValue::Int(n) => write!(f, "{}", n),
            MetaValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for MetaValue {
    fn from(n: i64) -> Self {
        MetaValue::Int(n)
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Str(s)
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Str(s.to_string())
    }
}

/// The operations `WorkQueue`'s coordinator and the kernel manager drive a
/// pool connection through. Each dialect (`StreamingClient`, `PollingClient`)
/// implements this against its own wire format.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Starts (or restarts) the connection, streaming `Event`s to `events`
    /// until `disconnect` is called. Implementations own their own
    /// reconnect policy.
    fn connect(self: Arc<Self>, events: mpsc::UnboundedSender<Event>);

    /// Tears the connection down; the client should not be reused.
    fn disconnect(&self);

    /// Asks the server for more work right now, if connected.
    fn request_work(&self);

    /// Submits a solved nonce, returning whether the server accepted it.
    async fn send_result(&self, submission: Submission) -> bool;

    fn set_meta(&self, var: &str, value: MetaValue);

    /// Tells the server this client's identity (§C.1): each dialect
    /// encodes this differently (streaming sends it as connection
    /// metadata, polling folds it into the HTTP User-Agent), but both
    /// build the string the same way — see `build_version_string`.
    fn set_version(
        &self,
        shortname: &str,
        longname: Option<&str>,
        version: Option<&str>,
        author: Option<&str>,
    );
}

/// Builds `<name> <version> by <author>`, matching phoenix2's
/// `ClientBase.setVersion`: a bare version number gets a `v` prefix
/// unless it already starts with `v` or `r` (revision builds use `r`).
pub fn build_version_string(
    shortname: &str,
    longname: Option<&str>,
    version: Option<&str>,
    author: Option<&str>,
) -> String {
    let mut vstr = longname.unwrap_or(shortname).to_string();

    if let Some(version) = version {
        let version = if version.starts_with('v') || version.starts_with('r') {
            version.to_string()
        } else {
            format!("v{}", version)
        };
        vstr.push(' ');
        vstr.push_str(&version);
    }

    if let Some(author) = author {
        vstr.push_str(" by ");
        vstr.push_str(author);
    }

    vstr
}

/// Deduplicates concurrent `send_result` calls for byte-identical
/// submissions: the first caller for a given payload actually talks to
/// the server; anyone else asking about the same payload before that
/// resolves just waits on the outcome.
#[derive(Default)]
pub struct PendingSubmissions {
    pending: Mutex<HashMap<[u8; 128], Vec<oneshot::Sender<bool>>>>,
}

pub enum SubmitSlot {
    /// No submission with this payload is in flight; caller must actually
    /// send it, then await the receiver for the eventual accept/reject.
    Lead(oneshot::Receiver<bool>),
    /// Someone else is already submitting this exact payload; await this
    /// receiver instead of sending again.
    Follow(oneshot::Receiver<bool>),
}

impl PendingSubmissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, payload: [u8; 128]) -> SubmitSlot {
        let mut pending = self.pending.lock().await;
        let (tx, rx) = oneshot::channel();
        match pending.get_mut(&payload) {
            Some(waiters) => {
                waiters.push(tx);
                SubmitSlot::Follow(rx)
            }
            None => {
                pending.insert(payload, vec![tx]);
                SubmitSlot::Lead(rx)
            }
        }
    }

    pub async fn resolve(&self, payload: &[u8; 128], accepted: bool) {
        let waiters = self.pending.lock().await.remove(payload);
        if let Some(waiters) = waiters {
            for tx in waiters {
                let _ = tx.send(accepted);
            }
        }
    }

    /// Resolves every outstanding submission to `false`, for a connection
    /// that dropped before any of them could be acked (§4.2, §5).
    pub async fn fail_all(&self) {
        let mut pending = self.pending.lock().await;
        for (_, waiters) in pending.drain() {
            for tx in waiters {
                let _ = tx.send(false);
            }
        }
    }

    /// Synchronous variant for callers (e.g. `disconnect`) that only have
    /// `&self` and cannot await; best-effort, same as `try_send_line`'s
    /// non-blocking fallback.
    pub fn fail_all_blocking(&self) {
        if let Ok(mut pending) = self.pending.try_lock() {
            for (_, waiters) in pending.drain() {
                for tx in waiters {
                    let _ = tx.send(false);
                }
            }
        }
    }
}
