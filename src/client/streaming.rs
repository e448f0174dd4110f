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

//! `StreamingClient`: the line-protocol pool dialect (§4.3, §6), grounded
//! on phoenix2's `backend/MMPProtocol.py`.
//!
//! IRC-style framing over a persistent CRLF-delimited TCP connection:
//! space-separated arguments, with an optional final `:`-prefixed argument
//! that may itself contain spaces. Outbound: `LOGIN`, `META`, `RESULT`,
//! `MORE`. Inbound: `MSG`, `TARGET`, `WORK`, `BLOCK`, `ACCEPTED`,
//! `REJECTED`, `TIME`. Reconnects with exponential backoff starting at
//! 200ms, capped at 60s, reset the first time a `WORK` line arrives (the
//! server having accepted our login).

use crate::client::{build_version_string, Event, MetaValue, PendingSubmissions, ProtocolClient, SubmitSlot};
use crate::work::{AssignedWork, Submission};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

const INITIAL_DELAY: Duration = Duration::from_millis(200);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Default target before the server's first `TARGET` line: `0xff * 28`
/// followed by four zero bytes, matching `MMPClientProtocol.target`.
fn default_target() -> [u8; 32] {
    let mut t = [0xffu8; 32];
    t[28..].fill(0);
    t
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

struct ConnState {
    outbound: mpsc::UnboundedSender<String>,
    meta_sent: bool,
}

/// Renders a `META` line's value per `sendMeta`'s convention: integers go
/// out bare, everything else gets the `:`-prefixed verbatim form.
fn render_meta_line(var: &str, value: &MetaValue) -> String {
    match value {
        MetaValue::Int(n) => format!("META {} {}", var, n),
        MetaValue::Str(s) => format!("META {} :{}", var, s),
    }
}

pub struct StreamingClient {
    config: StreamingConfig,
    meta: std::sync::Mutex<HashMap<String, MetaValue>>,
    target: Mutex<[u8; 32]>,
    server_time: Mutex<u32>,
    pending: PendingSubmissions,
    conn: Mutex<Option<ConnState>>,
    shutting_down: Arc<AtomicBool>,
    /// Set by `handle_line` the moment a `WORK` line arrives (the server has
    /// accepted our login); `run_loop` reads it after `run_once` returns to
    /// decide whether to reset the backoff delay instead of doubling it.
    seen_work: Arc<AtomicBool>,
}

impl StreamingClient {
    pub fn new(config: StreamingConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            meta: std::sync::Mutex::new(HashMap::new()),
            target: Mutex::new(default_target()),
            server_time: Mutex::new(0),
            pending: PendingSubmissions::new(),
            conn: Mutex::new(None),
            shutting_down: Arc::new(AtomicBool::new(false)),
            seen_work: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn send_line(&self, line: String) -> bool {
        let conn = self.conn.lock().await;
        match conn.as_ref() {
            Some(c) => c.outbound.send(line).is_ok(),
            None => false,
        }
    }

    /// Non-blocking best-effort send, for callers that only have `&self`
    /// (the `ProtocolClient` trait's synchronous methods). Silently drops
    /// the line if the connection mutex is momentarily held elsewhere or
    /// no connection is live; `META` lines are also replayed in full on
    /// every `connect`, so a dropped one here is never lost for good.
    fn try_send_line(&self, line: String) -> bool {
        match self.conn.try_lock() {
            Ok(conn) => match conn.as_ref() {
                Some(c) => c.outbound.send(line).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }

    fn run_loop(self: Arc<Self>, events: mpsc::UnboundedSender<Event>) {
        tokio::spawn(async move {
            let mut delay = INITIAL_DELAY;
            loop {
                if self.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                match self.run_once(&events).await {
                    Ok(()) => {}
                    Err(_) => {
                        *self.conn.lock().await = None;
                        self.pending.fail_all().await;
                        let _ = events.send(Event::Failure);
                    }
                }
                if self.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                if self.seen_work.swap(false, Ordering::SeqCst) {
                    delay = INITIAL_DELAY;
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        });
    }

    async fn run_once(self: &Arc<Self>, events: &mpsc::UnboundedSender<Event>) -> std::io::Result<()> {
        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.conn.lock().await = Some(ConnState {
            outbound: tx,
            meta_sent: false,
        });

        let _ = events.send(Event::Connect);

        write_half
            .write_all(format!("LOGIN {} :{}\r\n", self.config.username, self.config.password).as_bytes())
            .await?;

        {
            let meta = self.meta.lock().expect("meta lock poisoned").clone();
            for (var, value) in meta.iter() {
                let mut line = render_meta_line(var, value);
                line.push_str("\r\n");
                write_half.write_all(line.as_bytes()).await?;
            }
        }
        if let Some(conn) = self.conn.lock().await.as_mut() {
            conn.meta_sent = true;
        }

        let mut line = String::new();

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(l) => {
                            write_half.write_all(l.as_bytes()).await?;
                            write_half.write_all(b"\r\n").await?;
                        }
                        None => return Ok(()),
                    }
                }
                n = reader.read_line(&mut line) => {
                    let n = n?;
                    if n == 0 {
                        break; // EOF
                    }
                    let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                    line.clear();
                    self.handle_line(&trimmed, events).await;
                }
            }
        }

        *self.conn.lock().await = None;
        self.pending.fail_all().await;
        let _ = events.send(Event::Disconnect);
        Ok(())
    }

    async fn handle_line(&self, line: &str, events: &mpsc::UnboundedSender<Event>) {
        let (cmd, args) = parse_line(line);

        match cmd.as_str() {
            "MSG" => {
                if let Some(msg) = args.first() {
                    let _ = events.send(Event::Msg(msg.clone()));
                }
            }
            "TARGET" => {
                if let Some(hex_target) = args.first() {
                    if let Ok(bytes) = hex::decode(hex_target) {
                        if bytes.len() == 32 {
                            let mut t = [0u8; 32];
                            t.copy_from_slice(&bytes);
                            *self.target.lock().await = t;
                        }
                    }
                }
            }
            "TIME" => {
                if let Some(t) = args.first().and_then(|s| s.parse::<u32>().ok()) {
                    *self.server_time.lock().await = t;
                }
            }
            "WORK" => {
                if args.len() != 2 {
                    return;
                }
                let data_hex = &args[0];
                let mask: Option<u8> = args[1].parse().ok();
                let (data_hex, mask) = match mask {
                    Some(m) => (data_hex, m),
                    None => return,
                };
                let Ok(data_bytes) = hex::decode(data_hex) else {
                    return;
                };
                if data_bytes.len() != 80 {
                    return;
                }
                let mut data = [0u8; 80];
                data.copy_from_slice(&data_bytes);

                let target = *self.target.lock().await;
                let server_time = *self.server_time.lock().await;

                let mut aw = AssignedWork::new(data, target, data[4..36].to_vec());
                aw.mask = Some(mask);
                aw.set_max_time_increment(server_time);

                let _ = events.send(Event::Work(aw));

                // the server has accepted our login; next reconnect should
                // retry promptly, not at the backed-off delay
                self.seen_work.store(true, Ordering::SeqCst);
            }
            "BLOCK" => {
                if let Some(b) = args.first().and_then(|s| s.parse::<u64>().ok()) {
                    let _ = events.send(Event::Block(b));
                }
            }
            "ACCEPTED" => {
                if let Some(hexdata) = args.first() {
                    self.resolve_result(hexdata, true).await;
                }
            }
            "REJECTED" => {
                if let Some(hexdata) = args.first() {
                    self.resolve_result(hexdata, false).await;
                }
            }
            _ => {
                let _ = events.send(Event::Debug(format!("unhandled command: {}", cmd)));
            }
        }
    }

    async fn resolve_result(&self, hexdata: &str, accepted: bool) {
        let Ok(bytes) = hex::decode(hexdata) else {
            return;
        };
        if bytes.len() != 128 {
            return;
        }
        let mut payload = [0u8; 128];
        payload.copy_from_slice(&bytes);
        self.pending.resolve(&payload, accepted).await;
    }
}

/// Splits an IRC-style line into `(command, args)`: space-separated,
/// with the final argument starting after the first ` :` allowed to
/// contain further spaces.
pub fn parse_line(line: &str) -> (String, Vec<String>) {
    let mut args: Vec<String> = if let Some(idx) = line.find(" :") {
        let (head, tail) = line.split_at(idx);
        let tail = &tail[2..];
        let mut parts: Vec<String> = head.split(' ').map(String::from).collect();
        parts.push(tail.to_string());
        parts
    } else {
        line.split(' ').map(String::from).collect()
    };

    if args.is_empty() {
        return (String::new(), Vec::new());
    }
    let cmd = args.remove(0);
    (cmd, args)
}

#[async_trait]
impl ProtocolClient for StreamingClient {
    fn connect(self: Arc<Self>, events: mpsc::UnboundedSender<Event>) {
        self.shutting_down.store(false, Ordering::SeqCst);
        self.run_loop(events);
    }

    fn disconnect(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(mut conn) = self.conn.try_lock() {
            *conn = None;
        }
        self.pending.fail_all_blocking();
    }

    fn request_work(&self) {
        self.try_send_line("MORE".to_string());
    }

    async fn send_result(&self, submission: Submission) -> bool {
        match self.pending.register(submission.payload).await {
            SubmitSlot::Follow(rx) => rx.await.unwrap_or(false),
            SubmitSlot::Lead(rx) => {
                if !self.send_line(format!("RESULT {}", submission.to_hex())).await {
                    self.pending.resolve(&submission.payload, false).await;
                    return false;
                }
                // resolved later by the matching ACCEPTED/REJECTED line.
                rx.await.unwrap_or(false)
            }
        }
    }

    fn set_meta(&self, var: &str, value: MetaValue) {
        // Stored locally and (re-)sent as a `META` line on every connect,
        // mirroring `MMPClient.setMeta`'s `self.meta[var] = value`; if a
        // connection is live we also push it immediately.
        let line = render_meta_line(var, &value);
        self.meta
            .lock()
            .expect("meta lock poisoned")
            .insert(var.to_string(), value);
        self.try_send_line(line);
    }

    fn set_version(
        &self,
        shortname: &str,
        longname: Option<&str>,
        version: Option<&str>,
        author: Option<&str>,
    ) {
        let vstr = build_version_string(shortname, longname, version, author);
        self.set_meta("version", MetaValue::Str(vstr));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_line_splits_space_separated_args() {
        let (cmd, args) = parse_line("WORK deadbeef 32");
        assert_eq!(cmd, "WORK");
        assert_eq!(args, vec!["deadbeef", "32"]);
    }

    #[test]
    fn parse_line_keeps_spaces_in_trailing_colon_argument() {
        let (cmd, args) = parse_line("MSG :new block found, good luck!");
        assert_eq!(cmd, "MSG");
        assert_eq!(args, vec!["new block found, good luck!"]);
    }

    #[test]
    fn parse_line_with_no_args() {
        let (cmd, args) = parse_line("MORE");
        assert_eq!(cmd, "MORE");
        assert!(args.is_empty());
    }

    #[test]
    fn default_target_matches_reference_layout() {
        let t = default_target();
        assert!(t[..28].iter().all(|&b| b == 0xff));
        assert!(t[28..].iter().all(|&b| b == 0));
    }
}
