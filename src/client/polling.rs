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

//! `PollingClient`: the JSON-RPC 1.0 getwork pool dialect (§4.4, §6),
//! grounded on phoenix2's `backend/RPCProtocol.py`.
//!
//! A plain HTTP `getwork` call on a fixed interval (`askrate`, falling back
//! to `retryrate` after a failure), plus an optional long-poll side channel
//! the server advertises via an `X-Long-Polling` response header: a second
//! request against that URL that simply blocks server-side until new work
//! exists or ~600s elapse.

use crate::client::{build_version_string, Event, MetaValue, PendingSubmissions, ProtocolClient, SubmitSlot};
use crate::work::{AssignedWork, Submission};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use url::Url;

const DEFAULT_ASKRATE: u64 = 10;
const DEFAULT_RETRYRATE: u64 = 15;
const DEFAULT_LPASKRATE: u64 = 0;
const DEFAULT_MAXTIME: u32 = 60;
const LONGPOLL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub url: Url,
    pub username: String,
    pub password: String,
    /// Seconds between polls while everything is healthy.
    pub askrate: u64,
    /// Seconds between polls after a failed request.
    pub retryrate: u64,
    /// Seconds between polls while a long-poll channel is active (usually
    /// 0, meaning "don't also short-poll").
    pub lpaskrate: u64,
    /// Maximum seconds a unit's timestamp may be rolled forward, clamped
    /// to `[0, 3600]` like `RPCClient.setupMaxtime`.
    pub maxtime: u32,
}

impl PollingConfig {
    pub fn new(url: Url, username: String, password: String) -> Self {
        Self {
            url,
            username,
            password,
            askrate: DEFAULT_ASKRATE,
            retryrate: DEFAULT_RETRYRATE,
            lpaskrate: DEFAULT_LPASKRATE,
            maxtime: DEFAULT_MAXTIME.min(3600),
        }
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'static str,
    params: Vec<&'a str>,
    id: u32,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    message: Option<String>,
}

struct State {
    interval: Mutex<Duration>,
    block: Mutex<Option<u64>>,
    said_connected: AtomicBool,
    longpoll_url: Mutex<Option<Url>>,
    longpoll_generation: AtomicU64,
    /// Set while a long-poll channel is active and `lpaskrate == 0`: the
    /// periodic `ask()` call is fully suppressed rather than left running
    /// at its previous cadence (`useAskrate`'s `askCall = None`).
    periodic_poll_disabled: AtomicBool,
    version: std::sync::Mutex<String>,
    /// The event sender handed to `connect`, kept around so `send_result`
    /// (which only has `&self`) can still surface an `X-Reject-Reason` as
    /// `Event::Debug` on a rejected submission.
    events: Mutex<Option<mpsc::UnboundedSender<Event>>>,
}

pub struct PollingClient {
    config: PollingConfig,
    http: reqwest::Client,
    state: State,
    pending: PendingSubmissions,
    wake: Notify,
    running: Arc<AtomicBool>,
}

impl PollingClient {
    pub fn new(config: PollingConfig) -> Arc<Self> {
        let askrate = config.askrate;
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            state: State {
                interval: Mutex::new(Duration::from_secs(askrate)),
                block: Mutex::new(None),
                said_connected: AtomicBool::new(false),
                longpoll_url: Mutex::new(None),
                longpoll_generation: AtomicU64::new(0),
                periodic_poll_disabled: AtomicBool::new(false),
                version: std::sync::Mutex::new("RPCClient/2.0".to_string()),
                events: Mutex::new(None),
            },
            pending: PendingSubmissions::new(),
            wake: Notify::new(),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    fn run_loop(self: Arc<Self>, events: mpsc::UnboundedSender<Event>) {
        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            *self.state.events.lock().await = Some(events.clone());
            loop {
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
                if !self.state.periodic_poll_disabled.load(Ordering::SeqCst) {
                    self.ask(&events).await;
                }
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
                if self.state.periodic_poll_disabled.load(Ordering::SeqCst) {
                    self.wake.notified().await;
                } else {
                    let interval = *self.state.interval.lock().await;
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = self.wake.notified() => {}
                    }
                }
            }
        });
    }

    async fn call(&self, method: &'static str, params: Vec<&str>) -> Result<(Value, HeaderMap), String> {
        let body = RpcRequest { method, params, id: 1 };
        let resp = self
            .http
            .post(self.config.url.clone())
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header(
                "User-Agent",
                self.state.version.lock().expect("version lock poisoned").clone(),
            )
            .header("X-Work-Identifier", "1")
            .header("X-Mining-Extensions", "midstate rollntime")
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let headers = resp.headers().clone();
        let parsed: RpcResponse = resp.json().await.map_err(|e| e.to_string())?;

        if let Some(err) = parsed.error {
            return Err(err.message.unwrap_or_else(|| "server error".to_string()));
        }
        parsed.result.map(|v| (v, headers)).ok_or_else(|| "empty result".to_string())
    }

    async fn ask(self: &Arc<Self>, events: &mpsc::UnboundedSender<Event>) {
        match self.call("getwork", Vec::new()).await {
            Ok((result, headers)) => self.handle_work(result, &headers, false, events).await,
            Err(msg) => {
                let _ = events.send(Event::Msg(msg));
                self.on_failure(events).await;
            }
        }
    }

    async fn on_failure(&self, events: &mpsc::UnboundedSender<Event>) {
        if self.state.said_connected.swap(false, Ordering::SeqCst) {
            let _ = events.send(Event::Disconnect);
        } else {
            let _ = events.send(Event::Failure);
        }
        self.state.periodic_poll_disabled.store(false, Ordering::SeqCst);
        *self.state.interval.lock().await = Duration::from_secs(self.config.retryrate);
        self.stop_longpoll();
        let _ = events.send(Event::LongPoll(false));
    }

    async fn handle_work(
        self: &Arc<Self>,
        result: Value,
        headers: &HeaderMap,
        pushed: bool,
        events: &mpsc::UnboundedSender<Event>,
    ) {
        let Some(data_hex) = result.get("data").and_then(|v| v.as_str()) else {
            return;
        };
        let Ok(data_bytes) = hex::decode(data_hex) else {
            return;
        };
        if data_bytes.len() < 80 {
            return;
        }
        let mut data = [0u8; 80];
        data.copy_from_slice(&data_bytes[..80]);

        let target = match result.get("target").and_then(|v| v.as_str()) {
            Some(hex_target) => match hex::decode(hex_target) {
                Ok(bytes) if bytes.len() == 32 => {
                    let mut t = [0u8; 32];
                    t.copy_from_slice(&bytes);
                    t
                }
                _ => return,
            },
            None => return,
        };

        let mask = result.get("mask").and_then(|v| v.as_u64()).unwrap_or(32) as u8;

        let maxtime = parse_roll_ntime(headers, self.config.maxtime).min(self.config.maxtime);

        if !self.state.said_connected.swap(true, Ordering::SeqCst) {
            let _ = events.send(Event::Connect);
            *self.state.interval.lock().await = Duration::from_secs(self.config.askrate);
        }

        self.handle_headers(headers, events).await;

        let identifier = result
            .get("identifier")
            .and_then(|v| v.as_str())
            .map(|s| s.as_bytes().to_vec())
            .unwrap_or_else(|| data[4..36].to_vec());

        let mut aw = AssignedWork::new(data, target, identifier);
        aw.mask = Some(mask);
        aw.set_max_time_increment(maxtime);

        if pushed {
            let _ = events.send(Event::Push(aw.clone()));
        }
        let _ = events.send(Event::Work(aw));
    }

    async fn handle_headers(self: &Arc<Self>, headers: &HeaderMap, events: &mpsc::UnboundedSender<Event>) {
        if let Some(blocknum) = headers
            .get("x-blocknum")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
        {
            let mut block = self.state.block.lock().await;
            if *block != Some(blocknum) {
                *block = Some(blocknum);
                let _ = events.send(Event::Block(blocknum));
            }
        }

        match headers.get("x-long-polling").and_then(|v| v.to_str().ok()) {
            Some(path) if !path.is_empty() => {
                let resolved = self.config.url.join(path).unwrap_or_else(|_| self.config.url.clone());
                let already_running = self.state.longpoll_url.lock().await.as_ref() == Some(&resolved);
                if !already_running {
                    *self.state.longpoll_url.lock().await = Some(resolved.clone());
                    self.start_longpoll(resolved, events.clone());
                    if self.config.lpaskrate > 0 {
                        self.state.periodic_poll_disabled.store(false, Ordering::SeqCst);
                        *self.state.interval.lock().await = Duration::from_secs(self.config.lpaskrate);
                    } else {
                        // 0 disables periodic polling outright while the
                        // long-poll channel is active.
                        self.state.periodic_poll_disabled.store(true, Ordering::SeqCst);
                    }
                    let _ = events.send(Event::LongPoll(true));
                }
            }
            _ => {
                if self.state.longpoll_url.lock().await.take().is_some() {
                    self.stop_longpoll();
                    self.state.periodic_poll_disabled.store(false, Ordering::SeqCst);
                    *self.state.interval.lock().await = Duration::from_secs(self.config.askrate);
                    let _ = events.send(Event::LongPoll(false));
                }
            }
        }
    }

    fn start_longpoll(self: &Arc<Self>, url: Url, events: mpsc::UnboundedSender<Event>) {
        let generation = self.state.longpoll_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if this.state.longpoll_generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                let result = this
                    .http
                    .post(url.clone())
                    .basic_auth(&this.config.username, Some(&this.config.password))
                    .timeout(LONGPOLL_TIMEOUT)
                    .json(&RpcRequest {
                        method: "getwork",
                        params: Vec::new(),
                        id: 1,
                    })
                    .send()
                    .await;

                if this.state.longpoll_generation.load(Ordering::SeqCst) != generation {
                    return;
                }

                match result {
                    Ok(resp) => {
                        let headers = resp.headers().clone();
                        if let Ok(parsed) = resp.json::<RpcResponse>().await {
                            if let Some(result) = parsed.result {
                                this.handle_work(result, &headers, true, &events).await;
                            }
                        }
                    }
                    Err(_) => {
                        tokio::time::sleep(Duration::from_secs(this.config.retryrate)).await;
                    }
                }
            }
        });
    }

    fn stop_longpoll(&self) {
        self.state.longpoll_generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Parses the `X-Roll-NTime` response header (§4.4): `expire=N`, a bare
/// integer, a boolean-ish token (`Y`/`true`/... meaning "use the
/// configured default"), or absent entirely (rolling disabled, maxtime 0).
fn parse_roll_ntime(headers: &HeaderMap, configured_default: u32) -> u32 {
    let Some(raw) = headers.get("x-roll-ntime").and_then(|v| v.to_str().ok()) else {
        return 0;
    };
    let raw = raw.trim();

    if let Some(n) = raw.strip_prefix("expire=").and_then(|s| s.parse::<u32>().ok()) {
        return n;
    }
    if let Ok(n) = raw.parse::<u32>() {
        return n;
    }
    let lower = raw.to_ascii_lowercase();
    if matches!(lower.as_str(), "t" | "true" | "on" | "1" | "y" | "yes") {
        return configured_default;
    }
    0
}

#[async_trait]
impl ProtocolClient for PollingClient {
    fn connect(self: Arc<Self>, events: mpsc::UnboundedSender<Event>) {
        self.run_loop(events);
    }

    fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_longpoll();
        self.wake.notify_one();
    }

    fn request_work(&self) {
        self.wake.notify_one();
    }

    async fn send_result(&self, submission: Submission) -> bool {
        match self.pending.register(submission.payload).await {
            SubmitSlot::Follow(rx) => rx.await.unwrap_or(false),
            SubmitSlot::Lead(_rx) => {
                let hex = submission.to_hex();
                let accepted = match self.call("getwork", vec![hex.as_str()]).await {
                    Ok((result, headers)) => {
                        let accepted = result.as_bool().unwrap_or(false);
                        if !accepted {
                            if let Some(reason) = headers.get("x-reject-reason").and_then(|v| v.to_str().ok()) {
                                if let Some(tx) = self.state.events.lock().await.as_ref() {
                                    let _ = tx.send(Event::Debug(format!("reject reason: {}", reason)));
                                }
                            }
                        }
                        accepted
                    }
                    Err(_) => false,
                };
                self.pending.resolve(&submission.payload, accepted).await;
                accepted
            }
        }
    }

    fn set_meta(&self, _var: &str, _value: MetaValue) {
        // RPCClient.setMeta is a no-op: the RPC dialect has no side
        // channel for arbitrary metadata, only the User-Agent string.
    }

    fn set_version(
        &self,
        shortname: &str,
        longname: Option<&str>,
        version: Option<&str>,
        author: Option<&str>,
    ) {
        let vstr = build_version_string(shortname, longname, version, author);
        *self.state.version.lock().expect("version lock poisoned") = vstr;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[test]
    fn parse_roll_ntime_reads_expire_form() {
        let h = headers_with(&[("x-roll-ntime", "expire=45")]);
        assert_eq!(parse_roll_ntime(&h, 60), 45);
    }

    #[test]
    fn parse_roll_ntime_reads_bare_integer() {
        let h = headers_with(&[("x-roll-ntime", "30")]);
        assert_eq!(parse_roll_ntime(&h, 60), 30);
    }

    #[test]
    fn parse_roll_ntime_boolean_token_uses_configured_default() {
        let h = headers_with(&[("x-roll-ntime", "Y")]);
        assert_eq!(parse_roll_ntime(&h, 60), 60);
    }

    #[test]
    fn parse_roll_ntime_absent_disables_rolling() {
        let h = headers_with(&[]);
        assert_eq!(parse_roll_ntime(&h, 60), 0);
    }

    #[test]
    fn default_config_clamps_maxtime() {
        let cfg = PollingConfig::new(Url::parse("http://localhost:8332").unwrap(), "u".into(), "p".into());
        assert_eq!(cfg.maxtime, 60);
        assert_eq!(cfg.askrate, DEFAULT_ASKRATE);
        assert_eq!(cfg.retryrate, DEFAULT_RETRYRATE);
        assert_eq!(cfg.lpaskrate, DEFAULT_LPASKRATE);
    }

    /// Accepts exactly one connection and replies with `body` to every
    /// request on it, closing afterwards. Good enough for a single
    /// `ask()` call; real pools obviously don't hang up after one reply.
    async fn spawn_mock_pool(body: String) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let io = hyper_util::rt::TokioIo::new(stream);
            let service = hyper::service::service_fn(move |_req: hyper::Request<hyper::body::Incoming>| {
                let body = body.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(hyper::Response::new(http_body_util::Full::new(
                        bytes::Bytes::from(body),
                    )))
                }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await;
        });
        Url::parse(&format!("http://{}", addr)).unwrap()
    }

    #[tokio::test]
    async fn ask_parses_a_getwork_response_into_a_work_event() {
        let header = crate::test_utils::TestHeader::new(3);
        let body = serde_json::json!({
            "result": {
                "data": hex::encode(header.data),
                "target": hex::encode(header.target),
            },
            "error": null,
        })
        .to_string();

        let url = spawn_mock_pool(body).await;
        let client = PollingClient::new(PollingConfig::new(url, "u".into(), "p".into()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.ask(&tx).await;

        assert!(matches!(rx.recv().await, Some(Event::Connect)));
        match rx.recv().await {
            Some(Event::Work(aw)) => {
                assert_eq!(aw.data, header.data);
                assert_eq!(aw.target, header.target);
            }
            other => panic!("expected a Work event, got {:?}", other),
        }
    }
}
