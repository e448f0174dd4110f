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

//! `KernelInterface` and `KernelManager` (§4.6), grounded on phoenix2's
//! `core/KernelInterface.py` and `core/PhoenixCore.py`'s kernel lifecycle
//! and device-analysis bookkeeping.
//!
//! A kernel never touches the queue, the protocol client, or another
//! kernel's state directly: everything it needs is reached through its own
//! `KernelInterface`, which is also where `found_nonce`'s re-verification
//! and stale/submit-old gating live.

pub mod rate;

use crate::client::{MetaValue, ProtocolClient};
use crate::error;
use crate::hash;
use crate::stats;
use crate::work::queue::Coordinator;
use crate::work::reader::RangeSource;
use crate::work::{NonceRange, WorkUnit};

use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Sentinel marking an option that must be supplied by configuration;
/// analogous to phoenix2's `REQUIRED = object()`.
pub enum OptionDefault<T> {
    Required,
    Value(T),
}

/// A device's raw, per-instance option values (already lowercased keys),
/// plus the typed accessor `KernelInterface::_getOption` generalizes to.
#[derive(Debug, Clone, Default)]
pub struct Options {
    raw: HashMap<String, String>,
}

impl Options {
    pub fn new(raw: HashMap<String, String>) -> Self {
        Self {
            raw: raw.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect(),
        }
    }

    /// Typed option lookup with the same semantics as `_getOption`: bool
    /// parsing accepts any of `t/true/on/1/y/yes` (case-insensitive) for
    /// true and anything else for false; other types use `FromStr`.
    /// Returns `Kernel::MissingOption` if absent and `default` is
    /// `Required`, `Kernel::WrongOptionType` if present but unparsable.
    pub fn get<T>(&self, name: &str, default: OptionDefault<T>) -> Result<T, error::Kernel>
    where
        T: FromStr + BoolLike,
    {
        let key = name.to_lowercase();
        match self.raw.get(&key) {
            Some(raw) => T::parse_option(raw)
                .ok_or_else(|| error::Kernel::WrongOptionType(name.to_string(), std::any::type_name::<T>())),
            None => match default {
                OptionDefault::Value(v) => Ok(v),
                OptionDefault::Required => Err(error::Kernel::MissingOption(name.to_string())),
            },
        }
    }
}

/// Lets `Options::get::<bool>` special-case truthy tokens the way
/// `_getOption`'s `optType == bool` branch does, while every other `T`
/// just falls through to `FromStr`.
pub trait BoolLike: Sized {
    fn parse_option(raw: &str) -> Option<Self>;
}

impl BoolLike for bool {
    fn parse_option(raw: &str) -> Option<Self> {
        Some(matches!(
            raw.to_ascii_lowercase().as_str(),
            "t" | "true" | "on" | "1" | "y" | "yes"
        ))
    }
}

macro_rules! fromstr_boollike {
    ($($t:ty),*) => {
        $(impl BoolLike for $t {
            fn parse_option(raw: &str) -> Option<Self> {
                raw.parse().ok()
            }
        })*
    };
}
fromstr_boollike!(String, u8, u16, u32, u64, i32, i64, f64, usize);

/// What a kernel reports back to its manager, outside the work/client
/// graph: metadata forwarding, rate samples, and fatal shutdown.
pub trait ManagerHandle: Send + Sync {
    fn set_meta(&self, var: &str, value: MetaValue);
    fn update_rate(&self, device_id: &str, khps: f64, bucket: Option<usize>);
    fn fatal(&self, device_id: &str, message: String);
    /// Records a submission ack (§4.6 `found_nonce`) in the aggregate
    /// `stats::CoreStats`.
    fn record_submission(&self, accepted: bool);
    /// Records a candidate solution dropped because its unit went stale
    /// and `submit_old` wasn't set.
    fn record_stale_drop(&self);
}

/// Everything a running kernel implementation calls into. One per started
/// device; never shared across devices.
pub struct KernelInterface<S: RangeSource + ?Sized> {
    device_id: String,
    name: Option<String>,
    options: Options,
    source: Arc<S>,
    client: Arc<dyn ProtocolClient>,
    manager: Arc<dyn ManagerHandle>,
    rate: rate::RateTracker,
    results: AtomicU64,
    started: Instant,
    fatal: AtomicBool,
    /// Whether a stale unit's nonce should still be submitted (configured
    /// per-connection; phoenix2 reads this off `core.connection.submitold`).
    submit_old: bool,
}

impl<S: RangeSource + ?Sized> KernelInterface<S> {
    pub fn new(
        device_id: String,
        options: Options,
        source: Arc<S>,
        client: Arc<dyn ProtocolClient>,
        manager: Arc<dyn ManagerHandle>,
        ratesamples: usize,
        submit_old: bool,
    ) -> Arc<Self> {
        let name = options.raw.get("name").cloned();
        Arc::new(Self {
            device_id,
            name,
            options,
            source,
            client,
            manager,
            rate: rate::RateTracker::new(ratesamples),
            results: AtomicU64::new(0),
            started: Instant::now(),
            fatal: AtomicBool::new(false),
            submit_old,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Falls back to the device id when no `name` option is configured
    /// (`getName`).
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.device_id)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn started_at(&self) -> Instant {
        self.started
    }

    pub fn results(&self) -> u64 {
        self.results.load(Ordering::Relaxed)
    }

    pub fn set_meta(&self, var: &str, value: MetaValue) {
        self.manager.set_meta(var, value);
    }

    pub fn update_rate(&self, khps: f64, bucket: Option<usize>) {
        self.rate.update(khps, bucket);
        // report this device's windowed total, not the raw sample: the
        // manager replaces this device's last-known contribution rather
        // than summing every sample it's ever seen.
        self.manager.update_rate(&self.device_id, self.rate.total(), bucket);
    }

    pub fn rate(&self) -> f64 {
        self.rate.total()
    }

    pub async fn fetch_range(&self, size: Option<u64>) -> NonceRange {
        self.source.fetch_range(size).await
    }

    /// The header bytes with the candidate nonce substituted in, hashed via
    /// `hash::hash`, optionally overriding the timestamp too
    /// (`calculateHash`).
    pub fn calculate_hash(&self, unit: &WorkUnit, nonce: u32, timestamp: Option<u32>) -> hash::Digest {
        let mut header = unit.data;
        byteorder::LittleEndian::write_u32(&mut header[76..80], nonce);
        hash::hash(&header, timestamp)
    }

    pub fn check_target(&self, digest: &hash::Digest, target: &hash::Digest) -> bool {
        hash::meets_target(digest, target)
    }

    /// Re-verifies a candidate solution and submits it if it still
    /// qualifies (`foundNonce`): a stale unit's nonce is dropped unless
    /// `submit_old` is set, then the hash is recomputed and checked against
    /// target before anything goes out over the wire. Returns whether the
    /// server accepted the submission.
    pub async fn found_nonce(&self, unit: &Arc<WorkUnit>, nonce: u32, timestamp: Option<u32>) -> bool {
        self.results.fetch_add(1, Ordering::Relaxed);

        if unit.is_stale() && !self.submit_old {
            self.manager.record_stale_drop();
            return false;
        }

        let digest = self.calculate_hash(unit, nonce, timestamp);
        if !self.check_target(&digest, &unit.target) {
            return false;
        }

        let ts = timestamp.unwrap_or_else(|| unit.timestamp());
        let submission = crate::work::Submission::new(unit, ts, nonce);
        let accepted = self.client.send_result(submission).await;
        self.manager.record_submission(accepted);
        accepted
    }

    pub fn debug(&self, message: impl Into<String>) {
        tracing::debug!(device = self.device_id, "{}", message.into());
    }

    pub fn log(&self, message: impl Into<String>) {
        tracing::info!(device = self.device_id, "{}", message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        tracing::error!(device = self.device_id, "{}", message.into());
    }

    /// Marks this kernel's init as unrecoverable and tells the manager to
    /// stop it (`fatal`).
    pub fn fatal(&self, message: impl Into<String>) {
        let message = message.into();
        self.fatal.store(true, Ordering::SeqCst);
        tracing::error!(device = self.device_id, "{}", message);
        self.manager.fatal(&self.device_id, message);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }
}

/// Static capability a kernel implementation exposes to the manager, kept
/// trait-object friendly so `KernelManager` can hold a registry of
/// heterogeneous kernel types (`kernelTypes` in `PhoenixCore`).
pub trait KernelFactory: Send + Sync {
    /// Scores how well this kernel type can drive `device_id`
    /// (0 = cannot, higher = more preferred), returning autoconfiguration
    /// defaults and any alias ids the same physical device is also known
    /// by (`analyzeDevice`).
    fn analyze_device(&self, device_id: &str) -> Option<DeviceAnalysis>;

    /// Enumerates devices this kernel type can drive, invoking `found` once
    /// per device id (`autodetect`). Default: no autodetection support.
    fn autodetect(&self, _found: &mut dyn FnMut(String)) {}

    /// Instantiates and starts a kernel instance against `interface`.
    fn start(&self, interface: Arc<dyn ErasedKernelInterface>) -> Box<dyn RunningKernel>;
}

#[derive(Debug, Clone, Default)]
pub struct DeviceAnalysis {
    pub rating: u8,
    pub autoconfig: HashMap<String, String>,
    pub alias_ids: Vec<String>,
}

/// A type-erased facade over `KernelInterface<S>` so `KernelFactory`
/// doesn't need to be generic over the range source. Kernel
/// implementations downcast via whatever concrete method set they agreed
/// on with their factory; the manager only needs `device_id`/`fatal`.
pub trait ErasedKernelInterface: Send + Sync {
    fn device_id(&self) -> &str;
}

impl<S: RangeSource + ?Sized + 'static> ErasedKernelInterface for KernelInterface<S> {
    fn device_id(&self) -> &str {
        &self.device_id
    }
}

pub trait RunningKernel: Send + Sync {
    fn stop(&self);
}

struct RunningEntry {
    kernel: Box<dyn RunningKernel>,
    canonical_id: String,
}

/// Starts/stops kernels, aggregates their hash rates, and implements
/// `queue::Coordinator` so it can sit directly in the coordination wiring
/// between a `WorkQueue` and a `ProtocolClient` (mirrors `PhoenixCore`'s
/// combined role as queue-idle listener and rate aggregator).
pub struct KernelManager {
    factories: Mutex<HashMap<String, Arc<dyn KernelFactory>>>,
    running: Mutex<HashMap<String, RunningEntry>>,
    /// Alias-id sets, canonical id first, mirroring `PhoenixCore.deviceIDs`.
    device_ids: Mutex<Vec<Vec<String>>>,
    analysis_memo: Mutex<HashMap<String, (String, DeviceAnalysis)>>,
    client: Arc<dyn ProtocolClient>,
    idle: AtomicBool,
    /// Each running kernel's last-reported windowed total, keyed by device
    /// id; the aggregate rate is this map's sum, not a running accumulator,
    /// so a kernel's repeated updates replace its contribution rather than
    /// piling on top of it.
    device_rates: Mutex<HashMap<String, f64>>,
    last_meta_report: Mutex<Instant>,
    pub stats: Arc<stats::CoreStats>,
}

const META_RATE_DEBOUNCE_SECS: u64 = 30;

impl KernelManager {
    pub fn new(client: Arc<dyn ProtocolClient>) -> Arc<Self> {
        Arc::new(Self {
            factories: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            device_ids: Mutex::new(Vec::new()),
            analysis_memo: Mutex::new(HashMap::new()),
            client,
            idle: AtomicBool::new(true),
            device_rates: Mutex::new(HashMap::new()),
            last_meta_report: Mutex::new(Instant::now() - std::time::Duration::from_secs(3600)),
            stats: Arc::new(stats::CoreStats::new()),
        })
    }

    pub fn register_kernel_type(&self, name: impl Into<String>, factory: Arc<dyn KernelFactory>) {
        self.factories
            .lock()
            .expect("kernel factory registry poisoned")
            .insert(name.into(), factory);
    }

    /// Scores every registered kernel type against `device_id` and whatever
    /// alias ids they surface in turn, memoizing the result
    /// (`_analyzeDevice`). The canonical id (the best-scoring kernel's
    /// preferred name, or `device_id` itself) is placed first.
    pub fn analyze_device(&self, device_id: &str) -> (String, DeviceAnalysis) {
        if let Some(hit) = self
            .analysis_memo
            .lock()
            .expect("analysis memo poisoned")
            .get(device_id)
        {
            return hit.clone();
        }

        let factories = self.factories.lock().expect("kernel factory registry poisoned");

        let mut ids: Vec<String> = vec![device_id.to_string()];
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        seen.insert(device_id.to_string());

        let mut best_type: Option<String> = None;
        let mut best = DeviceAnalysis::default();
        let mut best_canonical = device_id.to_string();

        let mut i = 0;
        while i < ids.len() {
            let analyzing = ids[i].clone();
            i += 1;

            for (type_name, factory) in factories.iter() {
                let Some(analysis) = factory.analyze_device(&analyzing) else {
                    continue;
                };
                if analysis.rating > best.rating {
                    best_canonical = analysis
                        .alias_ids
                        .first()
                        .cloned()
                        .unwrap_or_else(|| analyzing.clone());
                    best_type = Some(type_name.clone());
                    best = analysis.clone();
                }
                for alias in &analysis.alias_ids {
                    if seen.insert(alias.clone()) {
                        ids.push(alias.clone());
                    }
                }
            }
        }

        ids.retain(|id| id != &best_canonical);
        ids.insert(0, best_canonical.clone());

        let result = (best_type.unwrap_or_default(), DeviceAnalysis {
            alias_ids: ids,
            ..best
        });
        self.analysis_memo
            .lock()
            .expect("analysis memo poisoned")
            .insert(device_id.to_string(), result.clone());
        result
    }

    /// Starts a kernel on `device_id` unless it (or one of its aliases) is
    /// already running (`startKernel`). Returns `false` if no registered
    /// kernel type claims the device or the kernel reported a fatal error
    /// during its own startup.
    pub fn start_kernel(
        self: &Arc<Self>,
        device_id: &str,
        make_interface: impl FnOnce(&DeviceAnalysis) -> Arc<dyn ErasedKernelInterface>,
    ) -> bool {
        let device_id = device_id.to_lowercase();

        {
            let device_ids = self.device_ids.lock().expect("device id registry poisoned");
            let running = self.running.lock().expect("running kernel registry poisoned");
            for idset in device_ids.iter() {
                if idset.iter().any(|id| id == &device_id) && running.contains_key(&idset[0]) {
                    return false;
                }
            }
        }

        let (type_name, analysis) = self.analyze_device(&device_id);
        let factory = self
            .factories
            .lock()
            .expect("kernel factory registry poisoned")
            .get(&type_name)
            .cloned();
        let Some(factory) = factory else {
            return false;
        };

        // `make_interface` is expected to check its own `KernelInterface`'s
        // `is_fatal()` and simply not hand back an interface at all if
        // construction failed (`startKernel`'s `interface._fatal` bail-out);
        // the erased handle this method receives carries no fatal flag of
        // its own to check.
        let interface = make_interface(&analysis);

        let canonical_id = analysis
            .alias_ids
            .first()
            .cloned()
            .unwrap_or_else(|| device_id.clone());
        let running_kernel = factory.start(interface);

        self.device_ids
            .lock()
            .expect("device id registry poisoned")
            .push(analysis.alias_ids.clone());
        self.running.lock().expect("running kernel registry poisoned").insert(
            canonical_id.clone(),
            RunningEntry {
                kernel: running_kernel,
                canonical_id,
            },
        );
        true
    }

    /// Runs every registered kernel type's `autodetect` and starts a kernel
    /// on each newly discovered device, skipping anything already running
    /// under any of its alias ids (`startAutodetect`/`_autodetectCallback`).
    /// Safe to call more than once; kernels are expected to re-report their
    /// devices on a rerun, and already-running ones are simply skipped.
    pub fn autodetect(
        self: &Arc<Self>,
        make_interface: impl Fn(&DeviceAnalysis) -> Arc<dyn ErasedKernelInterface>,
    ) {
        let factories: Vec<_> = self
            .factories
            .lock()
            .expect("kernel factory registry poisoned")
            .values()
            .cloned()
            .collect();

        let mut found = Vec::new();
        for factory in &factories {
            factory.autodetect(&mut |device_id| found.push(device_id));
        }

        for device_id in found {
            self.start_kernel(&device_id, &make_interface);
        }
    }

    pub fn stop_kernel(&self, device_id: &str) {
        let mut running = self.running.lock().expect("running kernel registry poisoned");
        if let Some(entry) = running.remove(device_id) {
            entry.kernel.stop();
        }
        drop(running);
        self.device_rates
            .lock()
            .expect("device rate map poisoned")
            .remove(device_id);
        self.report_rate(self.total_rate());
    }

    pub fn stop_all(&self) {
        let mut running = self.running.lock().expect("running kernel registry poisoned");
        for (_, entry) in running.drain() {
            entry.kernel.stop();
        }
        drop(running);
        self.device_rates.lock().expect("device rate map poisoned").clear();
    }

    fn total_rate(&self) -> f64 {
        self.device_rates
            .lock()
            .expect("device rate map poisoned")
            .values()
            .sum()
    }
}

impl Coordinator for Arc<KernelManager> {
    fn request_work(&self) {
        self.client.request_work();
    }

    fn report_idle(&self, idle: bool) {
        if self.idle.swap(idle, Ordering::SeqCst) == idle {
            return;
        }
        if idle {
            tracing::warn!("work queue empty, miner is idle");
            self.device_rates.lock().expect("device rate map poisoned").clear();
            self.report_rate(0.0);
        }
    }

    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }
}

impl ManagerHandle for Arc<KernelManager> {
    fn set_meta(&self, var: &str, value: MetaValue) {
        self.client.set_meta(var, value);
    }

    fn update_rate(&self, device_id: &str, khps: f64, _bucket: Option<usize>) {
        self.device_rates
            .lock()
            .expect("device rate map poisoned")
            .insert(device_id.to_string(), khps);
        self.report_rate(self.total_rate());
    }

    fn fatal(&self, device_id: &str, message: String) {
        tracing::error!(device = device_id, "{}", message);
        self.stop_kernel(device_id);
    }

    fn record_submission(&self, accepted: bool) {
        self.stats.record_submission(accepted);
    }

    fn record_stale_drop(&self) {
        self.stats.record_stale_drop();
    }
}

impl KernelManager {
    /// Forwards the aggregate rate to the pool, debounced to at most once
    /// every 30s (`_recalculateTotalRate`'s "let's not spam the server").
    fn report_rate(&self, rate: f64) {
        let mut last = self.last_meta_report.lock().expect("rate report lock poisoned");
        if last.elapsed().as_secs() < META_RATE_DEBOUNCE_SECS {
            return;
        }
        *last = Instant::now();
        drop(last);
        self.client.set_meta("rate", MetaValue::Str(rate.to_string()));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn options_required_missing_is_an_error() {
        let opts = Options::new(HashMap::new());
        let result: Result<String, _> = opts.get("pool", OptionDefault::Required);
        assert!(matches!(result, Err(error::Kernel::MissingOption(_))));
    }

    #[test]
    fn options_default_is_used_when_absent() {
        let opts = Options::new(HashMap::new());
        let result = opts.get("threads", OptionDefault::Value(4u32));
        assert_eq!(result.unwrap(), 4);
    }

    #[test]
    fn options_bool_accepts_truthy_tokens() {
        let mut raw = HashMap::new();
        raw.insert("verbose".to_string(), "Yes".to_string());
        let opts = Options::new(raw);
        assert!(opts.get::<bool>("verbose", OptionDefault::Value(false)).unwrap());
    }

    #[test]
    fn options_bool_rejects_other_tokens_as_false() {
        let mut raw = HashMap::new();
        raw.insert("verbose".to_string(), "nope".to_string());
        let opts = Options::new(raw);
        assert!(!opts.get::<bool>("verbose", OptionDefault::Value(true)).unwrap());
    }

    #[test]
    fn options_lookup_is_case_insensitive_on_key() {
        let mut raw = HashMap::new();
        raw.insert("Threads".to_string(), "8".to_string());
        let opts = Options::new(raw);
        assert_eq!(opts.get("threads", OptionDefault::Value(1u32)).unwrap(), 8);
    }

    struct AlwaysMatches {
        rating: u8,
    }
    impl KernelFactory for AlwaysMatches {
        fn analyze_device(&self, device_id: &str) -> Option<DeviceAnalysis> {
            Some(DeviceAnalysis {
                rating: self.rating,
                autoconfig: HashMap::new(),
                alias_ids: vec![device_id.to_string()],
            })
        }
        fn start(&self, _interface: Arc<dyn ErasedKernelInterface>) -> Box<dyn RunningKernel> {
            unimplemented!()
        }
    }

    struct NeverMatches;
    impl KernelFactory for NeverMatches {
        fn analyze_device(&self, _device_id: &str) -> Option<DeviceAnalysis> {
            None
        }
        fn start(&self, _interface: Arc<dyn ErasedKernelInterface>) -> Box<dyn RunningKernel> {
            unimplemented!()
        }
    }

    struct NoopClient;
    #[async_trait::async_trait]
    impl ProtocolClient for NoopClient {
        fn connect(self: Arc<Self>, _events: tokio::sync::mpsc::UnboundedSender<crate::client::Event>) {}
        fn disconnect(&self) {}
        fn request_work(&self) {}
        async fn send_result(&self, _submission: crate::work::Submission) -> bool {
            true
        }
        fn set_meta(&self, _var: &str, _value: MetaValue) {}
        fn set_version(&self, _s: &str, _l: Option<&str>, _v: Option<&str>, _a: Option<&str>) {}
    }

    #[test]
    fn analyze_device_picks_highest_rated_factory() {
        let manager = KernelManager::new(Arc::new(NoopClient));
        manager.register_kernel_type("weak", Arc::new(AlwaysMatches { rating: 1 }));
        manager.register_kernel_type("strong", Arc::new(AlwaysMatches { rating: 5 }));
        manager.register_kernel_type("none", Arc::new(NeverMatches));

        let (type_name, analysis) = manager.analyze_device("gpu:0");
        assert_eq!(type_name, "strong");
        assert_eq!(analysis.rating, 5);
        assert_eq!(analysis.alias_ids[0], "gpu:0");
    }

    #[test]
    fn analyze_device_memoizes_results() {
        let manager = KernelManager::new(Arc::new(NoopClient));
        manager.register_kernel_type("strong", Arc::new(AlwaysMatches { rating: 5 }));

        let first = manager.analyze_device("gpu:0");
        let second = manager.analyze_device("gpu:0");
        assert_eq!(first.1.rating, second.1.rating);
        assert_eq!(first.0, second.0);
    }

    struct NoopRunning;
    impl RunningKernel for NoopRunning {
        fn stop(&self) {}
    }

    struct AutoDetecting {
        devices: Vec<&'static str>,
    }
    impl KernelFactory for AutoDetecting {
        fn analyze_device(&self, device_id: &str) -> Option<DeviceAnalysis> {
            Some(DeviceAnalysis {
                rating: 1,
                autoconfig: HashMap::new(),
                alias_ids: vec![device_id.to_string()],
            })
        }
        fn autodetect(&self, found: &mut dyn FnMut(String)) {
            for device in &self.devices {
                found((*device).to_string());
            }
        }
        fn start(&self, _interface: Arc<dyn ErasedKernelInterface>) -> Box<dyn RunningKernel> {
            Box::new(NoopRunning)
        }
    }

    struct StubInterface(String);
    impl ErasedKernelInterface for StubInterface {
        fn device_id(&self) -> &str {
            &self.0
        }
    }

    #[test]
    fn autodetect_starts_one_kernel_per_reported_device() {
        let manager = KernelManager::new(Arc::new(NoopClient));
        manager.register_kernel_type(
            "auto",
            Arc::new(AutoDetecting {
                devices: vec!["gpu:0", "gpu:1"],
            }),
        );

        manager.autodetect(|analysis| {
            Arc::new(StubInterface(analysis.alias_ids[0].clone())) as Arc<dyn ErasedKernelInterface>
        });

        assert_eq!(manager.running.lock().unwrap().len(), 2);
    }

    #[test]
    fn autodetect_is_idempotent_across_reruns() {
        let manager = KernelManager::new(Arc::new(NoopClient));
        manager.register_kernel_type(
            "auto",
            Arc::new(AutoDetecting {
                devices: vec!["gpu:0"],
            }),
        );

        let make_interface = |analysis: &DeviceAnalysis| {
            Arc::new(StubInterface(analysis.alias_ids[0].clone())) as Arc<dyn ErasedKernelInterface>
        };
        manager.autodetect(make_interface);
        manager.autodetect(make_interface);

        assert_eq!(manager.running.lock().unwrap().len(), 1);
    }

    #[test]
    fn device_rate_updates_replace_rather_than_accumulate() {
        let manager = KernelManager::new(Arc::new(NoopClient));

        ManagerHandle::update_rate(&manager, "gpu:0", 100.0, None);
        ManagerHandle::update_rate(&manager, "gpu:1", 50.0, None);
        assert_eq!(manager.total_rate(), 150.0);

        // gpu:0 reports a fresh windowed total; it must replace its old
        // contribution, not add to it.
        ManagerHandle::update_rate(&manager, "gpu:0", 120.0, None);
        assert_eq!(manager.total_rate(), 170.0);
    }

    #[test]
    fn stop_kernel_drops_its_rate_contribution() {
        let manager = KernelManager::new(Arc::new(NoopClient));
        ManagerHandle::update_rate(&manager, "gpu:0", 100.0, None);
        ManagerHandle::update_rate(&manager, "gpu:1", 50.0, None);

        manager.stop_kernel("gpu:0");
        assert_eq!(manager.total_rate(), 50.0);
    }
}
