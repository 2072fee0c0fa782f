//! The in-process capsule agent.
//!
//! A capsule owns one event trace and one report loop per traced thread,
//! plus a transport thread holding the connection to the scheduler. Traces
//! are looked up by the calling thread's ordinal through a
//! [`TraceRegistry`] owned by the capsule. When a traced thread exits, its
//! report loop drains the trace and the registry entry is removed.

use crate::config::Config;
use crate::connection::{ConnectionInstance, Role};
use crate::event::{current_thread_ordinal, now_ticks};
use crate::logging::capsule_log_path;
use crate::report::{DeviceSync, ReportLoop, ReportSink, ReportStats};
use crate::trace::{EventTrace, TraceRegistry};
use crate::transport::{self, ConnectionEvents, TransportOptions};
use crate::{Error, Result};
use gwatch_codec::capsule::{CapsuleInfo, CapsuleRegister, CpuInfo, GpuInfo, Heartbeat};
use gwatch_codec::{CapsuleEnvelope, CapsulePayload};
use parking_lot::{Condvar, Mutex, RwLock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Host and device description sent in the REGISTER reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub capsule: CapsuleInfo,
    pub cpu: CpuInfo,
    pub gpus: Vec<GpuInfo>,
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|text| text.trim().to_string())
}

fn key_value<'a>(text: &'a str, key: &str, separator: char) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (k, v) = line.split_once(separator)?;
        (k.trim() == key).then(|| v.trim().trim_matches('"'))
    })
}

impl Topology {
    /// Describe this process and host. GPUs are left empty; attach them with
    /// [`Topology::with_gpus`].
    #[must_use]
    pub fn detect(ip: IpAddr) -> Self {
        let pid = std::process::id();
        let ip_addr = ip.to_string();
        let cpu_global_id = format!("cpu-{ip_addr}");
        let cpuinfo = read_trimmed("/proc/cpuinfo").unwrap_or_default();
        let meminfo = read_trimmed("/proc/meminfo").unwrap_or_default();
        let os_release = read_trimmed("/etc/os-release").unwrap_or_default();
        let dram_kib = key_value(&meminfo, "MemTotal", ':')
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        Self {
            capsule: CapsuleInfo {
                global_id: format!("capsule-{ip_addr}-{pid}"),
                cpu_global_id: cpu_global_id.clone(),
                start_time: chrono::Utc::now().to_rfc3339(),
                start_tsc: now_ticks(),
                end_time: String::new(),
                state: "running".to_string(),
                kernel_version: read_trimmed("/proc/sys/kernel/osrelease")
                    .unwrap_or_else(|| std::env::consts::OS.to_string()),
                os_distribution: key_value(&os_release, "PRETTY_NAME", '=')
                    .unwrap_or(std::env::consts::OS)
                    .to_string(),
                pid,
                ip_addr: ip_addr.clone(),
            },
            cpu: CpuInfo {
                global_id: cpu_global_id,
                cpu_name: key_value(&cpuinfo, "model name", ':')
                    .unwrap_or(std::env::consts::ARCH)
                    .to_string(),
                ip_addr,
                tsc_freq: 0.0,
                num_cpu_cores: std::thread::available_parallelism().map_or(1, |n| n.get() as u64),
                num_numa_nodes: 1,
                dram_size: dram_kib * 1024,
            },
            gpus: Vec::new(),
        }
    }

    /// Attach GPUs, binding each to this host's CPU.
    #[must_use]
    pub fn with_gpus(mut self, gpus: impl IntoIterator<Item = GpuInfo>) -> Self {
        let cpu_global_id = self.cpu.global_id.clone();
        self.gpus = gpus
            .into_iter()
            .map(|gpu| GpuInfo {
                cpu_global_id: cpu_global_id.clone(),
                ..gpu
            })
            .collect();
        self
    }

    #[must_use]
    pub fn global_id(&self) -> &str {
        &self.capsule.global_id
    }

    fn register_reply(&self) -> CapsuleRegister {
        CapsuleRegister {
            success: true,
            capsule_info: self.capsule.clone(),
            cpu_info: self.cpu.clone(),
            list_gpu_info: self.gpus.clone(),
        }
    }
}

/// The local address used to reach `scheduler`. No packet is sent.
#[must_use]
pub fn local_ip_towards(scheduler: SocketAddr) -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(scheduler).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// The current scheduler connection, if any.
#[derive(Default)]
struct SchedulerLink {
    conn: Mutex<Option<Arc<ConnectionInstance>>>,
    connected: Condvar,
}

impl SchedulerLink {
    fn current(&self) -> Result<Arc<ConnectionInstance>> {
        self.conn
            .lock()
            .clone()
            .ok_or_else(|| Error::not_ready("scheduler connection not established"))
    }

    fn set(&self, conn: Option<Arc<ConnectionInstance>>) {
        *self.conn.lock() = conn;
        self.connected.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut conn = self.conn.lock();
        while conn.is_none() {
            if self.connected.wait_until(&mut conn, deadline).timed_out() {
                return conn.is_some();
            }
        }
        true
    }
}

impl ReportSink for SchedulerLink {
    fn report(&self, envelope: &CapsuleEnvelope) -> Result<()> {
        self.current()?.report(envelope)
    }
}

/// Capsule side of the transport: answers REGISTER and tracks the link.
struct CapsuleEvents {
    link: Arc<SchedulerLink>,
    register: CapsuleRegister,
}

impl ConnectionEvents for CapsuleEvents {
    fn on_connect(&self, conn: &Arc<ConnectionInstance>) {
        self.link.set(Some(Arc::clone(conn)));
    }

    fn on_message(&self, conn: &Arc<ConnectionInstance>, message: Vec<u8>) {
        let envelope = match CapsuleEnvelope::decode_bytes(&message) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    conn_id = conn.id(),
                    error = %err,
                    "dropping undecodable message from scheduler"
                );
                return;
            }
        };
        match &envelope.payload {
            CapsulePayload::CapsuleRegister(_) => {
                let reply = envelope.reply(self.register.clone());
                match conn.send_envelope(&reply) {
                    Ok(()) => tracing::info!(
                        capsule = %self.register.capsule_info.global_id,
                        "registered with scheduler"
                    ),
                    Err(err) => tracing::error!(error = %err, "failed to answer REGISTER"),
                }
            }
            CapsulePayload::SqlCreateTable(reply) if !reply.success => {
                tracing::warn!(table = %reply.table_name, "scheduler failed to create table");
            }
            CapsulePayload::SqlDropTable(reply) if !reply.success => {
                tracing::warn!(table = %reply.table_name, "scheduler failed to drop table");
            }
            _ => tracing::debug!(
                payload = envelope.payload_name(),
                ref_id = %envelope.ref_id,
                "scheduler message"
            ),
        }
    }

    fn on_disconnect(&self, conn: &Arc<ConnectionInstance>) {
        tracing::warn!(conn_id = conn.id(), "scheduler connection closed");
        self.link.set(None);
    }
}

struct TransportThread {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

/// A traced thread's report loop and the flag that stops it.
struct ReportThread {
    trace: Arc<EventTrace>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<ReportStats>,
}

impl ReportThread {
    /// Lock the trace, stop the loop and wait for its grace drain.
    fn finish(self) -> ReportStats {
        self.trace.lock();
        self.stop.store(true, Ordering::Release);
        match self.handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                tracing::error!(trace = %self.trace.name(), "report loop panicked");
                ReportStats::default()
            }
        }
    }
}

/// Every traced thread of one capsule.
///
/// `closed` is only written with `loops` held, so a trace is either created
/// before shutdown drains the loops or refused.
#[derive(Default)]
struct TraceSet {
    registry: TraceRegistry,
    loops: Mutex<HashMap<u64, ReportThread>>,
    closed: AtomicBool,
    /// Held shared while a thread retires, exclusively by `close`.
    retiring: RwLock<()>,
    retired: Mutex<ReportStats>,
}

impl TraceSet {
    /// Drain and forget `thread`'s trace.
    fn retire(&self, thread: u64) {
        let _retiring = self.retiring.read();
        let report = self.loops.lock().remove(&thread);
        if let Some(report) = report {
            let stats = report.finish();
            *self.retired.lock() += stats;
            tracing::debug!(thread, ?stats, "traced thread exited");
        }
        self.registry.remove(thread);
    }

    /// Refuse new traces, then drain every remaining one.
    fn close(&self) -> ReportStats {
        let reports: Vec<ReportThread> = {
            let mut loops = self.loops.lock();
            self.closed.store(true, Ordering::Release);
            self.registry.lock_all();
            loops.drain().map(|(_, report)| report).collect()
        };
        let mut stats = ReportStats::default();
        for report in reports {
            stats += report.finish();
        }
        let _retired = self.retiring.write();
        stats += std::mem::take(&mut *self.retired.lock());
        stats
    }
}

/// Retires a trace when the thread that created it exits.
struct ThreadExit {
    traces: Weak<TraceSet>,
    thread: u64,
}

impl Drop for ThreadExit {
    fn drop(&mut self) {
        if let Some(traces) = self.traces.upgrade() {
            traces.retire(self.thread);
        }
    }
}

thread_local! {
    static THREAD_EXITS: RefCell<Vec<ThreadExit>> = const { RefCell::new(Vec::new()) };
}

/// What shutdown managed to deliver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub events: ReportStats,
    pub flushed: bool,
}

pub struct Capsule {
    config: Config,
    topology: Topology,
    log_path: PathBuf,
    device: Arc<dyn DeviceSync>,
    traces: Arc<TraceSet>,
    link: Arc<SchedulerLink>,
    stop: Arc<AtomicBool>,
    flush_abort: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    transport: Mutex<Option<TransportThread>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Capsule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capsule")
            .field("global_id", &self.global_id())
            .field("traces", &self.traces.registry.len())
            .finish_non_exhaustive()
    }
}

impl Capsule {
    pub fn new(config: Config, topology: Topology, device: Arc<dyn DeviceSync>) -> Self {
        let log_path = capsule_log_path(&config.general.log_dir, topology.global_id());
        Self {
            config,
            topology,
            log_path,
            device,
            traces: Arc::new(TraceSet::default()),
            link: Arc::new(SchedulerLink::default()),
            stop: Arc::new(AtomicBool::new(false)),
            flush_abort: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
            transport: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn global_id(&self) -> &str {
        self.topology.global_id()
    }

    /// Where this capsule's log file belongs.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link.current().is_ok()
    }

    /// Start the transport thread. It runs its own tokio runtime and keeps
    /// the scheduler connection until shutdown.
    pub fn connect(&self) -> Result<()> {
        let mut transport = self.transport.lock();
        if transport.is_some() {
            return Err(Error::already_exist("scheduler transport"));
        }
        let addr = self.config.scheduler_addr();
        let options = TransportOptions::from_config(&self.config);
        let connect_timeout = Duration::from_millis(self.config.capsule.connect_timeout_ms);
        let events = Arc::new(CapsuleEvents {
            link: Arc::clone(&self.link),
            register: self.topology.register_reply(),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = std::thread::Builder::new()
            .name("gw-transport".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                let result = runtime.block_on(transport::connect(
                    addr.clone(),
                    Role::Capsule,
                    events,
                    options,
                    connect_timeout,
                    shutdown_rx,
                ));
                if let Err(err) = &result {
                    tracing::error!(%addr, error = %err, "scheduler transport stopped");
                }
                result
            })?;
        *transport = Some(TransportThread { shutdown, handle });
        drop(transport);

        self.start_heartbeat()?;
        Ok(())
    }

    /// Block until the scheduler connection is up or `timeout` passes.
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        if self.link.wait(timeout) {
            Ok(())
        } else {
            Err(Error::not_ready(format!(
                "no scheduler connection to {} within {timeout:?}",
                self.config.scheduler_addr()
            )))
        }
    }

    fn start_heartbeat(&self) -> Result<()> {
        let interval_ms = self.config.capsule.heartbeat_interval_ms;
        if interval_ms == 0 {
            return Ok(());
        }
        let interval = Duration::from_millis(interval_ms);
        let tick = interval.min(Duration::from_millis(50));
        let link = Arc::clone(&self.link);
        let stop = Arc::clone(&self.stop);
        let handle = std::thread::Builder::new()
            .name("gw-heartbeat".to_string())
            .spawn(move || {
                let mut next = Instant::now() + interval;
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(tick);
                    if Instant::now() < next {
                        continue;
                    }
                    next = Instant::now() + interval;
                    let beat = CapsuleEnvelope::new("", Heartbeat {});
                    match link.current().and_then(|conn| conn.send_envelope(&beat)) {
                        Ok(()) | Err(Error::NotReady(_)) => {}
                        Err(err) => tracing::debug!(error = %err, "heartbeat not sent"),
                    }
                }
            })?;
        *self.heartbeat.lock() = Some(handle);
        Ok(())
    }

    /// The calling thread's trace. The first call on a thread creates the
    /// trace and starts its report loop, which stops when the thread exits.
    pub fn ensure_event_trace(&self) -> Result<Arc<EventTrace>> {
        let thread = current_thread_ordinal();
        let mut loops = self.traces.loops.lock();
        if self.traces.closed.load(Ordering::Acquire) {
            return Err(Error::not_ready("capsule is shutting down"));
        }
        let capacity = self.config.capsule.trace_queue_capacity;
        let name = EventTrace::default_name(self.global_id());
        let (trace, created) = self
            .traces
            .registry
            .get_or_create(thread, || EventTrace::new(name, capacity));
        if !created {
            return Ok(trace);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let spawned = ReportLoop::new(
            self.global_id(),
            Arc::clone(&trace),
            Arc::clone(&self.link) as Arc<dyn ReportSink>,
            Arc::clone(&self.device),
            Arc::clone(&stop),
        )
        .with_idle_backoff(Duration::from_micros(self.config.capsule.report_idle_backoff_us))
        .with_grace(Duration::from_millis(self.config.capsule.shutdown_grace_ms))
        .spawn();
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.traces.registry.remove(thread);
                return Err(err);
            }
        };
        loops.insert(
            thread,
            ReportThread {
                trace: Arc::clone(&trace),
                stop,
                handle,
            },
        );
        drop(loops);

        let exit = ThreadExit {
            traces: Arc::downgrade(&self.traces),
            thread,
        };
        if THREAD_EXITS
            .try_with(|exits| exits.borrow_mut().push(exit))
            .is_err()
        {
            tracing::debug!(thread, "thread exiting, trace kept until shutdown");
        }
        tracing::debug!(thread, trace = %trace.name(), "event trace created");
        Ok(trace)
    }

    #[must_use]
    pub fn traces(&self) -> Vec<Arc<EventTrace>> {
        self.traces.registry.all()
    }

    /// Queue a message for the scheduler. `NotReady` before the connection
    /// is up.
    pub fn send_to_scheduler(&self, envelope: &CapsuleEnvelope) -> Result<()> {
        self.link.current()?.send_envelope(envelope)
    }

    /// Block until everything queued for the scheduler was written.
    /// Returns false when the connection closed first.
    pub fn sync_send_to_scheduler(&self) -> Result<bool> {
        let conn = self.link.current()?;
        let poll = Duration::from_millis(self.config.capsule.sync_send_poll_ms.max(1));
        Ok(conn.sync_send(&self.flush_abort, poll))
    }

    /// Stop in order: report loops drain their traces, queued sends are
    /// flushed, then the transport goes down.
    pub fn shutdown(&self) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }
        self.stop.store(true, Ordering::Release);
        let mut report = ShutdownReport {
            events: self.traces.close(),
            flushed: false,
        };

        report.flushed = match self.sync_send_to_scheduler() {
            Ok(flushed) => flushed,
            Err(err) => {
                tracing::debug!(error = %err, "nothing to flush");
                false
            }
        };

        if let Some(handle) = self.heartbeat.lock().take() {
            if handle.join().is_err() {
                tracing::error!("heartbeat thread panicked");
            }
        }
        if let Some(transport) = self.transport.lock().take() {
            self.flush_abort.store(true, Ordering::Release);
            let _ = transport.shutdown.send(true);
            match transport.handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!(error = %err, "transport ended with error"),
                Err(_) => tracing::error!("transport thread panicked"),
            }
        }
        tracing::info!(
            capsule = %self.global_id(),
            stats = ?report.events,
            flushed = report.flushed,
            "capsule stopped"
        );
        report
    }
}

impl Drop for Capsule {
    fn drop(&mut self) {
        self.shutdown();
    }
}
