//! Shared harness: a broker on an ephemeral port plus a recording gtrace
//! client.

#![allow(dead_code)]

use gwatch_codec::GtraceEnvelope;
use gwatch_core::broker::{Broker, LoggingProfilerLauncher};
use gwatch_core::capsule::{Capsule, Topology};
use gwatch_core::config::Config;
use gwatch_core::connection::{ConnectionInstance, Role};
use gwatch_core::report::{DeviceSync, NoDevice};
use gwatch_core::store::SqlStore;
use gwatch_core::transport::{self, ConnectionEvents, TransportOptions};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub struct Scheduler {
    pub runtime: Runtime,
    pub broker: Arc<Broker>,
    pub launcher: Arc<LoggingProfilerLauncher>,
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn start() -> Self {
        let runtime = Runtime::new().unwrap();
        let launcher = Arc::new(LoggingProfilerLauncher::new());
        let sql = SqlStore::in_memory().unwrap();
        let broker = Arc::new(Broker::new(sql, launcher.clone()).unwrap());
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let options = TransportOptions::default();
        runtime.spawn(Arc::clone(&broker).serve(listener, options, shutdown_rx));
        Self {
            runtime,
            broker,
            launcher,
            addr,
            shutdown,
        }
    }

    pub fn capsule(&self) -> Capsule {
        self.capsule_with_device(Arc::new(NoDevice))
    }

    pub fn capsule_with_device(&self, device: Arc<dyn DeviceSync>) -> Capsule {
        let mut config = Config::default();
        config.capsule.scheduler_ip = self.addr.ip().to_string();
        config.capsule.scheduler_port = self.addr.port();
        config.capsule.shutdown_grace_ms = 200;
        let topology = Topology::detect(self.addr.ip());
        Capsule::new(config, topology, device)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// A gtrace client that records every message it receives.
#[derive(Default)]
pub struct Recorder {
    pub conn: Mutex<Option<Arc<ConnectionInstance>>>,
    received: Mutex<Vec<GtraceEnvelope>>,
}

impl ConnectionEvents for Recorder {
    fn on_connect(&self, conn: &Arc<ConnectionInstance>) {
        *self.conn.lock() = Some(Arc::clone(conn));
    }

    fn on_message(&self, _conn: &Arc<ConnectionInstance>, message: Vec<u8>) {
        self.received.lock().push(GtraceEnvelope::decode_bytes(&message).unwrap());
    }

    fn on_disconnect(&self, _conn: &Arc<ConnectionInstance>) {
        *self.conn.lock() = None;
    }
}

impl Recorder {
    pub fn connect(scheduler: &Scheduler) -> (Arc<Self>, watch::Sender<bool>) {
        let recorder = Arc::new(Self::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        scheduler.runtime.spawn(transport::connect(
            scheduler.addr.to_string(),
            Role::Gtrace,
            Arc::clone(&recorder),
            TransportOptions::default(),
            WAIT,
            shutdown_rx,
        ));
        eventually("gtrace connection", || recorder.conn.lock().is_some());
        (recorder, shutdown)
    }

    pub fn send(&self, envelope: GtraceEnvelope) {
        let conn = self.conn.lock().clone().unwrap();
        conn.send_envelope(&envelope).unwrap();
    }

    pub fn with_ref(&self, ref_id: &str) -> Vec<GtraceEnvelope> {
        self.received
            .lock()
            .iter()
            .filter(|envelope| envelope.ref_id == ref_id)
            .cloned()
            .collect()
    }
}

