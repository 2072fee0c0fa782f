//! Scheduler session manager.
//!
//! The broker owns every live connection, keyed by role. The transport hands
//! it one complete message at a time per connection, so handlers of one
//! connection never overlap while different connections run concurrently.
//! Each message is decoded against its role's channel registry and routed
//! by payload kind to the handlers in [`capsule`], [`gtrace`] and
//! [`profiler`]. A failing handler is logged and affects only its own
//! message.

pub mod capsule;
pub mod gtrace;
pub mod profiler;
pub mod topology;

use crate::agent::AgentRegistry;
use crate::config::Config;
use crate::connection::{ConnId, ConnectionInstance, Role};
use crate::store::{SqlStore, Stores};
use crate::transport::{self, ConnectionEvents, TransportOptions};
use crate::{Error, Result};
use gwatch_codec::capsule::CapsuleRegister;
use gwatch_codec::{CapsuleEnvelope, ChannelPayload, Envelope, ProfilerEnvelope};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Starts the per-host profiling worker. Implementations must return
/// promptly; the broker calls them from a connection's accept path.
pub trait ProfilerLauncher: Send + Sync {
    fn launch(&self, ip: IpAddr) -> Result<()>;
}

/// Records launch requests without starting anything.
#[derive(Debug, Default)]
pub struct LoggingProfilerLauncher {
    launched: Mutex<Vec<IpAddr>>,
}

impl LoggingProfilerLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn launched(&self) -> Vec<IpAddr> {
        self.launched.lock().clone()
    }
}

impl ProfilerLauncher for LoggingProfilerLauncher {
    fn launch(&self, ip: IpAddr) -> Result<()> {
        tracing::info!(%ip, "profiler launch requested");
        self.launched.lock().push(ip);
        Ok(())
    }
}

type ConnMap = HashMap<ConnId, Arc<ConnectionInstance>>;

/// How many closed capsule connections are remembered.
pub const DISCONNECTED_CAPSULES_KEPT: usize = 64;

#[derive(Default)]
struct Sessions {
    capsules: ConnMap,
    /// Capsules that went away, oldest first; kept for handler completions
    /// that arrive late.
    disconnected_capsules: VecDeque<Arc<ConnectionInstance>>,
    gtraces: ConnMap,
    profilers: ConnMap,
    /// IPs with at least one live capsule.
    active_ips: HashMap<IpAddr, usize>,
    profiler_ips: HashSet<IpAddr>,
    capsule_by_global_id: HashMap<String, Arc<ConnectionInstance>>,
}

impl Sessions {
    fn map_mut(&mut self, role: Role) -> &mut ConnMap {
        match role {
            Role::Capsule => &mut self.capsules,
            Role::Gtrace => &mut self.gtraces,
            Role::Profiler => &mut self.profilers,
        }
    }
}

/// Live connection counts per role.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionCounts {
    pub capsules: usize,
    pub disconnected_capsules: usize,
    pub gtraces: usize,
    pub profilers: usize,
}

pub struct Broker {
    stores: Stores,
    agents: AgentRegistry,
    launcher: Arc<dyn ProfilerLauncher>,
    sessions: Mutex<Sessions>,
    next_ref: AtomicU64,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("sessions", &self.session_counts())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Build a broker over `sql` and create the topology tables.
    pub fn new(sql: SqlStore, launcher: Arc<dyn ProfilerLauncher>) -> Result<Self> {
        topology::bootstrap(&sql)?;
        Ok(Self {
            stores: Stores::new(sql),
            agents: AgentRegistry::new(),
            launcher,
            sessions: Mutex::new(Sessions::default()),
            next_ref: AtomicU64::new(0),
        })
    }

    /// Open the configured SQL store and build a broker over it.
    pub fn from_config(config: &Config, launcher: Arc<dyn ProfilerLauncher>) -> Result<Self> {
        let sql = SqlStore::open(config.scheduler.sql_db_path.as_deref())?;
        Self::new(sql, launcher)
    }

    /// Serve connections on `listener` until `shutdown` flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        options: TransportOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        transport::serve(listener, self, options, shutdown).await
    }

    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    #[must_use]
    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    #[must_use]
    pub fn session_counts(&self) -> SessionCounts {
        let sessions = self.sessions.lock();
        SessionCounts {
            capsules: sessions.capsules.len(),
            disconnected_capsules: sessions.disconnected_capsules.len(),
            gtraces: sessions.gtraces.len(),
            profilers: sessions.profilers.len(),
        }
    }

    /// The live capsule that registered under `global_id`.
    #[must_use]
    pub fn capsule_by_global_id(&self, global_id: &str) -> Option<Arc<ConnectionInstance>> {
        self.sessions.lock().capsule_by_global_id.get(global_id).cloned()
    }

    #[must_use]
    pub fn active_ips(&self) -> Vec<IpAddr> {
        self.sessions.lock().active_ips.keys().copied().collect()
    }

    /// Ask the launcher for a profiler on `ip`, at most once per IP.
    pub fn launch_profiler(&self, ip: IpAddr) -> Result<()> {
        if !self.sessions.lock().profiler_ips.insert(ip) {
            tracing::debug!(%ip, "profiler already launched");
            return Err(Error::already_exist(format!("profiler for {ip}")));
        }
        if let Err(err) = self.launcher.launch(ip) {
            self.sessions.lock().profiler_ips.remove(&ip);
            return Err(err);
        }
        Ok(())
    }

    /// Send to the profiler connected from `ip`.
    pub fn send_to_profiler(&self, ip: IpAddr, envelope: &ProfilerEnvelope) -> Result<()> {
        let conn = self
            .sessions
            .lock()
            .profilers
            .values()
            .find(|conn| conn.peer_ip() == Some(ip))
            .cloned()
            .ok_or_else(|| Error::not_exist(format!("profiler connection from {ip}")))?;
        conn.send_envelope(envelope)
    }

    fn next_ref_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_ref.fetch_add(1, Ordering::Relaxed))
    }

    fn register_capsule(&self, conn: &Arc<ConnectionInstance>) {
        let first_from_ip = {
            let mut sessions = self.sessions.lock();
            sessions.capsules.insert(conn.id(), Arc::clone(conn));
            conn.peer_ip().is_some_and(|ip| {
                let count = sessions.active_ips.entry(ip).or_insert(0);
                *count += 1;
                *count == 1
            })
        };
        if let (true, Some(ip)) = (first_from_ip, conn.peer_ip()) {
            match self.launch_profiler(ip) {
                Ok(()) | Err(Error::AlreadyExist(_)) => {}
                Err(err) => tracing::warn!(%ip, error = %err, "profiler launch failed"),
            }
        }

        let request =
            CapsuleEnvelope::new(self.next_ref_id("register"), CapsuleRegister::default());
        if let Err(err) = conn.send_envelope(&request) {
            tracing::warn!(conn_id = conn.id(), error = %err, "failed to send REGISTER request");
        }
    }

    pub(crate) fn index_capsule(&self, global_id: &str, conn: &Arc<ConnectionInstance>) {
        self.sessions
            .lock()
            .capsule_by_global_id
            .insert(global_id.to_string(), Arc::clone(conn));
    }

    fn handle<P, F>(&self, conn: &Arc<ConnectionInstance>, message: &[u8], route: F)
    where
        P: ChannelPayload,
        F: FnOnce(&Self, &Arc<ConnectionInstance>, &Envelope<P>) -> Result<()>,
    {
        let envelope = match Envelope::<P>::decode_bytes(message) {
            Ok(envelope) => envelope,
            Err(err) => {
                metrics::counter!("broker.messages.dropped", "channel" => P::CHANNEL).increment(1);
                tracing::warn!(
                    conn_id = conn.id(),
                    role = %conn.role(),
                    error = %err,
                    "dropping undecodable message"
                );
                return;
            }
        };
        tracing::trace!(
            conn_id = conn.id(),
            type_id = envelope.type_id(),
            ref_id = %envelope.ref_id,
            payload = envelope.payload_name(),
            "dispatch"
        );
        metrics::counter!(
            "broker.messages.handled",
            "channel" => P::CHANNEL,
            "payload" => envelope.payload_name()
        )
        .increment(1);
        if let Err(err) = route(self, conn, &envelope) {
            tracing::warn!(
                conn_id = conn.id(),
                role = %conn.role(),
                type_id = envelope.type_id(),
                ref_id = %envelope.ref_id,
                error = %err,
                "handler failed"
            );
        }
    }
}

impl ConnectionEvents for Broker {
    fn on_connect(&self, conn: &Arc<ConnectionInstance>) {
        tracing::info!(
            conn_id = conn.id(),
            role = %conn.role(),
            peer = ?conn.peer_ip(),
            "session opened"
        );
        match conn.role() {
            Role::Capsule => self.register_capsule(conn),
            role => {
                self.sessions.lock().map_mut(role).insert(conn.id(), Arc::clone(conn));
            }
        }
    }

    fn on_message(&self, conn: &Arc<ConnectionInstance>, message: Vec<u8>) {
        match conn.role() {
            Role::Capsule => self.handle(conn, &message, capsule::route),
            Role::Gtrace => self.handle(conn, &message, gtrace::route),
            Role::Profiler => self.handle(conn, &message, profiler::route),
        }
    }

    fn on_disconnect(&self, conn: &Arc<ConnectionInstance>) {
        let released = self.stores.release(conn.id());
        let mut sessions = self.sessions.lock();
        let Some(conn) = sessions.map_mut(conn.role()).remove(&conn.id()) else {
            return;
        };
        if conn.role() == Role::Capsule {
            if let Some(ip) = conn.peer_ip() {
                if let Some(count) = sessions.active_ips.get_mut(&ip) {
                    *count -= 1;
                    if *count == 0 {
                        sessions.active_ips.remove(&ip);
                    }
                }
            }
            sessions
                .capsule_by_global_id
                .retain(|_, indexed| indexed.id() != conn.id());
            sessions.disconnected_capsules.push_back(Arc::clone(&conn));
            while sessions.disconnected_capsules.len() > DISCONNECTED_CAPSULES_KEPT {
                sessions.disconnected_capsules.pop_front();
            }
        }
        tracing::info!(conn_id = conn.id(), role = %conn.role(), released, "session closed");
    }
}

pub(crate) fn reply<P: ChannelPayload>(
    conn: &ConnectionInstance,
    request: &Envelope<P>,
    payload: impl Into<P>,
) -> Result<()> {
    conn.send_envelope(&request.reply(payload))
}
