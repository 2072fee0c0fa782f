//! In-process stores behind the broker: key-value, time-series and SQL.
//!
//! All three expose the same subscription contract. `subscribe` registers a
//! [`SubscriptionContext`] and runs the init callback with the store's data
//! lock held, so the subscriber's initial stream is never overtaken by an
//! update. After every successful write the store calls the update callback
//! of each matching context; a failing callback is logged and the write
//! stands.

pub mod kv;
pub mod sql;
pub mod ts;

pub use kv::KvStore;
pub use sql::SqlStore;
pub use ts::{TsSample, TsStore};

use crate::connection::{ConnId, ConnectionInstance};
use crate::{Error, Result};
use std::sync::Arc;

/// One subscriber of one resource.
#[derive(Debug, Clone)]
pub struct SubscriptionContext {
    pub conn: Arc<ConnectionInstance>,
    /// The subscribe request's `ref_id`.
    pub sub_id: String,
    pub uri: String,
}

impl SubscriptionContext {
    pub fn new(
        conn: Arc<ConnectionInstance>,
        sub_id: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            sub_id: sub_id.into(),
            uri: uri.into(),
        }
    }

    #[must_use]
    pub fn conn_id(&self) -> ConnId {
        self.conn.id()
    }

    fn same_key(&self, conn_id: ConnId, sub_id: &str, uri: &str) -> bool {
        self.conn_id() == conn_id && self.sub_id == sub_id && self.uri == uri
    }
}

/// Called after a write with `(context, new value, old value)`.
pub type UpdateFn<V> =
    Box<dyn Fn(&SubscriptionContext, &V, Option<&V>) -> Result<()> + Send + Sync>;

struct Subscription<V> {
    ctx: SubscriptionContext,
    on_update: UpdateFn<V>,
}

/// Subscription contexts of one store. Callers hold the store lock.
pub(crate) struct SubscriptionRegistry<V> {
    entries: Vec<Subscription<V>>,
}

impl<V> Default for SubscriptionRegistry<V> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<V> SubscriptionRegistry<V> {
    /// At most one context per (connection, sub id, uri).
    pub(crate) fn add<F>(&mut self, ctx: SubscriptionContext, on_update: F) -> Result<()>
    where
        F: Fn(&SubscriptionContext, &V, Option<&V>) -> Result<()> + Send + Sync + 'static,
    {
        if self
            .entries
            .iter()
            .any(|entry| entry.ctx.same_key(ctx.conn_id(), &ctx.sub_id, &ctx.uri))
        {
            tracing::warn!(
                conn_id = ctx.conn_id(),
                ref_id = %ctx.sub_id,
                uri = %ctx.uri,
                "duplicate subscription ignored"
            );
            return Err(Error::already_exist(format!(
                "subscription {} on {}",
                ctx.sub_id, ctx.uri
            )));
        }
        self.entries.push(Subscription {
            ctx,
            on_update: Box::new(on_update),
        });
        Ok(())
    }

    pub(crate) fn remove(&mut self, conn_id: ConnId, sub_id: &str, uri: &str) -> Result<()> {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !entry.ctx.same_key(conn_id, sub_id, uri));
        if self.entries.len() == before {
            tracing::warn!(conn_id, ref_id = %sub_id, %uri, "unsubscribe of unknown subscription");
            return Err(Error::not_exist(format!("subscription {sub_id} on {uri}")));
        }
        Ok(())
    }

    /// Drop every context owned by `conn_id`. Returns how many went.
    pub(crate) fn release(&mut self, conn_id: ConnId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.ctx.conn_id() != conn_id);
        before - self.entries.len()
    }

    /// Run the update callback of every context whose uri satisfies
    /// `matches`. Returns the number of callbacks that failed.
    pub(crate) fn notify(&self, matches: impl Fn(&str) -> bool, new: &V, old: Option<&V>) -> usize {
        let mut failures = 0;
        for entry in self.entries.iter().filter(|entry| matches(&entry.ctx.uri)) {
            if let Err(err) = (entry.on_update)(&entry.ctx, new, old) {
                failures += 1;
                tracing::warn!(
                    conn_id = entry.ctx.conn_id(),
                    ref_id = %entry.ctx.sub_id,
                    uri = %entry.ctx.uri,
                    error = %err,
                    "subscription update failed"
                );
            }
        }
        failures
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Register `ctx` and run `on_init` on the current snapshot. If the init
/// callback fails the registration is rolled back.
pub(crate) fn subscribe_with_init<V, S, F, I>(
    registry: &mut SubscriptionRegistry<V>,
    ctx: SubscriptionContext,
    on_update: F,
    snapshot: &S,
    on_init: I,
) -> Result<()>
where
    S: ?Sized,
    F: Fn(&SubscriptionContext, &V, Option<&V>) -> Result<()> + Send + Sync + 'static,
    I: FnOnce(&SubscriptionContext, &S) -> Result<()>,
{
    let key = ctx.clone();
    registry.add(ctx, on_update)?;
    if let Err(err) = on_init(&key, snapshot) {
        tracing::warn!(
            conn_id = key.conn_id(),
            ref_id = %key.sub_id,
            uri = %key.uri,
            error = %err,
            "subscription init failed"
        );
        let _ = registry.remove(key.conn_id(), &key.sub_id, &key.uri);
        return Err(err);
    }
    tracing::debug!(conn_id = key.conn_id(), ref_id = %key.sub_id, uri = %key.uri, "subscribed");
    Ok(())
}

/// Every store, shared by the broker's handlers.
pub struct Stores {
    pub kv: KvStore,
    pub ts: TsStore,
    pub sql: SqlStore,
}

impl Stores {
    pub fn new(sql: SqlStore) -> Self {
        Self {
            kv: KvStore::new(),
            ts: TsStore::new(),
            sql,
        }
    }

    /// Drop every subscription owned by a connection.
    pub fn release(&self, conn_id: ConnId) -> usize {
        self.kv.release(conn_id) + self.ts.release(conn_id) + self.sql.release(conn_id)
    }
}
