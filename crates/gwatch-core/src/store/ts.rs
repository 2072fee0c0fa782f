//! Append-only time-series store keyed by exact URI.

use super::{SubscriptionContext, SubscriptionRegistry, subscribe_with_init};
use crate::connection::ConnId;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One sample of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsSample {
    pub index: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub end_timestamp: u64,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Default)]
struct Inner {
    series: HashMap<String, Vec<TsSample>>,
    subscriptions: SubscriptionRegistry<TsSample>,
}

#[derive(Default)]
pub struct TsStore {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for TsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsStore")
            .field("series", &self.inner.lock().series.len())
            .finish()
    }
}

impl TsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. Subscribers of exactly `uri` receive it.
    pub fn append(&self, uri: &str, sample: TsSample) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .subscriptions
            .notify(|subscribed| subscribed == uri, &sample, None);
        inner.series.entry(uri.to_string()).or_default().push(sample);
        Ok(())
    }

    /// Every sample of `uri` in append order.
    pub fn query(&self, uri: &str) -> Result<Vec<TsSample>> {
        self.inner.lock().series.get(uri).cloned().ok_or_else(|| {
            tracing::warn!(%uri, "time series not found");
            Error::not_exist(format!("time series {uri}"))
        })
    }

    pub fn subscribe<U>(
        &self,
        ctx: SubscriptionContext,
        on_update: U,
        on_init: impl FnOnce(&SubscriptionContext, &[TsSample]) -> Result<()>,
    ) -> Result<()>
    where
        U: Fn(&SubscriptionContext, &TsSample, Option<&TsSample>) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        let mut inner = self.inner.lock();
        let Inner {
            series,
            subscriptions,
        } = &mut *inner;
        let snapshot: &[TsSample] = series.get(&ctx.uri).map(Vec::as_slice).unwrap_or(&[]);
        subscribe_with_init(subscriptions, ctx, on_update, snapshot, on_init)
    }

    pub fn unsubscribe(&self, conn_id: ConnId, sub_id: &str, uri: &str) -> Result<()> {
        self.inner.lock().subscriptions.remove(conn_id, sub_id, uri)
    }

    pub fn release(&self, conn_id: ConnId) -> usize {
        self.inner.lock().subscriptions.release(conn_id)
    }
}
