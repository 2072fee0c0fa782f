//! Key-value store addressed by `/`-separated URIs.

use super::{SubscriptionContext, SubscriptionRegistry, subscribe_with_init};
use crate::connection::ConnId;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Value>,
    subscriptions: SubscriptionRegistry<Value>,
}

#[derive(Default)]
pub struct KvStore {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").field("keys", &self.len()).finish()
    }
}

fn prefix_of(uri: &str) -> Option<&str> {
    uri.strip_suffix('*')
}

fn lookup(data: &BTreeMap<String, Value>, uri: &str) -> Value {
    if let Some(value) = data.get(uri) {
        return value.clone();
    }
    match prefix_of(uri) {
        Some(prefix) => Value::Array(
            data.range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(_, value)| value.clone())
                .collect(),
        ),
        None => Value::String(String::new()),
    }
}

impl KvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` at `uri`. Subscribers whose uri is contained in `uri`
    /// receive `(new, old)`.
    pub fn insert(&self, uri: &str, value: Value) -> Result<()> {
        if !uri.starts_with('/') {
            return Err(Error::invalid_input(format!("kv uri must start with '/': {uri:?}")));
        }
        let mut inner = self.inner.lock();
        let old = inner.data.get(uri).cloned();
        if old.is_some() {
            tracing::warn!(%uri, "kv resource exists, overwriting");
        }
        inner
            .subscriptions
            .notify(|subscribed| uri.contains(subscribed), &value, old.as_ref());
        inner.data.insert(uri.to_string(), value);
        tracing::debug!(%uri, "kv resource set");
        Ok(())
    }

    /// Exact lookup, or a prefix query when `uri` ends in `*` (JSON array).
    /// A miss yields an empty string.
    #[must_use]
    pub fn query(&self, uri: &str) -> Value {
        lookup(&self.inner.lock().data, uri)
    }

    /// Remove `uri`, or every key under a `*` prefix. Returns the count.
    pub fn delete(&self, uri: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.data.remove(uri).is_some() {
            return Ok(1);
        }
        let Some(prefix) = prefix_of(uri) else {
            return Err(Error::not_exist(format!("kv resource {uri}")));
        };
        let before = inner.data.len();
        inner.data.retain(|key, _| !key.starts_with(prefix));
        Ok(before - inner.data.len())
    }

    pub fn subscribe<U>(
        &self,
        ctx: SubscriptionContext,
        on_update: U,
        on_init: impl FnOnce(&SubscriptionContext, &Value) -> Result<()>,
    ) -> Result<()>
    where
        U: Fn(&SubscriptionContext, &Value, Option<&Value>) -> Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let snapshot = lookup(&inner.data, &ctx.uri);
        subscribe_with_init(&mut inner.subscriptions, ctx, on_update, &snapshot, on_init)
    }

    pub fn unsubscribe(&self, conn_id: ConnId, sub_id: &str, uri: &str) -> Result<()> {
        self.inner.lock().subscriptions.remove(conn_id, sub_id, uri)
    }

    pub fn release(&self, conn_id: ConnId) -> usize {
        self.inner.lock().subscriptions.release(conn_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Role;
    use crate::connection::testing::connected;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn insert_requires_leading_slash() {
        let store = KvStore::new();
        let err = store.insert("capsule/a", json!(1)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
        store.insert("/capsule/a", json!(1)).unwrap();
        assert_eq!(store.query("/capsule/a"), json!(1));
    }

    #[test]
    fn miss_is_empty_string_and_prefix_is_array() {
        let store = KvStore::new();
        store.insert("/p/0/metrics", json!({"a": 1})).unwrap();
        store.insert("/p/1/metrics", json!({"a": 2})).unwrap();
        store.insert("/q", json!(3)).unwrap();
        assert_eq!(store.query("/nothing"), json!(""));
        assert_eq!(store.query("/p/*"), json!([{"a": 1}, {"a": 2}]));
        assert_eq!(store.query("/z*"), json!([]));
    }

    #[test]
    fn delete_exact_and_prefix() {
        let store = KvStore::new();
        for uri in ["/a/1", "/a/2", "/b"] {
            store.insert(uri, json!(0)).unwrap();
        }
        assert_eq!(store.delete("/b").unwrap(), 1);
        assert!(store.delete("/b").is_err());
        assert_eq!(store.delete("/a/*").unwrap(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn subscribers_match_by_containment_and_see_old_value() {
        let store = KvStore::new();
        let conn = connected(Role::Gtrace);
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let init_seen = Arc::new(PlMutex::new(None));
        store.insert("/profiler/0/metrics", json!(1)).unwrap();

        let updates = Arc::clone(&seen);
        let init = Arc::clone(&init_seen);
        store
            .subscribe(
                SubscriptionContext::new(Arc::clone(&conn), "sub", "/profiler/0"),
                move |_: &SubscriptionContext, new: &Value, old: Option<&Value>| {
                    updates.lock().push((new.clone(), old.cloned()));
                    Ok(())
                },
                move |_, snapshot| {
                    *init.lock() = Some(snapshot.clone());
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(*init_seen.lock(), Some(json!("")));

        store.insert("/profiler/0/metrics", json!(2)).unwrap();
        store.insert("/profiler/1/metrics", json!(9)).unwrap();
        assert_eq!(*seen.lock(), [(json!(2), Some(json!(1)))]);

        store.unsubscribe(conn.id(), "sub", "/profiler/0").unwrap();
        store.insert("/profiler/0/metrics", json!(3)).unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(store.release(conn.id()), 0);
    }
}
