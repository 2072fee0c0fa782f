//! SQL store over SQLite.
//!
//! Values are stored as text: a JSON string is stored raw, `null` as SQL
//! NULL, anything else as its compact JSON dump. Reads render every cell as
//! a string, with NULL as "". Table subscribers receive the whole table
//! after each insert into it.

use super::{SubscriptionContext, SubscriptionRegistry, subscribe_with_init};
use crate::connection::ConnId;
use crate::{Error, Result};
use gwatch_codec::payload::SqlQueryResult;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, params_from_iter};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

struct Inner {
    conn: Connection,
    subscriptions: SubscriptionRegistry<SqlQueryResult>,
}

pub struct SqlStore {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlStore").finish_non_exhaustive()
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(Error::invalid_input(format!("invalid SQL identifier {name:?}")))
    }
}

fn to_cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn render(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn run_query(conn: &Connection, sql: &str) -> Result<SqlQueryResult> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let width = columns.len();
    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|i| row.get_ref(i).map(render))
                .collect::<rusqlite::Result<Vec<String>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(SqlQueryResult { columns, rows })
}

fn whole_table(conn: &Connection, table: &str) -> Result<SqlQueryResult> {
    check_identifier(table)?;
    run_query(conn, &format!("SELECT * FROM {table}"))
}

impl SqlStore {
    /// Open a database file, or an in-memory database when `path` is None.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        tracing::debug!(path = ?path, "opened sql store");
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                subscriptions: SubscriptionRegistry::default(),
            }),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(None)
    }

    /// `CREATE TABLE IF NOT EXISTS name schema`. The schema's column list
    /// may omit its parentheses.
    pub fn create_table(&self, name: &str, schema: &str) -> Result<()> {
        check_identifier(name)?;
        let schema = schema.trim();
        let sql = if schema.starts_with('(') {
            format!("CREATE TABLE IF NOT EXISTS {name} {schema}")
        } else {
            format!("CREATE TABLE IF NOT EXISTS {name} ({schema})")
        };
        self.inner.lock().conn.execute(&sql, [])?;
        tracing::debug!(table = %name, "created sql table");
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        check_identifier(name)?;
        self.inner
            .lock()
            .conn
            .execute(&format!("DROP TABLE IF EXISTS {name}"), [])?;
        tracing::debug!(table = %name, "dropped sql table");
        Ok(())
    }

    pub fn insert_row(&self, table: &str, row: &BTreeMap<String, Value>) -> Result<()> {
        self.insert(table, row, "INSERT")
    }

    /// Insert unless a uniqueness constraint already holds the row.
    /// Subscribers are only notified when a row was added.
    pub fn insert_row_if_absent(&self, table: &str, row: &BTreeMap<String, Value>) -> Result<()> {
        self.insert(table, row, "INSERT OR IGNORE")
    }

    fn insert(&self, table: &str, row: &BTreeMap<String, Value>, verb: &str) -> Result<()> {
        check_identifier(table)?;
        if row.is_empty() {
            return Err(Error::invalid_input(format!("empty row for table {table}")));
        }
        for column in row.keys() {
            check_identifier(column)?;
        }
        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "{verb} INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );

        let inner = self.inner.lock();
        let changed = inner
            .conn
            .execute(&sql, params_from_iter(row.values().map(to_cell)))?;
        if changed > 0 && inner.subscriptions.len() > 0 {
            match whole_table(&inner.conn, table) {
                Ok(result) => {
                    inner
                        .subscriptions
                        .notify(|subscribed| subscribed == table, &result, None);
                }
                Err(err) => {
                    tracing::warn!(%table, error = %err, "failed to read table for subscribers");
                }
            }
        }
        Ok(())
    }

    /// Run a read query.
    pub fn query(&self, sql: &str) -> Result<SqlQueryResult> {
        run_query(&self.inner.lock().conn, sql)
    }

    pub fn table(&self, name: &str) -> Result<SqlQueryResult> {
        whole_table(&self.inner.lock().conn, name)
    }

    /// Subscribe to a table. The init callback sees the current rows, or an
    /// empty result when the table does not exist yet.
    pub fn subscribe<U>(
        &self,
        ctx: SubscriptionContext,
        on_update: U,
        on_init: impl FnOnce(&SubscriptionContext, &SqlQueryResult) -> Result<()>,
    ) -> Result<()>
    where
        U: Fn(&SubscriptionContext, &SqlQueryResult, Option<&SqlQueryResult>) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        check_identifier(&ctx.uri)?;
        let mut inner = self.inner.lock();
        let snapshot = whole_table(&inner.conn, &ctx.uri).unwrap_or_default();
        subscribe_with_init(&mut inner.subscriptions, ctx, on_update, &snapshot, on_init)
    }

    pub fn unsubscribe(&self, conn_id: ConnId, sub_id: &str, uri: &str) -> Result<()> {
        self.inner.lock().subscriptions.remove(conn_id, sub_id, uri)
    }

    pub fn release(&self, conn_id: ConnId) -> usize {
        self.inner.lock().subscriptions.release(conn_id)
    }
}
