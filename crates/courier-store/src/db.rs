//! Shared SQLite plumbing: connection handle, blocking dispatch, timestamps

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Connection slot shared between clones of a store. `None` once closed.
pub(crate) type SharedConn = Arc<Mutex<Option<Connection>>>;

/// Open (or create) a database file and apply the schema
pub(crate) fn open_file(path: &Path, schema: &str) -> StoreResult<SharedConn> {
    let conn = Connection::open(path)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!("Opened {:?} (journal_mode={})", path, mode);
    prepare(conn, schema)
}

pub(crate) fn open_memory(schema: &str) -> StoreResult<SharedConn> {
    prepare(Connection::open_in_memory()?, schema)
}

fn prepare(conn: Connection, schema: &str) -> StoreResult<SharedConn> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(schema)?;
    debug!("Database schema initialized successfully");
    Ok(Arc::new(Mutex::new(Some(conn))))
}

/// Run `f` against the connection on the blocking pool
pub(crate) async fn with_conn<T, F>(conn: &SharedConn, f: F) -> StoreResult<T>
where
    F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock().unwrap_or_else(|poisoned| {
            warn!("Database mutex was poisoned, recovering");
            poisoned.into_inner()
        });
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    })
    .await?
}

/// Drop the connection. Returns false if it was already closed.
pub(crate) async fn close(conn: &SharedConn) -> StoreResult<bool> {
    let conn = Arc::clone(conn);
    let closed = tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.take().is_some()
    })
    .await?;
    Ok(closed)
}

/// Fixed-width RFC 3339 so that text comparison matches time ordering
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|_| Utc::now())
}

/// `now - age`, saturating at the earliest representable instant
pub(crate) fn cutoff(age: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(age).unwrap_or(TimeDelta::MAX);
    Utc::now()
        .checked_sub_signed(delta)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn json_column(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering_is_lexicographic() {
        let earlier = ts(Utc::now());
        let later = ts(Utc::now() + TimeDelta::milliseconds(5));
        assert!(earlier < later);
        assert_eq!(earlier.len(), later.len());
    }

    #[test]
    fn test_cutoff_saturates() {
        let far = cutoff(Duration::from_secs(u64::MAX));
        assert!(far < Utc::now());
    }

    #[test]
    fn test_parse_ts_roundtrip() {
        let now = Utc::now();
        let parsed = parse_ts(&ts(now));
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }
}
