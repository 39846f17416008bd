// Outbox: domain events pending downstream delivery
//
// Entries are only ever written through `Outbox::append`, which requires an
// open store transaction. An event therefore becomes visible in the same
// commit as the state change that produced it, never before.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{clamp_limit, timestamp_from_sql, timestamp_to_sql};
use crate::error::{LedgerError, Result};

/// Emitted once per committed transaction.
pub const TRANSACTION_CREATED: &str = "transaction.created";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventOutboxEntry {
    pub id: i64,
    /// Stable identity for consumers that deduplicate deliveries
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// None = not yet delivered
    pub processed_at: Option<DateTime<Utc>>,
}

impl EventOutboxEntry {
    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let payload: String = row.get(3)?;
        let created_at: String = row.get(4)?;
        let processed_at: Option<String> = row.get(5)?;

        Ok(EventOutboxEntry {
            id: row.get(0)?,
            event_id: row.get(1)?,
            event_type: row.get(2)?,
            payload: serde_json::from_str(&payload).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
            })?,
            created_at: timestamp_from_sql(4, &created_at)?,
            processed_at: processed_at
                .map(|raw| timestamp_from_sql(5, &raw))
                .transpose()?,
        })
    }
}

/// Consumer-side view of the outbox.
pub struct Outbox<'c> {
    conn: &'c Connection,
}

impl<'c> Outbox<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Outbox { conn }
    }

    /// Write one event inside the caller's unit of work.
    pub fn append(
        tx: &rusqlite::Transaction<'_>,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<EventOutboxEntry> {
        let event_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();

        tx.execute(
            "INSERT INTO events_outbox (event_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event_id,
                event_type,
                serde_json::to_string(payload)?,
                timestamp_to_sql(&created_at),
            ],
        )?;

        let entry = EventOutboxEntry {
            id: tx.last_insert_rowid(),
            event_id,
            event_type: event_type.to_string(),
            payload: payload.clone(),
            created_at,
            processed_at: None,
        };

        debug!(outbox_id = entry.id, event_type, "outbox event appended");

        Ok(entry)
    }

    /// Undelivered entries, oldest first.
    pub fn pending(&self, limit: i64) -> Result<Vec<EventOutboxEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_id, event_type, payload, created_at, processed_at
             FROM events_outbox
             WHERE processed_at IS NULL
             ORDER BY id ASC
             LIMIT ?1",
        )?;

        let entries = stmt
            .query_map([clamp_limit(limit)], EventOutboxEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    /// Mark one entry delivered. Entries are marked at most once.
    pub fn mark_processed(&self, id: i64) -> Result<DateTime<Utc>> {
        let processed_at = Utc::now();
        let updated = self.conn.execute(
            "UPDATE events_outbox SET processed_at = ?1 WHERE id = ?2 AND processed_at IS NULL",
            params![timestamp_to_sql(&processed_at), id],
        )?;

        if updated == 0 {
            return Err(LedgerError::NotFound(format!("pending outbox entry {}", id)));
        }

        debug!(outbox_id = id, "outbox event marked processed");
        Ok(processed_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_rows, open_in_memory, Table};

    #[test]
    fn test_append_and_drain() {
        let mut conn = open_in_memory().unwrap();

        let tx = conn.transaction().unwrap();
        let first = Outbox::append(&tx, TRANSACTION_CREATED, &serde_json::json!({"n": 1})).unwrap();
        let second = Outbox::append(&tx, TRANSACTION_CREATED, &serde_json::json!({"n": 2})).unwrap();
        tx.commit().unwrap();

        assert_ne!(first.event_id, second.event_id);

        let outbox = Outbox::new(&conn);
        let pending = outbox.pending(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload["n"], 1);
        assert!(pending.iter().all(EventOutboxEntry::is_pending));

        outbox.mark_processed(first.id).unwrap();
        let pending = outbox.pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
    }

    #[test]
    fn test_mark_processed_only_once() {
        let mut conn = open_in_memory().unwrap();

        let tx = conn.transaction().unwrap();
        let entry = Outbox::append(&tx, "test.event", &serde_json::json!({})).unwrap();
        tx.commit().unwrap();

        let outbox = Outbox::new(&conn);
        outbox.mark_processed(entry.id).unwrap();

        assert!(matches!(
            outbox.mark_processed(entry.id),
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(outbox.mark_processed(999), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_rolled_back_append_leaves_nothing() {
        let mut conn = open_in_memory().unwrap();

        let tx = conn.transaction().unwrap();
        Outbox::append(&tx, TRANSACTION_CREATED, &serde_json::json!({})).unwrap();
        drop(tx); // rollback on drop

        assert_eq!(count_rows(&conn, Table::EventsOutbox).unwrap(), 0);
    }
}
