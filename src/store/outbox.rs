use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use selfheal_common::OutboxEvent;
use selfheal_common::time::format_ts;

use super::{PipelineDb, ScanBatch};

const EVENT_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, published, attempts, last_error, created_at, published_at";

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(OutboxEvent, String)> {
    let payload: String = row.get(4)?;
    Ok((
        OutboxEvent {
            id: row.get(0)?,
            aggregate_type: row.get(1)?,
            aggregate_id: row.get(2)?,
            event_type: row.get(3)?,
            payload: serde_json::Value::Null,
            published: row.get(5)?,
            attempts: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
            published_at: row.get(9)?,
        },
        payload,
    ))
}

fn decode((mut event, payload): (OutboxEvent, String)) -> Result<OutboxEvent, (OutboxEvent, String)> {
    match serde_json::from_str(&payload) {
        Ok(value) => {
            event.payload = value;
            Ok(event)
        }
        Err(e) => {
            event.payload = serde_json::Value::String(payload);
            Err((event, format!("malformed payload: {}", e)))
        }
    }
}

/// Read-side decode: an unparseable payload is surfaced as its raw text.
fn decode_lossy(row: (OutboxEvent, String)) -> OutboxEvent {
    decode(row).unwrap_or_else(|(event, _)| event)
}

/// Append an event on `conn`. Pass a transaction to couple the event with
/// the business write that produced it.
pub fn insert_outbox_event(
    conn: &Connection,
    aggregate_type: &str,
    aggregate_id: &str,
    event_type: &str,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO outbox_events (id, aggregate_type, aggregate_id, event_type, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            aggregate_type,
            aggregate_id,
            event_type,
            payload.to_string(),
            format_ts(now)
        ],
    )
    .context("Failed to insert outbox event")?;
    Ok(id)
}

impl PipelineDb {
    pub fn enqueue_event(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<String> {
        insert_outbox_event(&self.conn, aggregate_type, aggregate_id, event_type, payload, now)
    }

    /// Oldest unpublished events first, insertion order breaking ties.
    /// A row whose payload does not parse is parked (never fetched again,
    /// reason kept in `last_error`) and counted in `skipped`, so it cannot
    /// hold up the events behind it.
    pub fn fetch_unpublished(&self, limit: i64) -> Result<ScanBatch<OutboxEvent>> {
        let sql = format!(
            "SELECT {} FROM outbox_events WHERE published = 0 AND parked = 0
             ORDER BY created_at ASC, rowid ASC LIMIT ?1",
            EVENT_COLUMNS
        );
        let mut undecodable = Vec::new();
        let mut batch = ScanBatch::default();
        {
            let mut stmt = self
                .conn
                .prepare(&sql)
                .context("Failed to prepare fetch_unpublished")?;
            let rows = stmt
                .query_map(params![limit], event_from_row)
                .context("Failed to query unpublished events")?;
            for row in rows {
                match row.map(decode) {
                    Ok(Ok(event)) => batch.rows.push(event),
                    Ok(Err((event, reason))) => undecodable.push((event.id, reason)),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable outbox row");
                        batch.skipped += 1;
                    }
                }
            }
        }
        for (id, reason) in undecodable {
            tracing::warn!(event_id = %id, reason = %reason, "parking outbox event");
            self.park_event(&id, &reason)?;
            batch.skipped += 1;
        }
        Ok(batch)
    }

    fn park_event(&self, id: &str, reason: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE outbox_events SET parked = 1, attempts = attempts + 1, last_error = ?1
                 WHERE id = ?2 AND published = 0",
                params![reason, id],
            )
            .context("Failed to park outbox event")?;
        Ok(())
    }

    /// Flip `published` false → true. Returns `false` when the row was
    /// already published (a concurrent publisher marked it first).
    pub fn mark_published(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE outbox_events SET published = 1, published_at = ?1
                 WHERE id = ?2 AND published = 0",
                params![format_ts(now), id],
            )
            .context("Failed to mark event published")?;
        Ok(changed > 0)
    }

    /// Count a failed send. The row stays unpublished and is retried.
    pub fn record_publish_failure(&self, id: &str, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE outbox_events SET attempts = attempts + 1, last_error = ?1
                 WHERE id = ?2 AND published = 0",
                params![error, id],
            )
            .context("Failed to record publish failure")?;
        Ok(())
    }

    pub fn get_outbox_event(&self, id: &str) -> Result<Option<OutboxEvent>> {
        let sql = format!("SELECT {} FROM outbox_events WHERE id = ?1", EVENT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], event_from_row)
            .optional()
            .context("Failed to query outbox event")?;
        Ok(row.map(decode_lossy))
    }

    /// Newest first, optionally filtered on `published`.
    pub fn list_outbox_events(&self, published: Option<bool>, limit: i64) -> Result<Vec<OutboxEvent>> {
        let sql = format!(
            "SELECT {} FROM outbox_events WHERE (?1 IS NULL OR published = ?1)
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            EVENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_outbox_events")?;
        let rows = stmt
            .query_map(params![published, limit], event_from_row)
            .context("Failed to query outbox events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(decode_lossy(row.context("Failed to read outbox row")?));
        }
        Ok(events)
    }

    /// Write an outbox row with an arbitrary payload text.
    #[cfg(test)]
    pub(crate) fn insert_raw_event(&self, id: &str, payload: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO outbox_events (id, aggregate_type, aggregate_id, event_type, payload, created_at)
                 VALUES (?1, 'bug', '0', 'bug.unknown', ?2, ?3)",
                params![id, payload, format_ts(now)],
            )
            .context("Failed to insert raw outbox event")?;
        Ok(())
    }
}
