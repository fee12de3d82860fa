use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::{params, Connection};

use super::Alert;

/// Where emitted alerts are recorded.
pub trait AlertSink: Send + Sync {
    fn record(&self, alert: &Alert) -> Result<()>;

    /// Most recent alerts, newest first.
    fn recent(&self, limit: usize) -> Result<Vec<Alert>>;

    fn count(&self) -> Result<u64>;
}

/// Bounded in-memory sink; the oldest alerts fall off past `capacity`.
pub struct InMemoryAlertSink {
    capacity: usize,
    alerts: Mutex<(VecDeque<Alert>, u64)>,
}

impl InMemoryAlertSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            alerts: Mutex::new((VecDeque::new(), 0)),
        }
    }
}

impl Default for InMemoryAlertSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl AlertSink for InMemoryAlertSink {
    fn record(&self, alert: &Alert) -> Result<()> {
        let mut guard = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        let (alerts, total) = &mut *guard;
        if alerts.len() == self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(alert.clone());
        *total += 1;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<Alert>> {
        let guard = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.0.iter().rev().take(limit).cloned().collect())
    }

    fn count(&self) -> Result<u64> {
        Ok(self.alerts.lock().unwrap_or_else(|e| e.into_inner()).1)
    }
}

/// Alert history in SQLite.
pub struct SqliteAlertSink {
    conn: Mutex<Connection>,
}

impl SqliteAlertSink {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let sink = Self {
            conn: Mutex::new(conn),
        };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS alerts (
              id TEXT PRIMARY KEY,
              task_id TEXT NOT NULL,
              task_name TEXT NOT NULL,
              source_name TEXT NOT NULL,
              class TEXT NOT NULL,
              confidence REAL NOT NULL,
              bbox_json TEXT NOT NULL,
              created_at TEXT NOT NULL,
              image_ref TEXT,
              title TEXT NOT NULL,
              message TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);
            CREATE INDEX IF NOT EXISTS idx_alerts_task ON alerts(task_id);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AlertSink for SqliteAlertSink {
    fn record(&self, alert: &Alert) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO alerts
             (id, task_id, task_name, source_name, class, confidence, bbox_json,
              created_at, image_ref, title, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                alert.id,
                alert.task_id,
                alert.task_name,
                alert.source_name,
                alert.class,
                alert.confidence as f64,
                serde_json::to_string(&alert.bbox)?,
                alert.timestamp.to_rfc3339(),
                alert.image_ref,
                alert.title,
                alert.message,
            ],
        )?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, task_name, source_name, class, confidence, bbox_json,
                    created_at, image_ref, title, message
             FROM alerts ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let bbox_json: String = row.get(6)?;
            let created_at: String = row.get(7)?;
            let confidence: f64 = row.get(5)?;
            out.push(Alert {
                id: row.get(0)?,
                task_id: row.get(1)?,
                task_name: row.get(2)?,
                source_name: row.get(3)?,
                class: row.get(4)?,
                confidence: confidence as f32,
                bbox: serde_json::from_str(&bbox_json)?,
                timestamp: chrono::DateTime::parse_from_rfc3339(&created_at)?
                    .with_timezone(&chrono::Utc),
                image_ref: row.get(8)?,
                title: row.get(9)?,
                message: row.get(10)?,
            });
        }
        Ok(out)
    }

    fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BoundingBox;
    use chrono::{Duration, TimeZone, Utc};

    fn alert(id: &str, offset_secs: i64) -> Alert {
        Alert {
            id: id.into(),
            task_id: "t1".into(),
            task_name: "Gate".into(),
            source_name: "cam".into(),
            class: "car".into(),
            confidence: 0.75,
            bbox: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap()
                + Duration::seconds(offset_secs),
            image_ref: Some("/tmp/x.jpg".into()),
            title: "car detected - Gate".into(),
            message: "msg".into(),
        }
    }

    #[test]
    fn memory_sink_keeps_newest_first() {
        let sink = InMemoryAlertSink::new(2);
        sink.record(&alert("a", 0)).unwrap();
        sink.record(&alert("b", 1)).unwrap();
        sink.record(&alert("c", 2)).unwrap();
        let ids: Vec<String> = sink.recent(10).unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(sink.count().unwrap(), 3);
    }

    #[test]
    fn sqlite_sink_round_trips_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("alerts.db");
        let sink = SqliteAlertSink::open(db.to_str().unwrap()).unwrap();
        sink.record(&alert("a", 0)).unwrap();
        sink.record(&alert("b", 5)).unwrap();

        assert_eq!(sink.count().unwrap(), 2);
        let recent = sink.recent(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0], alert("b", 5));
    }

    #[test]
    fn sqlite_sink_reopens_existing_db() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("alerts.db");
        {
            let sink = SqliteAlertSink::open(db.to_str().unwrap()).unwrap();
            sink.record(&alert("a", 0)).unwrap();
        }
        let sink = SqliteAlertSink::open(db.to_str().unwrap()).unwrap();
        assert_eq!(sink.count().unwrap(), 1);
    }
}
