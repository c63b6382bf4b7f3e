use anyhow::Result;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use sha2::{Digest, Sha256};
use std::time::Duration;

use super::{max_severity, PersistError, RecordId, RecordSink};
use crate::annotate::{encode_jpeg, JPEG_QUALITY};
use crate::frame::Frame;
use crate::fusion::UnifiedResult;
use crate::policy::PersistenceDecision;
use crate::rules::Violation;

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub record_id: RecordId,
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
    pub sha256_hex: String,
}

impl StoredSnapshot {
    /// True when the blob still matches the digest written with it.
    pub fn verify(&self) -> bool {
        hex::encode(Sha256::digest(&self.jpeg)) == self.sha256_hex
    }
}

/// SQLite-backed frame records for one camera.
///
/// Several cameras may share one database file; each opens its own connection.
pub struct SqliteRecordStore {
    conn: Connection,
    camera_id: String,
}

fn open_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

impl SqliteRecordStore {
    pub fn open(db_path: &str, camera_id: &str) -> Result<Self> {
        let conn = open_connection(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mut store = Self {
            conn,
            camera_id: camera_id.to_string(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS frame_records (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              sequence INTEGER NOT NULL,
              captured_at_ms INTEGER NOT NULL,
              persisted_at_ms INTEGER NOT NULL,
              reason TEXT NOT NULL,
              subject_count INTEGER NOT NULL,
              violation_count INTEGER NOT NULL,
              max_severity REAL NOT NULL,
              result_json TEXT NOT NULL,
              violations_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshots (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              record_id INTEGER NOT NULL REFERENCES frame_records(id) ON DELETE CASCADE,
              width INTEGER NOT NULL,
              height INTEGER NOT NULL,
              jpeg BLOB NOT NULL,
              sha256_hex TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_camera_time
              ON frame_records(camera_id, captured_at_ms);
            CREATE INDEX IF NOT EXISTS idx_snapshots_record ON snapshots(record_id);
            "#,
        )?;
        Ok(())
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn record_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM frame_records WHERE camera_id = ?1",
            params![self.camera_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Sequences of this camera's records in insertion order.
    pub fn persisted_sequences(&self) -> Result<Vec<u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT sequence FROM frame_records WHERE camera_id = ?1 ORDER BY id ASC")?;
        let mut rows = stmt.query(params![self.camera_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let seq: i64 = row.get(0)?;
            out.push(seq as u64);
        }
        Ok(out)
    }

    pub fn load_result(&self, id: RecordId) -> Result<Option<UnifiedResult>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT result_json FROM frame_records WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn snapshot_for(&self, id: RecordId) -> Result<Option<StoredSnapshot>> {
        let snapshot = self
            .conn
            .query_row(
                "SELECT width, height, jpeg, sha256_hex FROM snapshots WHERE record_id = ?1",
                params![id.0],
                |row| {
                    Ok(StoredSnapshot {
                        record_id: id,
                        width: row.get(0)?,
                        height: row.get(1)?,
                        jpeg: row.get(2)?,
                        sha256_hex: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }
}

impl RecordSink for SqliteRecordStore {
    fn persist(
        &mut self,
        result: &UnifiedResult,
        violations: &[Violation],
        decision: &PersistenceDecision,
        frame: Option<&Frame>,
    ) -> Result<RecordId, PersistError> {
        let reason = decision
            .reason
            .map(|r| r.as_str())
            .ok_or_else(|| PersistError::Failure("decision carries no reason".into()))?;
        let result_json = serde_json::to_string(result)?;
        let violations_json = serde_json::to_string(violations)?;
        // Encode before opening the transaction so the write lock is held briefly.
        let snapshot = match (decision.snapshot_requested, frame) {
            (true, Some(frame)) => {
                let jpeg = encode_jpeg(frame.pixels(), frame.width, frame.height, JPEG_QUALITY)
                    .map_err(|e| PersistError::Failure(e.to_string()))?;
                let digest = hex::encode(Sha256::digest(&jpeg));
                Some((frame.width, frame.height, jpeg, digest))
            }
            _ => None,
        };

        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO frame_records(
              camera_id, sequence, captured_at_ms, persisted_at_ms, reason,
              subject_count, violation_count, max_severity, result_json, violations_json
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                self.camera_id,
                result.sequence as i64,
                result.captured_at_ms as i64,
                crate::now_ms() as i64,
                reason,
                result.subjects.len() as i64,
                violations.len() as i64,
                max_severity(violations) as f64,
                result_json,
                violations_json
            ],
        )?;
        let record_id = tx.last_insert_rowid();
        if let Some((width, height, jpeg, digest)) = snapshot {
            tx.execute(
                r#"
                INSERT INTO snapshots(record_id, width, height, jpeg, sha256_hex)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![record_id, width, height, jpeg, digest],
            )?;
        }
        tx.commit()?;
        Ok(RecordId(record_id))
    }

    fn enforce_retention(&mut self, max_age: Duration) -> Result<usize, PersistError> {
        let cutoff = crate::now_ms().saturating_sub(max_age.as_millis() as u64) as i64;
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            DELETE FROM snapshots WHERE record_id IN (
              SELECT id FROM frame_records WHERE camera_id = ?1 AND captured_at_ms < ?2
            )
            "#,
            params![self.camera_id, cutoff],
        )?;
        let removed = tx.execute(
            "DELETE FROM frame_records WHERE camera_id = ?1 AND captured_at_ms < ?2",
            params![self.camera_id, cutoff],
        )?;
        tx.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frame_byte_len;
    use crate::policy::ReasonCode;

    fn memory_db() -> String {
        format!(
            "file:watchpost_{:x}?mode=memory&cache=shared",
            rand::random::<u64>()
        )
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![90u8; frame_byte_len(16, 16)], 16, 16, sequence).unwrap()
    }

    #[test]
    fn persists_record_with_verified_snapshot() -> Result<()> {
        let mut store = SqliteRecordStore::open(&memory_db(), "line-1")?;
        let f = frame(4);
        let result = UnifiedResult::empty_for(&f);
        let decision = PersistenceDecision::forced();

        let id = store.persist(&result, &[], &decision, Some(&f))?;
        assert_eq!(store.record_count()?, 1);
        assert_eq!(store.persisted_sequences()?, vec![4]);
        assert_eq!(store.load_result(id)?, Some(result));

        let snapshot = store.snapshot_for(id)?.expect("snapshot stored");
        assert_eq!((snapshot.width, snapshot.height), (16, 16));
        assert!(snapshot.verify());
        Ok(())
    }

    #[test]
    fn sampled_record_has_no_snapshot() -> Result<()> {
        let mut store = SqliteRecordStore::open(&memory_db(), "line-1")?;
        let f = frame(5);
        let decision = PersistenceDecision {
            should_persist: true,
            reason: Some(ReasonCode::SampledInterval),
            snapshot_requested: false,
        };
        let id = store.persist(&UnifiedResult::empty_for(&f), &[], &decision, Some(&f))?;
        assert!(store.snapshot_for(id)?.is_none());
        Ok(())
    }

    #[test]
    fn retention_removes_old_records_and_snapshots() -> Result<()> {
        let mut store = SqliteRecordStore::open(&memory_db(), "line-1")?;
        let old = Frame::with_capture_time(
            vec![1u8; frame_byte_len(4, 4)],
            4,
            4,
            1,
            std::time::UNIX_EPOCH + Duration::from_secs(1_000),
        )?;
        let fresh = frame(2);
        let decision = PersistenceDecision::forced();
        let old_id = store.persist(&UnifiedResult::empty_for(&old), &[], &decision, Some(&old))?;
        store.persist(&UnifiedResult::empty_for(&fresh), &[], &decision, None)?;

        let removed = store.enforce_retention(Duration::from_secs(3600))?;
        assert_eq!(removed, 1);
        assert_eq!(store.persisted_sequences()?, vec![2]);
        assert!(store.snapshot_for(old_id)?.is_none());
        Ok(())
    }

    #[test]
    fn cameras_sharing_a_database_are_separated() -> Result<()> {
        let db = memory_db();
        let mut a = SqliteRecordStore::open(&db, "a")?;
        let b = SqliteRecordStore::open(&db, "b")?;
        let f = frame(1);
        a.persist(
            &UnifiedResult::empty_for(&f),
            &[],
            &PersistenceDecision::forced(),
            None,
        )?;
        assert_eq!(a.record_count()?, 1);
        assert_eq!(b.record_count()?, 0);
        Ok(())
    }
}
