use chrono::{DateTime, FixedOffset, NaiveDate};
use clockface_core::{
    AttendanceEvent, AttendanceLog, AttendanceTracker, Embedding, EventKind, FaceTemplate,
    RecordOutcome, Registry, RegistryEntry,
};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
    #[error("encryption key {path} is {len} bytes, expected 32")]
    KeyLength { path: String, len: usize },
    #[error("report range is reversed: {from} is after {to}")]
    ReversedRange { from: NaiveDate, to: NaiveDate },
}

/// Employee metadata supplied at enrollment.
#[derive(Debug, Clone)]
pub struct NewEmployee {
    pub employee_id: String,
    pub name: String,
    pub department: String,
}

/// Enrolled employee without the embedding.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EmployeeInfo {
    pub employee_id: String,
    pub name: String,
    pub department: String,
    pub model_version: String,
    pub quality_score: f64,
    pub active: bool,
    pub enrolled_at: String,
}

/// Enrolled employee totals for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EmployeeCounts {
    pub total: u64,
    pub active: u64,
}

/// One attendance event with its owner, as listed in reports.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ReportRow {
    pub employee_id: String,
    /// Calendar day, `YYYY-MM-DD`.
    pub date: String,
    #[serde(flatten)]
    pub event: AttendanceEvent,
}

/// SQLite-backed employee registry and attendance log.
///
/// Embeddings are AES-256-GCM encrypted at rest. The per-installation key
/// lives at `{db_dir}/.key` (mode 0600) and is created on first use.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
    cipher: EmbeddingCipher,
}

impl Store {
    /// Open (or create) the database at the given path and create tables.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let key = if db_path == Path::new(":memory:") {
            [0u8; 32]
        } else {
            let dir = db_path.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir).map_err(StoreError::KeyIo)?;
            load_or_create_key(&dir.join(".key"))?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS employees (
                     seq INTEGER PRIMARY KEY AUTOINCREMENT,
                     employee_id TEXT NOT NULL,
                     name TEXT NOT NULL,
                     department TEXT NOT NULL DEFAULT '',
                     embedding BLOB NOT NULL,
                     model_version TEXT NOT NULL,
                     quality_score REAL NOT NULL DEFAULT 0.0,
                     active INTEGER NOT NULL DEFAULT 1,
                     enrolled_at TEXT NOT NULL
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS idx_employees_active
                     ON employees(employee_id) WHERE active = 1;
                 CREATE TABLE IF NOT EXISTS attendance_events (
                     seq INTEGER PRIMARY KEY AUTOINCREMENT,
                     id TEXT NOT NULL UNIQUE,
                     employee_id TEXT NOT NULL,
                     date TEXT NOT NULL,
                     kind TEXT NOT NULL CHECK (kind IN ('in', 'out')),
                     time TEXT NOT NULL,
                     timestamp TEXT NOT NULL,
                     confidence REAL
                 );
                 CREATE INDEX IF NOT EXISTS idx_events_day
                     ON attendance_events(employee_id, date);",
            )?;
            Ok(())
        })
        .await?;

        tracing::info!(path = %db_path.display(), "store opened");
        Ok(Self {
            conn,
            cipher: EmbeddingCipher::new(&key),
        })
    }

    /// Enroll an employee. Returns `false` if the id is already active.
    pub async fn enroll(
        &self,
        employee: &NewEmployee,
        embedding: &Embedding,
        quality_score: f32,
    ) -> Result<bool, StoreError> {
        let blob = self.cipher.seal(&embedding.values)?;
        let model_version = embedding
            .model_version
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let enrolled_at = chrono::Local::now().naive_local().to_string();
        let employee = employee.clone();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM employees WHERE employee_id = ?1 AND active = 1)",
                    [&employee.employee_id],
                    |row| row.get(0),
                )?;
                if exists {
                    return Ok(false);
                }
                tx.execute(
                    "INSERT INTO employees
                        (employee_id, name, department, embedding, model_version, quality_score, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        employee.employee_id,
                        employee.name,
                        employee.department,
                        blob,
                        model_version,
                        quality_score as f64,
                        enrolled_at
                    ],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Snapshot of every enrolled template in enrollment order.
    pub async fn load_registry(&self) -> Result<Registry, StoreError> {
        let rows: Vec<(String, Vec<u8>, String, bool)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT employee_id, embedding, model_version, active
                     FROM employees ORDER BY seq",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (employee_id, blob, model_version, active) in rows {
            let values = self.cipher.open(&blob)?;
            entries.push(RegistryEntry {
                template: FaceTemplate {
                    employee_id,
                    embedding: Embedding {
                        values,
                        model_version: Some(model_version),
                    },
                },
                active,
            });
        }
        Ok(Registry::from_entries(entries))
    }

    /// Employee metadata in enrollment order.
    pub async fn list_employees(&self) -> Result<Vec<EmployeeInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT employee_id, name, department, model_version, quality_score, active, enrolled_at
                     FROM employees ORDER BY seq",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(EmployeeInfo {
                        employee_id: row.get(0)?,
                        name: row.get(1)?,
                        department: row.get(2)?,
                        model_version: row.get(3)?,
                        quality_score: row.get(4)?,
                        active: row.get(5)?,
                        enrolled_at: row.get(6)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Clear the active flag. Attendance history is kept.
    pub async fn deactivate(&self, employee_id: &str) -> Result<bool, StoreError> {
        let employee_id = employee_id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE employees SET active = 0 WHERE employee_id = ?1 AND active = 1",
                    [&employee_id],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Employees ever enrolled, and those still active.
    pub async fn employee_counts(&self) -> Result<EmployeeCounts, StoreError> {
        self.conn
            .call(|conn| {
                let counts = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(active), 0) FROM employees",
                    [],
                    |row| {
                        Ok(EmployeeCounts {
                            total: row.get(0)?,
                            active: row.get(1)?,
                        })
                    },
                )?;
                Ok(counts)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Decide and append the next attendance event in one immediate
    /// transaction, so concurrent requests cannot both pass the cooldown.
    pub async fn record_attendance(
        &self,
        employee_id: &str,
        now: DateTime<FixedOffset>,
        confidence: Option<f32>,
        cooldown: Duration,
    ) -> Result<RecordOutcome, StoreError> {
        let employee_id = employee_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let outcome = {
                    let mut tracker = AttendanceTracker::with_cooldown(SqlDayLog { conn: &tx }, cooldown);
                    tracker.record_with_confidence(&employee_id, now, confidence)?
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Events of one employee on one day, oldest first.
    pub async fn day_record(
        &self,
        employee_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        let employee_id = employee_id.to_string();
        self.conn
            .call(move |conn| {
                let log = SqlDayLog { conn };
                Ok(log.day_record(&employee_id, date)?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Every event dated `from..=to`, newest first.
    pub async fn records_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ReportRow>, StoreError> {
        if from > to {
            return Err(StoreError::ReversedRange { from, to });
        }
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT employee_id, date, kind, time, timestamp, confidence
                     FROM attendance_events
                     WHERE date BETWEEN ?1 AND ?2 ORDER BY seq DESC",
                )?;
                let rows = stmt.query_map(rusqlite::params![from.to_string(), to.to_string()], |row| {
                    Ok(ReportRow {
                        employee_id: row.get(0)?,
                        date: row.get(1)?,
                        event: event_from_row(row, 2)?,
                    })
                })?;
                let report = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(report)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Match confidences of the most recent recorded events.
    pub async fn recent_confidences(&self, limit: u32) -> Result<Vec<f32>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT confidence FROM attendance_events
                     WHERE confidence IS NOT NULL ORDER BY seq DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map([limit], |row| row.get::<_, f64>(0))?;
                Ok(rows
                    .map(|r| r.map(|c| c as f32))
                    .collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Number of events recorded on `date` across all employees.
    pub async fn count_events_on(&self, date: NaiveDate) -> Result<u64, StoreError> {
        self.conn
            .call(move |conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance_events WHERE date = ?1",
                    [date.to_string()],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }
}

/// [`AttendanceLog`] over a borrowed connection or open transaction.
struct SqlDayLog<'a> {
    conn: &'a rusqlite::Connection,
}

impl AttendanceLog for SqlDayLog<'_> {
    type Error = rusqlite::Error;

    fn day_record(
        &self,
        employee_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceEvent>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, time, timestamp, confidence FROM attendance_events
             WHERE employee_id = ?1 AND date = ?2 ORDER BY seq",
        )?;
        let rows = stmt.query_map(rusqlite::params![employee_id, date.to_string()], |row| {
            event_from_row(row, 0)
        })?;
        let events = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn append_event(
        &mut self,
        employee_id: &str,
        date: NaiveDate,
        event: &AttendanceEvent,
    ) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO attendance_events (id, employee_id, date, kind, time, timestamp, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                uuid::Uuid::new_v4().to_string(),
                employee_id,
                date.to_string(),
                event.kind.as_str(),
                event.time,
                event.timestamp,
                event.confidence.map(|c| c as f64),
            ],
        )?;
        Ok(())
    }
}

/// Reads `kind, time, timestamp, confidence` starting at column `first`.
fn event_from_row(row: &rusqlite::Row<'_>, first: usize) -> rusqlite::Result<AttendanceEvent> {
    let kind: String = row.get(first)?;
    let kind = EventKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            first,
            rusqlite::types::Type::Text,
            format!("unknown event kind '{kind}'").into(),
        )
    })?;
    Ok(AttendanceEvent {
        kind,
        time: row.get(first + 1)?,
        timestamp: row.get(first + 2)?,
        confidence: row.get::<_, Option<f64>>(first + 3)?.map(|c| c as f32),
    })
}

// ── Embedding encryption ──────────────────────────────────────────────────────

/// AES-256-GCM sealing of embedding vectors.
///
/// Blob layout: 12-byte nonce, then ciphertext with the 16-byte tag. The
/// plaintext is the vector as little-endian `f32`s.
#[derive(Clone)]
struct EmbeddingCipher {
    aead: Aes256Gcm,
}

impl EmbeddingCipher {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            aead: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    fn seal(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        check_values(values)?;
        let plaintext: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let nonce = Aes256Gcm::generate_nonce(&mut aes_gcm::aead::OsRng);
        let sealed = self
            .aead
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;
        Ok([nonce.as_slice(), &sealed].concat())
    }

    fn open(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| StoreError::DecryptionFailed)?;

        if plaintext.len() % 4 != 0 {
            return Err(StoreError::InvalidBlob(plaintext.len()));
        }
        let values: Vec<f32> = plaintext
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        check_values(&values)?;
        Ok(values)
    }
}

fn check_values(values: &[f32]) -> Result<(), StoreError> {
    if values.is_empty() {
        return Err(StoreError::EmptyEmbedding);
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

/// Read the installation key, creating it (mode 0600) on first start.
fn load_or_create_key(path: &Path) -> Result<[u8; 32], StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let len = bytes.len();
            bytes.try_into().map_err(|_| StoreError::KeyLength {
                path: path.display().to_string(),
                len,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;

            let mut key = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key);
            std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .and_then(|mut f| f.write_all(&key))
                .map_err(StoreError::KeyIo)?;
            tracing::info!(path = %path.display(), "created embedding encryption key");
            Ok(key)
        }
        Err(e) => Err(StoreError::KeyIo(e)),
    }
}
