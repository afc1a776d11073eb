// 🗄️ Store - SQLite ledger for the learning loop
//
// Append-only training samples, the durable override counter, the retraining
// audit log, the override event trail and fitted model snapshots. WAL mode
// for crash recovery.

use crate::config::CategorySchema;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

const OVERRIDE_COUNTER_KEY: &str = "override_counter";
const RETRAIN_REQUESTED_KEY: &str = "retrain_requested";

// ============================================================================
// RECORDS
// ============================================================================

/// One labelled description. Never mutated or deleted once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub description: String,

    #[serde(default)]
    pub merchant: Option<String>,

    #[serde(default)]
    pub amount: Option<f64>,

    pub category: String,
    pub subcategory: String,

    /// Entered by a human correction
    pub manual: bool,

    /// Where the sample came from ("manual_override", "import", ...)
    pub source: String,

    pub created_at: DateTime<Utc>,
}

impl TrainingSample {
    pub fn manual(
        description: impl Into<String>,
        category: impl Into<String>,
        subcategory: impl Into<String>,
    ) -> Self {
        TrainingSample {
            description: description.into(),
            merchant: None,
            amount: None,
            category: category.into(),
            subcategory: subcategory.into(),
            manual: true,
            source: "manual_override".to_string(),
            created_at: Utc::now(),
        }
    }
}

/// One retraining attempt, successful or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainingAuditRecord {
    pub timestamp: DateTime<Utc>,
    pub model_type: String,
    pub sample_count: usize,
    pub accuracy: f64,
    pub success: bool,
    pub message: String,
}

/// One human correction as recorded in the override trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideEvent {
    pub event_id: String,
    pub recorded_at: DateTime<Utc>,
    pub transaction_id: String,
    pub category: String,
    pub subcategory: String,
    pub description: String,

    /// Whether the correction also entered the training ledger
    pub trained: bool,

    /// Counter value right after this correction
    pub counter_after: u32,
}

impl OverrideEvent {
    pub fn new(
        transaction_id: impl Into<String>,
        category: impl Into<String>,
        subcategory: impl Into<String>,
        description: impl Into<String>,
        trained: bool,
        counter_after: u32,
    ) -> Self {
        OverrideEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            recorded_at: Utc::now(),
            transaction_id: transaction_id.into(),
            category: category.into(),
            subcategory: subcategory.into(),
            description: description.into(),
            trained,
            counter_after,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

/// CSV row of a historical, already-categorised transaction
#[derive(Debug, Deserialize)]
struct CsvTrainingRow {
    #[serde(rename = "Description")]
    description: String,

    #[serde(rename = "Category")]
    category: String,

    #[serde(rename = "Subcategory")]
    subcategory: String,

    #[serde(rename = "Amount", default)]
    amount: Option<f64>,

    #[serde(rename = "Merchant", default)]
    merchant: Option<String>,
}

// ============================================================================
// STORE
// ============================================================================

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(Store { conn })
    }

    // ------------------------------------------------------------------------
    // Training samples
    // ------------------------------------------------------------------------

    pub fn append_sample(&self, sample: &TrainingSample) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO training_samples (
                description, merchant, amount, category, subcategory, manual, source, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                sample.description,
                sample.merchant,
                sample.amount,
                sample.category,
                sample.subcategory,
                sample.manual,
                sample.source,
                sample.created_at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All samples in insertion order
    pub fn load_samples(&self) -> Result<Vec<TrainingSample>> {
        let mut stmt = self.conn.prepare(
            "SELECT description, merchant, amount, category, subcategory, manual, source, created_at
             FROM training_samples
             ORDER BY id ASC",
        )?;

        let samples = stmt
            .query_map([], |row| {
                let created_at: String = row.get(7)?;
                Ok(TrainingSample {
                    description: row.get(0)?,
                    merchant: row.get(1)?,
                    amount: row.get(2)?,
                    category: row.get(3)?,
                    subcategory: row.get(4)?,
                    manual: row.get(5)?,
                    source: row.get(6)?,
                    created_at: parse_timestamp(&created_at, 7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(samples)
    }

    pub fn sample_count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM training_samples", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Bulk-load labelled history from a CSV file
    pub fn import_training_csv<P: AsRef<Path>>(
        &mut self,
        path: P,
        schema: &CategorySchema,
    ) -> Result<ImportReport> {
        let file = std::fs::File::open(path.as_ref())?;
        self.import_training_csv_reader(file, schema)
    }

    /// Rows with blank fields or a label outside the schema are skipped
    pub fn import_training_csv_reader<R: Read>(
        &mut self,
        reader: R,
        schema: &CategorySchema,
    ) -> Result<ImportReport> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut report = ImportReport::default();
        let now = Utc::now();

        let tx = self.conn.transaction()?;
        for row in rdr.deserialize::<CsvTrainingRow>() {
            let row = row?;
            let description = row.description.trim();

            if description.is_empty() || !schema.contains(&row.category, &row.subcategory) {
                debug!(
                    category = %row.category,
                    subcategory = %row.subcategory,
                    "skipping csv row"
                );
                report.skipped += 1;
                continue;
            }

            tx.execute(
                "INSERT INTO training_samples (
                    description, merchant, amount, category, subcategory, manual, source, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 'import', ?6)",
                params![
                    description,
                    row.merchant.filter(|m| !m.trim().is_empty()),
                    row.amount,
                    row.category,
                    row.subcategory,
                    now.to_rfc3339(),
                ],
            )?;
            report.imported += 1;
        }
        tx.commit()?;

        if report.skipped > 0 {
            warn!(skipped = report.skipped, "csv rows skipped during import");
        }
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Engine state
    // ------------------------------------------------------------------------

    pub fn override_counter(&self) -> Result<u32> {
        Ok(self
            .get_state(OVERRIDE_COUNTER_KEY)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub fn set_override_counter(&self, value: u32) -> Result<()> {
        self.set_state(OVERRIDE_COUNTER_KEY, &value.to_string())
    }

    pub fn retrain_requested(&self) -> Result<bool> {
        Ok(self.get_state(RETRAIN_REQUESTED_KEY)?.as_deref() == Some("1"))
    }

    pub fn set_retrain_requested(&self, requested: bool) -> Result<()> {
        self.set_state(RETRAIN_REQUESTED_KEY, if requested { "1" } else { "0" })
    }

    fn get_state(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM engine_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_state(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO engine_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Retraining audit
    // ------------------------------------------------------------------------

    pub fn append_audit(&self, record: &RetrainingAuditRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO retraining_audit (
                timestamp, model_type, sample_count, accuracy, success, message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.timestamp.to_rfc3339(),
                record.model_type,
                record.sample_count as i64,
                record.accuracy,
                record.success,
                record.message,
            ],
        )?;
        Ok(())
    }

    /// All attempts, oldest first
    pub fn audit_records(&self) -> Result<Vec<RetrainingAuditRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, model_type, sample_count, accuracy, success, message
             FROM retraining_audit
             ORDER BY id ASC",
        )?;

        let records = stmt
            .query_map([], |row| {
                let timestamp: String = row.get(0)?;
                let sample_count: i64 = row.get(2)?;
                Ok(RetrainingAuditRecord {
                    timestamp: parse_timestamp(&timestamp, 0)?,
                    model_type: row.get(1)?,
                    sample_count: sample_count as usize,
                    accuracy: row.get(3)?,
                    success: row.get(4)?,
                    message: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    pub fn last_audit(&self) -> Result<Option<RetrainingAuditRecord>> {
        Ok(self.audit_records()?.pop())
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub fn insert_override_event(&self, event: &OverrideEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO override_events (
                event_id, recorded_at, transaction_id, category, subcategory,
                description, trained, counter_after
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.event_id,
                event.recorded_at.to_rfc3339(),
                event.transaction_id,
                event.category,
                event.subcategory,
                event.description,
                event.trained,
                event.counter_after as i64,
            ],
        )?;
        Ok(())
    }

    /// Corrections recorded for one transaction, oldest first
    pub fn override_events_for(&self, transaction_id: &str) -> Result<Vec<OverrideEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, recorded_at, transaction_id, category, subcategory,
                    description, trained, counter_after
             FROM override_events
             WHERE transaction_id = ?1
             ORDER BY id ASC",
        )?;

        let events = stmt
            .query_map(params![transaction_id], |row| {
                let recorded_at: String = row.get(1)?;
                let counter_after: i64 = row.get(7)?;
                Ok(OverrideEvent {
                    event_id: row.get(0)?,
                    recorded_at: parse_timestamp(&recorded_at, 1)?,
                    transaction_id: row.get(2)?,
                    category: row.get(3)?,
                    subcategory: row.get(4)?,
                    description: row.get(5)?,
                    trained: row.get(6)?,
                    counter_after: counter_after as u32,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    // ------------------------------------------------------------------------
    // Model snapshots
    // ------------------------------------------------------------------------

    pub fn save_model_snapshot(
        &self,
        version: u64,
        trained_at: DateTime<Utc>,
        model_json: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO model_snapshots (version, trained_at, model_json)
             VALUES (?1, ?2, ?3)",
            params![version as i64, trained_at.to_rfc3339(), model_json],
        )?;
        Ok(())
    }

    /// JSON of the highest-versioned snapshot
    pub fn latest_model_snapshot(&self) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT model_json FROM model_snapshots ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Training ledger (append-only)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS training_samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            description TEXT NOT NULL,
            merchant TEXT,
            amount REAL,
            category TEXT NOT NULL,
            subcategory TEXT NOT NULL,
            manual INTEGER NOT NULL,
            source TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS engine_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS retraining_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            model_type TEXT NOT NULL,
            sample_count INTEGER NOT NULL,
            accuracy REAL NOT NULL,
            success INTEGER NOT NULL,
            message TEXT NOT NULL
        )",
        [],
    )?;

    // One row per human correction
    conn.execute(
        "CREATE TABLE IF NOT EXISTS override_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            recorded_at TEXT NOT NULL,
            transaction_id TEXT NOT NULL,
            category TEXT NOT NULL,
            subcategory TEXT NOT NULL,
            description TEXT NOT NULL,
            trained INTEGER NOT NULL,
            counter_after INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS model_snapshots (
            version INTEGER PRIMARY KEY,
            trained_at TEXT NOT NULL,
            model_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_override_events_tx ON override_events(transaction_id)",
        [],
    )?;

    Ok(())
}

fn parse_timestamp(value: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
