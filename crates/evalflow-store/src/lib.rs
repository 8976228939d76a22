use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use evalflow_types::{EvaluationResult, ExperimentRef};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp '{0}'")]
    Timestamp(String),

    #[error("evaluation {0} not found")]
    NotFound(i64),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// SQLite-backed history of evaluation runs.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEntity {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationEntity {
    pub id: i64,
    pub run_id: i64,
    pub name: String,
    pub duration: f64,
    pub error_count: usize,
}

impl Store {
    /// Open a new store at the given path (e.g., "eval.db")
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI,
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL,
                metadata TEXT
            );
            CREATE TABLE IF NOT EXISTS evaluations (
                id INTEGER PRIMARY KEY,
                run_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                duration REAL NOT NULL,
                experiment TEXT,
                FOREIGN KEY(run_id) REFERENCES runs(id)
            );
            CREATE TABLE IF NOT EXISTS eval_errors (
                id INTEGER PRIMARY KEY,
                eval_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                FOREIGN KEY(eval_id) REFERENCES evaluations(id)
            );
            CREATE TABLE IF NOT EXISTS score_values (
                id INTEGER PRIMARY KEY,
                eval_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                value REAL NOT NULL,
                FOREIGN KEY(eval_id) REFERENCES evaluations(id)
            );",
        )?;
        Ok(())
    }

    /// Create a new run entry
    pub fn create_run(&self, metadata: Option<serde_json::Value>) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO runs (created_at, metadata) VALUES (?1, ?2)",
            params![Utc::now().to_rfc3339(), metadata.map(|v| v.to_string())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<RunEntity>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, created_at, metadata FROM runs WHERE id = ?1",
                params![run_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?)),
            )
            .optional()?;
        let Some((id, created_at, metadata)) = row else {
            return Ok(None);
        };
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|_| StoreError::Timestamp(created_at.clone()))?
            .with_timezone(&Utc);
        let metadata = metadata.map(|m| serde_json::from_str(&m)).transpose()?;
        Ok(Some(RunEntity {
            id,
            created_at,
            metadata,
        }))
    }

    /// Save an evaluation result (errors and every score value) under a run.
    pub fn save_evaluation(&self, run_id: i64, name: &str, result: &EvaluationResult) -> Result<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let experiment = result.experiment.as_ref().map(serde_json::to_string).transpose()?;
        tx.execute(
            "INSERT INTO evaluations (run_id, name, duration, experiment) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, name, result.duration, experiment],
        )?;
        let eval_id = tx.last_insert_rowid();

        for message in &result.errors {
            tx.execute(
                "INSERT INTO eval_errors (eval_id, message) VALUES (?1, ?2)",
                params![eval_id, message],
            )?;
        }

        for (name, values) in &result.scores {
            for value in values {
                tx.execute(
                    "INSERT INTO score_values (eval_id, name, value) VALUES (?1, ?2, ?3)",
                    params![eval_id, name, value],
                )?;
            }
        }

        tx.commit()?;
        Ok(eval_id)
    }

    /// Rebuild a saved result. Errors and score values keep their saved order.
    pub fn load_evaluation(&self, eval_id: i64) -> Result<EvaluationResult> {
        let conn = self.lock();
        let (duration, experiment) = conn
            .query_row(
                "SELECT duration, experiment FROM evaluations WHERE id = ?1",
                params![eval_id],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?
            .ok_or(StoreError::NotFound(eval_id))?;
        let experiment: Option<ExperimentRef> = experiment.map(|e| serde_json::from_str(&e)).transpose()?;

        let mut stmt = conn.prepare("SELECT message FROM eval_errors WHERE eval_id = ?1 ORDER BY id")?;
        let errors = stmt
            .query_map(params![eval_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = EvaluationResult {
            errors,
            duration,
            experiment,
            ..Default::default()
        };
        let mut stmt = conn.prepare("SELECT name, value FROM score_values WHERE eval_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![eval_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
        for row in rows {
            let (name, value) = row?;
            result.scores.entry(name).or_default().push(value);
        }
        Ok(result)
    }

    pub fn list_evaluations(&self, run_id: i64) -> Result<Vec<EvaluationEntity>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.run_id, e.name, e.duration,
                    (SELECT COUNT(*) FROM eval_errors x WHERE x.eval_id = e.id)
             FROM evaluations e WHERE e.run_id = ?1 ORDER BY e.id",
        )?;
        let entities = stmt
            .query_map(params![run_id], |row| {
                Ok(EvaluationEntity {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    name: row.get(2)?,
                    duration: row.get(3)?,
                    error_count: row.get::<_, i64>(4)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }
}
