//! SQLite persistence for confidence statistics and learning history

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::sync::Mutex;
use tracing::info;

use crate::confidence::{ConfidenceScorer, ToolPerformance};
use crate::learning::{CorrectionContext, CorrectionRecord, ErrorPattern, LearningStore};

pub struct MemoryStore {
    conn: Mutex<Connection>,
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

impl MemoryStore {
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("cannot open memory database {db_path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tool_performance (
                tool_name TEXT PRIMARY KEY,
                total_uses INTEGER NOT NULL,
                successes INTEGER NOT NULL,
                failures INTEGER NOT NULL,
                cancellations INTEGER NOT NULL,
                avg_duration_ms REAL NOT NULL,
                last_used TEXT
            );

            CREATE TABLE IF NOT EXISTS corrections (
                id TEXT PRIMARY KEY,
                signature TEXT NOT NULL,
                error_type TEXT NOT NULL,
                error_message TEXT NOT NULL,
                tool TEXT NOT NULL,
                fix_description TEXT NOT NULL,
                success INTEGER NOT NULL,
                language TEXT,
                file_type TEXT,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS error_patterns (
                signature TEXT PRIMARY KEY,
                pattern_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_corrections_time ON corrections(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn save_performance(&self, records: &[ToolPerformance]) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {e}"))?;
        let tx = conn.transaction()?;
        for p in records {
            tx.execute(
                "INSERT OR REPLACE INTO tool_performance
                 (tool_name, total_uses, successes, failures, cancellations, avg_duration_ms, last_used)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    p.tool_name,
                    p.total_uses as i64,
                    p.successes as i64,
                    p.failures as i64,
                    p.cancellations as i64,
                    p.avg_duration_ms,
                    p.last_used.map(|t| t.to_rfc3339()),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_performance(&self) -> Result<Vec<ToolPerformance>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {e}"))?;
        let mut stmt = conn.prepare(
            "SELECT tool_name, total_uses, successes, failures, cancellations, avg_duration_ms, last_used
             FROM tool_performance ORDER BY tool_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ToolPerformance {
                tool_name: row.get(0)?,
                total_uses: row.get::<_, i64>(1)? as u64,
                successes: row.get::<_, i64>(2)? as u64,
                failures: row.get::<_, i64>(3)? as u64,
                cancellations: row.get::<_, i64>(4)? as u64,
                avg_duration_ms: row.get(5)?,
                last_used: parse_time(row.get(6)?),
                // derived values are recomputed on restore
                success_rate: 0.0,
                confidence: 0.5,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Replace the persisted history with the current one
    pub fn save_corrections(&self, records: &[CorrectionRecord]) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {e}"))?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM corrections", [])?;
        for r in records {
            tx.execute(
                "INSERT INTO corrections
                 (id, signature, error_type, error_message, tool, fix_description, success, language, file_type, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    r.id,
                    r.signature,
                    r.error_type,
                    r.error_message,
                    r.tool,
                    r.fix_description,
                    r.success,
                    r.context.language,
                    r.context.file_type,
                    r.timestamp.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_corrections(&self) -> Result<Vec<CorrectionRecord>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {e}"))?;
        let mut stmt = conn.prepare(
            "SELECT id, signature, error_type, error_message, tool, fix_description, success, language, file_type, timestamp
             FROM corrections ORDER BY timestamp",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CorrectionRecord {
                id: row.get(0)?,
                signature: row.get(1)?,
                error_type: row.get(2)?,
                error_message: row.get(3)?,
                tool: row.get(4)?,
                fix_description: row.get(5)?,
                success: row.get(6)?,
                context: CorrectionContext {
                    language: row.get(7)?,
                    file_type: row.get(8)?,
                },
                timestamp: parse_time(row.get(9)?).unwrap_or_else(Utc::now),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn save_patterns(&self, patterns: &[ErrorPattern]) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {e}"))?;
        let tx = conn.transaction()?;
        for p in patterns {
            let json = serde_json::to_string(p).context("failed to serialize error pattern")?;
            tx.execute(
                "INSERT OR REPLACE INTO error_patterns (signature, pattern_json) VALUES (?1, ?2)",
                params![p.signature, json],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_patterns(&self) -> Result<Vec<ErrorPattern>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {e}"))?;
        let mut stmt = conn.prepare("SELECT pattern_json FROM error_patterns")?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        raw.iter()
            .map(|s| serde_json::from_str(s).context("corrupt error pattern row"))
            .collect()
    }

    /// Persist scorer and learning state together
    pub fn save(&self, scorer: &ConfidenceScorer, learning: &LearningStore) -> Result<()> {
        let perf = scorer.snapshot();
        let (records, patterns) = learning.snapshot();
        self.save_performance(&perf)?;
        self.save_corrections(&records)?;
        self.save_patterns(&patterns)?;
        info!(
            "Saved memory: {} tools, {} corrections, {} patterns",
            perf.len(),
            records.len(),
            patterns.len()
        );
        Ok(())
    }

    /// Load persisted state into fresh components
    pub fn load_into(&self, scorer: &mut ConfidenceScorer, learning: &mut LearningStore) -> Result<()> {
        scorer.restore(self.load_performance()?);
        learning.restore(self.load_corrections()?, self.load_patterns()?);
        Ok(())
    }
}
