//! Session history database
//!
//! SQLite copy of every persisted session, including NO_RESPONSE records
//! that the CSV format cannot express. Saving the same session again
//! replaces its rows, so partial sessions can be written repeatedly.

use crate::types::{Ear, NoResponseReason, SessionReport, SessionStatus, ThresholdRecord};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Open (creating if needed) the history database
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new history database: {}", db_path.display());
    } else {
        info!("Opened existing history database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_tables(&pool).await?;
    Ok(pool)
}

/// Create the sessions and thresholds tables (idempotent)
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            guid TEXT PRIMARY KEY,
            subject TEXT,
            status TEXT NOT NULL,
            progress REAL NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            error TEXT,
            csv_path TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS thresholds (
            session_guid TEXT NOT NULL REFERENCES sessions(guid) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            ear TEXT NOT NULL CHECK (ear IN ('left', 'right')),
            frequency_hz INTEGER NOT NULL CHECK (frequency_hz > 0),
            level_db INTEGER,
            no_response_reason TEXT,
            PRIMARY KEY (session_guid, ear, frequency_hz)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_subject ON sessions(subject)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Row of the session listing
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub subject: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub record_count: i64,
    pub csv_path: Option<String>,
}

/// Insert or replace a session and all of its records
pub async fn save_session(
    pool: &SqlitePool,
    report: &SessionReport,
    csv_path: Option<&Path>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let guid = report.session_id.to_string();

    sqlx::query(
        r#"
        INSERT INTO sessions (guid, subject, status, progress, started_at, finished_at, error, csv_path)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(guid) DO UPDATE SET
            subject = excluded.subject,
            status = excluded.status,
            progress = excluded.progress,
            finished_at = excluded.finished_at,
            error = excluded.error,
            csv_path = excluded.csv_path
        "#,
    )
    .bind(&guid)
    .bind(&report.subject)
    .bind(report.status.as_str())
    .bind(report.progress)
    .bind(report.started_at.to_rfc3339())
    .bind(report.finished_at.map(|t| t.to_rfc3339()))
    .bind(&report.error)
    .bind(csv_path.map(|p| p.display().to_string()))
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM thresholds WHERE session_guid = ?")
        .bind(&guid)
        .execute(&mut *tx)
        .await?;

    for (position, record) in report.records.iter().enumerate() {
        let reason = match record.outcome {
            crate::types::ThresholdOutcome::NoResponse { reason } => Some(reason_str(reason)),
            crate::types::ThresholdOutcome::Threshold { .. } => None,
        };
        sqlx::query(
            r#"
            INSERT INTO thresholds (session_guid, position, ear, frequency_hz, level_db, no_response_reason)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&guid)
        .bind(position as i64)
        .bind(record.ear.as_str())
        .bind(record.frequency_hz as i64)
        .bind(record.level())
        .bind(reason)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    debug!(
        "Saved session {} ({}, {} records)",
        guid,
        report.status,
        report.records.len()
    );
    Ok(())
}

/// Load a stored session with its records in measurement order
pub async fn load_session(pool: &SqlitePool, session_id: Uuid) -> Result<SessionReport> {
    let guid = session_id.to_string();
    let row = sqlx::query(
        r#"
        SELECT subject, status, progress, started_at, finished_at, error
        FROM sessions
        WHERE guid = ?
        "#,
    )
    .bind(&guid)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("session {}", guid)))?;

    let status: SessionStatus = row
        .get::<String, _>("status")
        .parse()
        .map_err(Error::Format)?;
    let finished_at = row
        .get::<Option<String>, _>("finished_at")
        .map(|s| parse_timestamp(&s))
        .transpose()?;

    let rows = sqlx::query(
        r#"
        SELECT ear, frequency_hz, level_db, no_response_reason
        FROM thresholds
        WHERE session_guid = ?
        ORDER BY position
        "#,
    )
    .bind(&guid)
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let ear: Ear = row.get::<String, _>("ear").parse().map_err(Error::Format)?;
        let frequency_hz = row.get::<i64, _>("frequency_hz") as u32;
        let record = match (
            row.get::<Option<i64>, _>("level_db"),
            row.get::<Option<String>, _>("no_response_reason"),
        ) {
            (Some(level), _) => ThresholdRecord::threshold(ear, frequency_hz, level as i32),
            (None, Some(reason)) => {
                ThresholdRecord::no_response(ear, frequency_hz, parse_reason(&reason)?)
            }
            (None, None) => {
                return Err(Error::Format(format!(
                    "threshold row {} {} Hz has neither level nor reason",
                    ear, frequency_hz
                )))
            }
        };
        records.push(record);
    }

    Ok(SessionReport {
        session_id,
        subject: row.get("subject"),
        status,
        progress: row.get("progress"),
        records,
        started_at: parse_timestamp(&row.get::<String, _>("started_at"))?,
        finished_at,
        error: row.get("error"),
    })
}

/// List stored sessions, newest first, optionally for one subject
pub async fn list_sessions(
    pool: &SqlitePool,
    subject: Option<&str>,
) -> Result<Vec<SessionSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT s.guid, s.subject, s.status, s.started_at, s.csv_path,
               (SELECT COUNT(*) FROM thresholds t WHERE t.session_guid = s.guid) AS record_count
        FROM sessions s
        WHERE ? IS NULL OR s.subject = ?
        ORDER BY s.started_at DESC
        "#,
    )
    .bind(subject)
    .bind(subject)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let guid: String = row.get("guid");
            Ok(SessionSummary {
                session_id: Uuid::parse_str(&guid)
                    .map_err(|e| Error::Format(format!("bad session guid '{}': {}", guid, e)))?,
                subject: row.get("subject"),
                status: row
                    .get::<String, _>("status")
                    .parse()
                    .map_err(Error::Format)?,
                started_at: parse_timestamp(&row.get::<String, _>("started_at"))?,
                record_count: row.get("record_count"),
                csv_path: row.get("csv_path"),
            })
        })
        .collect()
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Format(format!("bad timestamp '{}': {}", value, e)))
}

fn reason_str(reason: NoResponseReason) -> &'static str {
    match reason {
        NoResponseReason::SafetyLimitReached => "safety_limit_reached",
        NoResponseReason::PresentationLimitReached => "presentation_limit_reached",
    }
}

fn parse_reason(value: &str) -> Result<NoResponseReason> {
    match value {
        "safety_limit_reached" => Ok(NoResponseReason::SafetyLimitReached),
        "presentation_limit_reached" => Ok(NoResponseReason::PresentationLimitReached),
        other => Err(Error::Format(format!("unknown no-response reason '{}'", other))),
    }
}
