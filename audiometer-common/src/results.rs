//! Result file format
//!
//! The CSV layout is consumed by downstream audiogram tooling and must stay
//! byte-for-byte stable:
//!
//! ```text
//! Conduction,air,
//! Masking,off,
//! Level/dB,Frequency/Hz,Earside
//! 25,1000,right
//! ```
//!
//! Rows use CRLF terminators. Only confirmed thresholds get a row;
//! NO_RESPONSE records live in the JSON summary written next to the CSV.

use crate::types::{Ear, SessionReport, ThresholdRecord};
use crate::{Error, Result};
use chrono::{DateTime, Local};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const LINE_END: &str = "\r\n";
const CONDUCTION_ROW: &str = "Conduction,air,";
const MASKING_ROW: &str = "Masking,off,";
const HEADER_ROW: &str = "Level/dB,Frequency/Hz,Earside";

/// Longest folder name produced by [`sanitize_subject_name`]
pub const MAX_SUBJECT_LEN: usize = 100;

const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Receives finalized (or partial) sessions for persistence
pub trait ResultSink: Send + Sync {
    fn persist(&self, report: &SessionReport) -> Result<()>;
}

/// Render the CSV document for a session
pub fn render_csv(records: &[ThresholdRecord]) -> String {
    let mut out = String::new();
    for row in [CONDUCTION_ROW, MASKING_ROW, HEADER_ROW] {
        out.push_str(row);
        out.push_str(LINE_END);
    }
    for record in records {
        if let Some(level) = record.level() {
            out.push_str(&format!("{},{},{}", level, record.frequency_hz, record.ear));
            out.push_str(LINE_END);
        }
    }
    out
}

/// Parse a CSV result document back into threshold records
///
/// Accepts both CRLF and LF terminators and integral float levels
/// (`25.0`) written by older tools.
pub fn parse_csv(content: &str) -> Result<Vec<ThresholdRecord>> {
    let mut lines = content.lines().map(|l| l.trim_end_matches('\r'));

    for expected in [CONDUCTION_ROW, MASKING_ROW, HEADER_ROW] {
        match lines.next() {
            Some(line) if line.trim_end_matches(',') == expected.trim_end_matches(',') => {}
            Some(line) => {
                return Err(Error::Format(format!(
                    "expected '{}', found '{}'",
                    expected, line
                )))
            }
            None => return Err(Error::Format(format!("missing row '{}'", expected))),
        }
    }

    let mut records = Vec::new();
    for (index, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row = index + 4;
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(Error::Format(format!("row {}: expected 3 fields", row)));
        }

        let level = parse_whole_number(fields[0])
            .and_then(|l| i32::try_from(l).ok())
            .ok_or_else(|| Error::Format(format!("row {}: invalid level '{}'", row, fields[0])))?;
        let frequency = parse_whole_number(fields[1])
            .and_then(|f| u32::try_from(f).ok())
            .filter(|f| *f > 0)
            .ok_or_else(|| {
                Error::Format(format!("row {}: invalid frequency '{}'", row, fields[1]))
            })?;
        let ear: Ear = fields[2]
            .parse()
            .map_err(|e| Error::Format(format!("row {}: {}", row, e)))?;

        records.push(ThresholdRecord::threshold(ear, frequency, level));
    }
    Ok(records)
}

fn parse_whole_number(field: &str) -> Option<i64> {
    if let Ok(value) = field.parse::<i64>() {
        return Some(value);
    }
    let value = field.parse::<f64>().ok()?;
    (value.is_finite() && value.fract() == 0.0).then_some(value as i64)
}

/// Make a subject name safe for use as a folder name
///
/// Replaces `<>:"/\|?*` with `_`, collapses runs of `_`, removes control
/// characters, trims `_` and `.`, prefixes Windows reserved names with
/// `User_`, falls back to `Unknown_Subject` and truncates to
/// [`MAX_SUBJECT_LEN`] characters.
pub fn sanitize_subject_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.trim().chars() {
        let mapped = match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => continue,
            c => c,
        };
        if mapped == '_' && sanitized.ends_with('_') {
            continue;
        }
        sanitized.push(mapped);
    }

    let mut sanitized = sanitized.trim_matches(|c| c == '_' || c == '.').to_string();

    if WINDOWS_RESERVED.contains(&sanitized.to_ascii_uppercase().as_str()) {
        sanitized = format!("User_{}", sanitized);
    }
    if sanitized.is_empty() {
        sanitized = "Unknown_Subject".to_string();
    }
    if sanitized.chars().count() > MAX_SUBJECT_LEN {
        sanitized = sanitized.chars().take(MAX_SUBJECT_LEN).collect();
    }
    sanitized
}

/// Result file name for a session start time: `result_%Y-%m-%d_%H-%M-%S.csv`
pub fn result_file_name(started: DateTime<Local>) -> String {
    format!("result_{}.csv", started.format("%Y-%m-%d_%H-%M-%S"))
}

/// Write a file through a temporary sibling and an atomic rename
///
/// Readers never observe a truncated document.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!("Wrote {} bytes to {}", content.len(), path.display());
    Ok(())
}

/// CSV + JSON summary result sink
///
/// Files land in `<results_dir>[/<sanitized subject>]/result_<timestamp>.csv`
/// with a `.json` sibling holding the full session report.
#[derive(Debug, Clone)]
pub struct CsvResultSink {
    csv_path: PathBuf,
}

impl CsvResultSink {
    /// Sink writing to an explicit CSV path
    pub fn new(csv_path: impl Into<PathBuf>) -> Self {
        Self {
            csv_path: csv_path.into(),
        }
    }

    /// Sink for a new session, creating the (per-subject) folder
    pub fn for_session(
        results_dir: &Path,
        subject: Option<&str>,
        started: DateTime<Local>,
    ) -> Result<Self> {
        let dir = match subject {
            Some(name) => results_dir.join(sanitize_subject_name(name)),
            None => results_dir.to_path_buf(),
        };
        fs::create_dir_all(&dir)?;
        info!("Results will be saved to {}", dir.display());
        Ok(Self::new(dir.join(result_file_name(started))))
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn summary_path(&self) -> PathBuf {
        self.csv_path.with_extension("json")
    }
}

impl ResultSink for CsvResultSink {
    fn persist(&self, report: &SessionReport) -> Result<()> {
        write_atomic(&self.csv_path, render_csv(&report.records).as_bytes())?;
        let summary = serde_json::to_vec_pretty(report)?;
        write_atomic(&self.summary_path(), &summary)?;
        info!(
            "Persisted {} records ({}) to {}",
            report.records.len(),
            report.status,
            self.csv_path.display()
        );
        Ok(())
    }
}

/// Load the records of an earlier (possibly partial) result file
pub fn load_csv(path: &Path) -> Result<Vec<ThresholdRecord>> {
    let content = fs::read_to_string(path)?;
    parse_csv(&content)
}

/// Records to resume from, given the CSV of an interrupted session
///
/// Prefers the JSON summary next to the CSV since it also carries
/// NO_RESPONSE records; falls back to the CSV rows alone.
pub fn load_prior_records(csv_path: &Path) -> Result<Vec<ThresholdRecord>> {
    let summary = csv_path.with_extension("json");
    if summary.exists() {
        let content = fs::read(&summary)?;
        let report: SessionReport = serde_json::from_slice(&content)?;
        debug!(
            "Resuming from summary {} ({} records)",
            summary.display(),
            report.records.len()
        );
        return Ok(report.records);
    }
    load_csv(csv_path)
}
