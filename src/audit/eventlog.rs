//! CP-020: Session event log, written as JSONL next to each role.

use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Audit directory inside every written role.
pub const AUDIT_DIR: &str = ".cookport";

/// Something that happened during a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        session: String,
        cookbook: String,
        declarations: usize,
        unresolved: usize,
        cookport_version: String,
    },
    PhaseEntered {
        phase: String,
        attempt: u32,
    },
    GenerationRetried {
        attempt: u32,
        retry: u32,
        error: String,
        delay_ms: u64,
    },
    GatewayRetried {
        attempt: u32,
        retry: u32,
        error: String,
        delay_ms: u64,
    },
    CandidateProduced {
        attempt: u32,
        files: usize,
        fingerprint: String,
    },
    ValidationFinished {
        attempt: u32,
        ok: bool,
        blocking: usize,
    },
    FeedbackIssued {
        attempt: u32,
        categories: Vec<String>,
        generic: bool,
    },
    SessionConcluded {
        outcome: String,
        attempts: usize,
    },
}

/// An event with its wall-clock time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: SessionEvent,
}

impl TimestampedEvent {
    pub fn now(event: SessionEvent) -> Self {
        Self {
            ts: now_iso8601(),
            event,
        }
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_utc(secs)
}

fn format_utc(secs: u64) -> String {
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let (hours, minutes, seconds) = (time_secs / 3600, (time_secs % 3600) / 60, time_secs % 60);

    let mut year = 1970i64;
    let mut remaining = days as i64;
    loop {
        let year_days = if is_leap(year) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        year += 1;
    }
    let feb = if is_leap(year) { 29 } else { 28 };
    let month_days = [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 12;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md {
            month = i + 1;
            break;
        }
        remaining -= md;
    }

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        remaining + 1,
        hours,
        minutes,
        seconds
    )
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Session id: `s-` plus 12 hex digits of the clock, salted with the cookbook
/// name so concurrent sessions started in the same tick differ.
pub fn generate_session_id(cookbook: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let salt = blake3::hash(cookbook.as_bytes());
    let salt = u64::from_le_bytes(
        salt.as_bytes()[..8]
            .try_into()
            .unwrap_or([0u8; 8]),
    );
    format!("s-{:012x}", ((nanos as u64) ^ salt) & 0xFFFF_FFFF_FFFF)
}

pub fn event_log_path(role_dir: &Path) -> PathBuf {
    role_dir.join(AUDIT_DIR).join("events.jsonl")
}

/// Append events to the role's log, creating it if needed.
pub fn append_events(role_dir: &Path, events: &[TimestampedEvent]) -> Result<()> {
    let path = event_log_path(role_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConvertError::io(parent, e))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| ConvertError::io(&path, e))?;
    for event in events {
        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json).map_err(|e| ConvertError::io(&path, e))?;
    }
    Ok(())
}
