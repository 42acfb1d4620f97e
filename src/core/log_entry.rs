//! Structured log lines and the query filter model

use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Thread tag given to lines that do not follow the server log grammar
pub const FALLBACK_THREAD: &str = "System";
/// Level given to lines that do not follow the server log grammar
pub const FALLBACK_LEVEL: &str = "INFO";

/// `[HH:MM:SS] [<thread>/<level>]: <message>`; the level is the last `/` segment
static LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{2}:\d{2}:\d{2})\] \[([^\]]+)/([^/\]]+)\]: (.*)$").expect("valid log line regex")
});

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// A line split into its structured fields, before a sequence is assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    /// `HH:MM:SS` as printed by the process, or the capture time for unstructured lines
    pub source_timestamp: String,
    pub thread: String,
    pub level: String,
    pub message: String,
    /// Whether the line matched the server log grammar
    pub structured: bool,
}

/// Parse one output line, synthesizing `System/INFO` fields when it does not match
pub fn parse_line(raw: &str, ingest_time: DateTime<Utc>) -> ParsedLine {
    match LINE_PATTERN.captures(raw) {
        Some(caps) => ParsedLine {
            source_timestamp: caps[1].to_string(),
            thread: caps[2].to_string(),
            level: caps[3].to_string(),
            message: caps[4].to_string(),
            structured: true,
        },
        None => ParsedLine {
            source_timestamp: ingest_time
                .with_timezone(&Local)
                .format("%H:%M:%S")
                .to_string(),
            thread: FALLBACK_THREAD.to_string(),
            level: FALLBACK_LEVEL.to_string(),
            message: raw.to_string(),
            structured: false,
        },
    }
}

/// One stored line of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub instance_name: String,
    pub start_id: i64,
    /// Authoritative order within the run
    pub sequence: i64,
    /// Advisory only
    pub source_timestamp: String,
    pub ingest_time: DateTime<Utc>,
    pub thread: String,
    pub level: String,
    pub message: String,
    pub stream: StreamKind,
}

impl LogEntry {
    /// Render in the same shape the server printed it
    pub fn display_line(&self) -> String {
        format!(
            "[{}] [{}/{}]: {}",
            self.source_timestamp, self.thread, self.level, self.message
        )
    }
}

/// Which runs a query searches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunSelector {
    /// Only the most recent run
    #[default]
    Latest,
    /// Exactly one run
    Exact(i64),
    /// Every run with `min <= start_id <= max`
    Range { min: i64, max: i64 },
}

/// Filters for a log query; all set filters must match
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub runs: RunSelector,
    pub ingested_since: Option<DateTime<Utc>>,
    pub ingested_until: Option<DateTime<Utc>>,
    pub source_since: Option<NaiveTime>,
    pub source_until: Option<NaiveTime>,
    /// `*` matches any run of characters, `\*` a literal asterisk
    pub message_pattern: Option<String>,
    pub limit: Option<usize>,
}

impl LogQuery {
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn for_run(start_id: i64) -> Self {
        Self {
            runs: RunSelector::Exact(start_id),
            ..Default::default()
        }
    }

    pub fn for_runs(min: i64, max: i64) -> Self {
        Self {
            runs: RunSelector::Range { min, max },
            ..Default::default()
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.message_pattern = Some(pattern.into());
        self
    }

    pub fn ingested_between(
        mut self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.ingested_since = since;
        self.ingested_until = until;
        self
    }

    pub fn source_between(mut self, since: Option<NaiveTime>, until: Option<NaiveTime>) -> Self {
        self.source_since = since;
        self.source_until = until;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
