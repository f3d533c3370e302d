//! Multi-line record assembly.
//!
//! Lines matching the record-start pattern open a new record; every other line
//! is a continuation and is appended to the record that is currently open.
//! Each line in an assembled body keeps its `\n` terminator.

use chrono::NaiveDateTime;
use regex::Regex;

use crate::record::{LogRecord, Severity};

/// A complete logical record together with the byte offset right after its
/// last line in the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledRecord {
    pub body: String,
    pub end_offset: u64,
}

impl AssembledRecord {
    /// Turn the raw body into a structured record.
    ///
    /// The event time comes from a leading `YYYY-MM-DD[ T]HH:MM:SS[.fff]`
    /// timestamp (read as UTC) when present, otherwise the observed time.
    pub fn into_log_record(self, observed_unix_nano: u64) -> LogRecord {
        let time = parse_leading_timestamp(&self.body).unwrap_or(observed_unix_nano);
        let severity = Severity::infer(&self.body);
        LogRecord::new(self.body)
            .with_time(time)
            .with_observed_time(observed_unix_nano)
            .with_severity(severity)
    }
}

pub struct RecordAssembler {
    start_pattern: Regex,
    current: Option<String>,
    current_end: u64,
}

impl RecordAssembler {
    pub fn new(start_pattern: Regex) -> Self {
        Self {
            start_pattern,
            current: None,
            current_end: 0,
        }
    }

    pub fn is_record_start(&self, line: &str) -> bool {
        self.start_pattern.is_match(line)
    }

    /// Feed one line (without its terminator) that ends at `end_offset`.
    ///
    /// Returns the previous record when this line starts a new one.
    pub fn push_line(&mut self, line: &str, end_offset: u64) -> Option<AssembledRecord> {
        let completed = if self.is_record_start(line) {
            self.finish()
        } else {
            None
        };

        let body = self.current.get_or_insert_with(String::new);
        body.push_str(line);
        body.push('\n');
        self.current_end = end_offset;

        completed
    }

    /// Close the open record, if any.
    pub fn finish(&mut self) -> Option<AssembledRecord> {
        self.current.take().map(|body| AssembledRecord {
            body,
            end_offset: self.current_end,
        })
    }

    /// Whether a record is open and waiting for more continuation lines.
    pub fn has_partial(&self) -> bool {
        self.current.is_some()
    }
}

/// Nanosecond epoch of an ISO-like timestamp at the very start of `text`.
pub fn parse_leading_timestamp(text: &str) -> Option<u64> {
    let head = text.get(..19)?;
    let mut normalized = head.to_string();
    if normalized.as_bytes()[10] == b' ' {
        normalized.replace_range(10..11, "T");
    }
    let parsed = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S").ok()?;
    let mut nanos = parsed.and_utc().timestamp_nanos_opt()?;

    let rest = &text[19..];
    if let Some(fraction) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(',')) {
        let digits: String = fraction.chars().take_while(|c| c.is_ascii_digit()).take(9).collect();
        if !digits.is_empty() {
            let scale = 10_i64.pow(9 - digits.len() as u32);
            nanos += digits.parse::<i64>().ok()? * scale;
        }
    }

    u64::try_from(nanos).ok()
}
