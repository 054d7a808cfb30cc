//! Metric extraction from tool logs.
//!
//! The flow tool prints its summary as free text (`Cells: 1234`,
//! `WNS: -0.05`, ...). [`LineTableParser`] walks the log line by line and
//! matches each line against an ordered table of prefixes. The result is
//! sparse: a field the log never mentions is simply absent.
//!
//! This is coupled to the tool's output format. Keep it behind
//! [`StatsParser`] so the status machine does not care how stats are found.

use crate::types::Stats;

/// Line that marks a successful end-to-end flow run.
pub const SUCCESS_MARKER: &str = "Flow completed successfully";

/// Field set when [`SUCCESS_MARKER`] is seen.
pub const STATUS_FIELD: &str = "status";

/// Default prefix table, in match order.
pub const DEFAULT_RULES: &[(&str, &str)] = &[
    ("Cells:", "cells"),
    ("Area:", "area"),
    ("WNS:", "wns"),
    ("TNS:", "tns"),
    ("Power:", "power"),
    ("Utilization:", "utilization"),
    ("Fmax:", "fmax"),
    ("DRC violations:", "drc_violations"),
    ("LVS:", "lvs"),
    ("Duration:", "duration"),
];

/// Extracts named metrics from log text.
pub trait StatsParser: Send + Sync {
    fn parse(&self, log: &str) -> Stats;
}

/// One `prefix -> field` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRule {
    pub prefix: String,
    pub field: String,
}

impl LineRule {
    pub fn new(prefix: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            field: field.into(),
        }
    }
}

/// Table-driven line matcher.
#[derive(Debug, Clone)]
pub struct LineTableParser {
    rules: Vec<LineRule>,
    success_marker: String,
}

impl Default for LineTableParser {
    fn default() -> Self {
        Self::new(
            DEFAULT_RULES
                .iter()
                .map(|(prefix, field)| LineRule::new(*prefix, *field))
                .collect(),
            SUCCESS_MARKER,
        )
    }
}

impl LineTableParser {
    pub fn new(rules: Vec<LineRule>, success_marker: impl Into<String>) -> Self {
        Self {
            rules,
            success_marker: success_marker.into(),
        }
    }

    pub fn rules(&self) -> &[LineRule] {
        &self.rules
    }

    /// Match one line. Returns the field and its raw value.
    fn match_line<'a>(&'a self, line: &'a str) -> Option<(&'a str, &'a str)> {
        let line = line.trim_start();
        if !self.success_marker.is_empty() && line.starts_with(&self.success_marker) {
            return Some((STATUS_FIELD, "completed"));
        }
        self.rules.iter().find_map(|rule| {
            line.strip_prefix(rule.prefix.as_str())
                .map(|rest| (rule.field.as_str(), rest.trim()))
        })
    }
}

impl StatsParser for LineTableParser {
    /// Parse a log. Later lines overwrite earlier ones for the same field,
    /// so the final stage of a multi-stage flow wins.
    ///
    /// # Example
    /// ```
    /// use farm_core::stats::{LineTableParser, StatsParser};
    ///
    /// let stats = LineTableParser::default().parse("Cells: 12\nnoise\nWNS: 0.1\n");
    /// assert_eq!(stats.get("cells").map(String::as_str), Some("12"));
    /// assert_eq!(stats.get("wns").map(String::as_str), Some("0.1"));
    /// assert!(stats.get("area").is_none());
    /// ```
    fn parse(&self, log: &str) -> Stats {
        let mut stats = Stats::new();
        for line in log.lines() {
            if let Some((field, value)) = self.match_line(line) {
                if value.is_empty() {
                    continue;
                }
                stats.insert(field.to_string(), value.to_string());
            }
        }
        stats
    }
}
