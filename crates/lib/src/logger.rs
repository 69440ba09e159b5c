//! In-process log buffer shared by the chat client, diagnostics and session.
//!
//! Entries are kept in a bounded ring (oldest evicted first) so a UI or the CLI can
//! filter, count and export them. Every record is also forwarded to the `log` facade.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub const ALL: [LogLevel; 4] = [LogLevel::Error, LogLevel::Warn, LogLevel::Info, LogLevel::Debug];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    fn to_log(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(LogLevel::Error),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Captured error: name, message and the flattened `source()` chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Capture `err` under `name`; each error in the source chain becomes one stack line.
    pub fn from_error(name: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut frames = Vec::new();
        let mut source = err.source();
        while let Some(s) = source {
            frames.push(format!("caused by: {}", s));
            source = s.source();
        }
        Self {
            name: name.into(),
            message: err.to_string(),
            stack: if frames.is_empty() {
                None
            } else {
                Some(frames.join("\n"))
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl LogEntry {
    /// Human-readable block: header line, then optional Data / Error / Stack lines.
    pub fn to_text(&self) -> String {
        let mut line = format!(
            "[{}] [{}] [{}] {}",
            self.timestamp.to_rfc3339(),
            self.level,
            self.category,
            self.message
        );
        if let Some(ref data) = self.data {
            let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
            line.push_str(&format!("\nData: {}", pretty));
        }
        if let Some(ref err) = self.error {
            line.push_str(&format!("\nError: {}: {}", err.name, err.message));
            if let Some(ref stack) = err.stack {
                line.push_str(&format!("\nStack: {}", stack));
            }
        }
        line
    }

    /// Case-insensitive match of `term` against message, category and data.
    pub fn mentions(&self, term: &str) -> bool {
        let term = term.to_lowercase();
        self.message.to_lowercase().contains(&term)
            || self.category.to_lowercase().contains(&term)
            || self
                .data
                .as_ref()
                .map(|d| d.to_string().to_lowercase().contains(&term))
                .unwrap_or(false)
    }
}

/// Conjunction of optional level, category and free-text conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub category: Option<String>,
    pub search: Option<String>,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.level.map_or(true, |l| entry.level == l)
            && self.category.as_deref().map_or(true, |c| entry.category == c)
            && self
                .search
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .map_or(true, |t| entry.mentions(t))
    }
}

/// Aggregate counts over the current buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub total: usize,
    pub by_level: BTreeMap<LogLevel, usize>,
    pub by_category: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "txt",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "txt" | "text" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

struct Ring {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

/// Shared handle to the log ring. Clones point at the same buffer.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Mutex<Ring>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.ring();
        f.debug_struct("Logger")
            .field("capacity", &ring.capacity)
            .field("len", &ring.entries.len())
            .finish()
    }
}

impl Logger {
    pub fn new(max_entries: usize) -> Self {
        let capacity = max_entries.max(1);
        Self {
            inner: Arc::new(Mutex::new(Ring {
                capacity,
                entries: VecDeque::with_capacity(capacity.min(DEFAULT_MAX_ENTRIES)),
            })),
        }
    }

    // A panic while holding the lock leaves the ring itself consistent, so poisoning is ignored.
    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.ring().capacity
    }

    /// Append one entry. `data` is serialized into an owned snapshot.
    pub fn record<T: Serialize + ?Sized>(
        &self,
        level: LogLevel,
        category: &str,
        message: impl Into<String>,
        data: Option<&T>,
        error: Option<ErrorInfo>,
    ) {
        let data = data.map(|d| {
            serde_json::to_value(d)
                .unwrap_or_else(|e| serde_json::Value::String(format!("<unserializable: {}>", e)))
        });
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            category: category.to_string(),
            message: message.into(),
            data,
            error,
        };
        forward(&entry);
        let mut ring = self.ring();
        while ring.entries.len() >= ring.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(entry);
    }

    pub fn error<T: Serialize + ?Sized>(
        &self,
        category: &str,
        message: impl Into<String>,
        data: Option<&T>,
        error: Option<ErrorInfo>,
    ) {
        self.record(LogLevel::Error, category, message, data, error);
    }

    pub fn warn<T: Serialize + ?Sized>(&self, category: &str, message: impl Into<String>, data: Option<&T>) {
        self.record(LogLevel::Warn, category, message, data, None);
    }

    pub fn info<T: Serialize + ?Sized>(&self, category: &str, message: impl Into<String>, data: Option<&T>) {
        self.record(LogLevel::Info, category, message, data, None);
    }

    pub fn debug<T: Serialize + ?Sized>(&self, category: &str, message: impl Into<String>, data: Option<&T>) {
        self.record(LogLevel::Debug, category, message, data, None);
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.ring().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.ring()
            .entries
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }

    pub fn by_category(&self, category: &str) -> Vec<LogEntry> {
        self.ring()
            .entries
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    /// Entries whose message, category or data mention `term`.
    pub fn search(&self, term: &str) -> Vec<LogEntry> {
        self.query(&LogFilter {
            search: Some(term.to_string()),
            ..LogFilter::default()
        })
    }

    pub fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.ring()
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.ring().entries.clear();
    }

    pub fn stats(&self) -> LogStats {
        let ring = self.ring();
        let mut stats = LogStats {
            total: ring.entries.len(),
            by_level: LogLevel::ALL.iter().map(|l| (*l, 0)).collect(),
            by_category: BTreeMap::new(),
        };
        for e in &ring.entries {
            *stats.by_level.entry(e.level).or_insert(0) += 1;
            *stats.by_category.entry(e.category.clone()).or_insert(0) += 1;
        }
        stats
    }

    pub fn export_json(&self) -> Result<String> {
        render(&self.entries(), LogFormat::Json)
    }

    pub fn export_text(&self) -> String {
        render_text(&self.entries())
    }

    pub fn export(&self, format: LogFormat) -> Result<String> {
        render(&self.entries(), format)
    }

    /// Write an export of the buffer to `path`.
    pub fn write_to(&self, path: &Path, format: LogFormat) -> Result<()> {
        let content = self.export(format)?;
        std::fs::write(path, content)
            .with_context(|| format!("writing logs to {}", path.display()))?;
        self.info::<()>("LOGGER", format!("logs exported to {}", path.display()), None);
        Ok(())
    }
}

/// Render a selection of entries the same way the full exports are rendered.
pub fn render(entries: &[LogEntry], format: LogFormat) -> Result<String> {
    match format {
        LogFormat::Json => {
            serde_json::to_string_pretty(entries).context("serializing log entries")
        }
        LogFormat::Text => Ok(render_text(entries)),
    }
}

fn render_text(entries: &[LogEntry]) -> String {
    entries
        .iter()
        .map(LogEntry::to_text)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// File name for an export taken now, e.g. `assistant-logs-2024-05-01T10-00-00-000Z.txt`.
pub fn default_export_name(format: LogFormat) -> String {
    let ts = Utc::now()
        .format("%Y-%m-%dT%H-%M-%S-%3fZ")
        .to_string();
    format!("assistant-logs-{}.{}", ts, format.extension())
}

fn forward(entry: &LogEntry) {
    let level = entry.level.to_log();
    if !log::log_enabled!(target: "assistant", level) {
        return;
    }
    match (&entry.data, &entry.error) {
        (_, Some(err)) => log::log!(
            target: "assistant",
            level,
            "[{}] {}: {}: {}",
            entry.category,
            entry.message,
            err.name,
            err.message
        ),
        (Some(data), None) => {
            log::log!(target: "assistant", level, "[{}] {} {}", entry.category, entry.message, data)
        }
        (None, None) => log::log!(target: "assistant", level, "[{}] {}", entry.category, entry.message),
    }
}
