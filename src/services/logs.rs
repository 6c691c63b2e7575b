use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: String,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
}

/// Log trail handed to each pipeline stage.
///
/// Every event is kept in memory (so stages can be tested by inspecting what
/// they reported) and forwarded to the `log` facade.
#[derive(Debug, Default)]
pub struct PipelineLog {
    events: Vec<LogEvent>,
}

impl PipelineLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, component: &str, message: impl Into<String>) {
        self.record(LogLevel::Info, component, message.into());
    }

    pub fn warn(&mut self, component: &str, message: impl Into<String>) {
        self.record(LogLevel::Warning, component, message.into());
    }

    pub fn error(&mut self, component: &str, message: impl Into<String>) {
        self.record(LogLevel::Error, component, message.into());
    }

    fn record(&mut self, level: LogLevel, component: &str, message: String) {
        match level {
            LogLevel::Info => log::info!("[{}] {}", component, message),
            LogLevel::Warning => log::warn!("[{}] {}", component, message),
            LogLevel::Error => log::error!("[{}] {}", component, message),
        }
        self.events.push(LogEvent {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            level,
            component: component.to_string(),
            message,
        });
    }

    /// Move another trail's events to the end of this one.
    pub fn append(&mut self, other: PipelineLog) {
        self.events.extend(other.events);
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn count(&self, level: LogLevel) -> usize {
        self.events.iter().filter(|e| e.level == level).count()
    }

    /// Whether any event of `component` contains `needle`.
    pub fn contains(&self, component: &str, needle: &str) -> bool {
        self.events
            .iter()
            .any(|e| e.component == component && e.message.contains(needle))
    }

    /// Append the trail to a flat log file, one line per event.
    pub fn write_to(&self, path: &Path) -> Result<(), String> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("Failed to open log file {}: {}", path.display(), e))?;

        for event in &self.events {
            writeln!(
                file,
                "{} [{}] [{}] {}",
                event.timestamp, event.level, event.component, event.message
            )
            .map_err(|e| format!("Failed to write log file: {}", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pipeline_log_records_events() {
        let mut log = PipelineLog::new();
        log.info("collector", "Scanning C:\\Program Files");
        log.warn("collector", "Skipping unreadable key");
        log.error("detection", "No application found");

        assert_eq!(log.events().len(), 3);
        assert_eq!(log.count(LogLevel::Warning), 1);
        assert!(log.contains("collector", "unreadable"));
        assert!(!log.contains("differ", "unreadable"));
    }

    #[test]
    fn test_append_keeps_order() {
        let mut log = PipelineLog::new();
        log.info("differ", "first");
        let mut other = PipelineLog::new();
        other.warn("collector", "second");

        log.append(other);
        let messages: Vec<&str> = log.events().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[test]
    fn test_write_to_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("installscope.log");

        let mut log = PipelineLog::new();
        log.info("orchestrator", "first");
        log.write_to(&path).unwrap();
        log.write_to(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("[INFO] [orchestrator] first"));
    }
}
