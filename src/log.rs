//! Structured progress events
//!
//! Every installer takes a [`Sink`] at construction and reports user-facing
//! progress through it. Presentation (colors, files, prompts) is left to the
//! embedding application.

use std::sync::{Arc, Mutex};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Success,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogEvent {
    Message { level: Level, message: String },
    /// Start of a new titled section of output
    Section { title: String },
}

impl LogEvent {
    pub fn level(&self) -> Level {
        match self {
            Self::Message { level, .. } => *level,
            Self::Section { .. } => Level::Info,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Message { message, .. } => message,
            Self::Section { title } => title,
        }
    }
}

/// Append-only destination for [`LogEvent`]s
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

pub type Sink = Arc<dyn LogSink>;

/// Convenience methods on a shared sink
pub trait SinkExt {
    fn section(&self, title: impl Into<String>);
    fn debug(&self, message: impl Into<String>);
    fn info(&self, message: impl Into<String>);
    fn success(&self, message: impl Into<String>);
    fn warning(&self, message: impl Into<String>);
    fn error(&self, message: impl Into<String>);
    fn critical(&self, message: impl Into<String>);
}

fn message(level: Level, message: impl Into<String>) -> LogEvent {
    LogEvent::Message {
        level,
        message: message.into(),
    }
}

impl SinkExt for Sink {
    fn section(&self, title: impl Into<String>) {
        self.emit(LogEvent::Section {
            title: title.into(),
        });
    }

    fn debug(&self, msg: impl Into<String>) {
        self.emit(message(Level::Debug, msg));
    }

    fn info(&self, msg: impl Into<String>) {
        self.emit(message(Level::Info, msg));
    }

    fn success(&self, msg: impl Into<String>) {
        self.emit(message(Level::Success, msg));
    }

    fn warning(&self, msg: impl Into<String>) {
        self.emit(message(Level::Warning, msg));
    }

    fn error(&self, msg: impl Into<String>) {
        self.emit(message(Level::Error, msg));
    }

    fn critical(&self, msg: impl Into<String>) {
        self.emit(message(Level::Critical, msg));
    }
}

/// Forwards events to `tracing`; the subscriber is up to the application
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TracingSink {
    pub fn shared() -> Sink {
        Arc::new(Self)
    }
}

impl LogSink for TracingSink {
    fn emit(&self, event: LogEvent) {
        match event {
            LogEvent::Section { title } => tracing::info!(section = true, "{title}"),
            LogEvent::Message { level, message } => match level {
                Level::Debug => tracing::debug!("{message}"),
                Level::Info => tracing::info!("{message}"),
                Level::Success => tracing::info!(success = true, "{message}"),
                Level::Warning => tracing::warn!("{message}"),
                Level::Error => tracing::error!("{message}"),
                Level::Critical => tracing::error!(critical = true, "{message}"),
            },
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LogEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Messages at or above `level`, sections excluded
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, LogEvent::Message { .. }) && e.level() >= level)
            .map(|e| e.message().to_string())
            .collect()
    }

    pub fn sections(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LogEvent::Section { title } => Some(title),
                LogEvent::Message { .. } => None,
            })
            .collect()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, event: LogEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
