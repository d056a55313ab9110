use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};
use tokio::runtime::{Builder, Handle};

/// Builder for triage telemetry sinks.
pub struct TriageTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    log_sink: Option<Arc<dyn LogSink>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
    min_level: LogLevel,
}

impl TriageTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            log_sink: None,
            event_publisher: None,
            min_level: LogLevel::Debug,
        }
    }

    /// Writes records as JSON lines to `path`. Ignored when a custom sink is set.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Writes records to a custom sink.
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Drops log records below `level`.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<TriageTelemetry> {
        let sink = match (self.log_sink, self.log_path) {
            (Some(sink), _) => Some(sink),
            (None, Some(path)) => Some(Arc::new(JsonLogger::new(path)?) as Arc<dyn LogSink>),
            (None, None) => None,
        };
        Ok(TriageTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                sink,
                publisher: self.event_publisher,
                min_level: self.min_level,
            }),
        })
    }
}

/// Telemetry handle shared by every request evaluation.
#[derive(Clone)]
pub struct TriageTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for TriageTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriageTelemetry")
            .field("module", &self.inner.module)
            .field("min_level", &self.inner.min_level)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    sink: Option<Arc<dyn LogSink>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    min_level: LogLevel,
}

impl TriageTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> TriageTelemetryBuilder {
        TriageTelemetryBuilder::new(module)
    }

    /// Writes one structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if level < self.inner.min_level {
            return Ok(());
        }
        if let Some(sink) = &self.inner.sink {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            sink.write(&record)?;
        }
        Ok(())
    }

    /// Publishes an event without waiting for the publisher. Outside a runtime the publish runs
    /// to completion on a current-thread runtime, so publishers built on `tokio::fs` still work.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let record = EventRecord::new(self.inner.module.clone(), event_type, payload);
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    tracing::warn!(error = ?err, "triage event publish failed");
                }
            });
            Ok(())
        } else {
            Builder::new_current_thread()
                .enable_all()
                .build()
                .context("starting runtime for event publish")?
                .block_on(publisher.publish(record))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::{EventSubscriber, FileEventPublisher, MemoryEventBus};
    use shared_logging::MemoryLogSink;
    use tempfile::tempdir;

    #[tokio::test]
    async fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("triage.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let mut rx = bus.subscribe().await.unwrap();
        let telemetry = TriageTelemetry::builder("triage")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "triage.outcome", json!({ "route": "enforced" }))
            .unwrap();
        telemetry
            .event("triage.decision", json!({ "action": "redirect" }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("triage.outcome"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "triage.decision");
        assert_eq!(event.source, "triage");
    }

    #[test]
    fn publishes_synchronously_outside_a_runtime() {
        let bus = Arc::new(MemoryEventBus::new(4));
        let telemetry = TriageTelemetry::builder("triage")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry.event("triage.decision", Value::Null).unwrap();
        assert_eq!(bus.snapshot().len(), 1);
    }

    #[test]
    fn file_events_are_written_outside_a_runtime() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        let telemetry = TriageTelemetry::builder("triage")
            .event_publisher(Arc::new(FileEventPublisher::new(&path).unwrap()))
            .build()
            .unwrap();
        telemetry
            .event("triage.decision", json!({ "route": "degraded" }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("triage.decision"));
    }

    #[test]
    fn custom_sink_respects_min_level() {
        let sink = Arc::new(MemoryLogSink::new(8));
        let telemetry = TriageTelemetry::builder("triage")
            .log_sink(sink.clone())
            .min_level(LogLevel::Warn)
            .build()
            .unwrap();
        telemetry.log(LogLevel::Info, "dropped", Value::Null).unwrap();
        telemetry.log(LogLevel::Warn, "kept", Value::Null).unwrap();
        let messages: Vec<_> = sink.records().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["kept"]);
    }
}
