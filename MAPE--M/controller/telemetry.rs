use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};
use tokio::runtime::Handle;

/// Builder for controller telemetry.
pub struct ControllerTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    sinks: Vec<Arc<dyn LogSink>>,
    threshold: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl ControllerTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            sinks: Vec::new(),
            threshold: LogLevel::default(),
            event_publisher: None,
        }
    }

    /// Appends JSON lines to `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Adds another sink.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Drops records more verbose than `threshold`.
    #[must_use]
    pub fn threshold(mut self, threshold: LogLevel) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<ControllerTelemetry> {
        let mut sinks = self.sinks;
        if let Some(path) = self.log_path {
            sinks.insert(0, Arc::new(JsonLogger::new(path)?));
        }
        Ok(ControllerTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                threshold: self.threshold,
                sinks,
                publisher: self.event_publisher,
            }),
        })
    }
}

struct TelemetryInner {
    module: String,
    threshold: LogLevel,
    sinks: Vec<Arc<dyn LogSink>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

/// Telemetry handle injected into a controller instance.
///
/// Records are mirrored to `tracing` regardless of the configured sinks.
#[derive(Clone)]
pub struct ControllerTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for ControllerTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerTelemetry")
            .field("module", &self.inner.module)
            .field("threshold", &self.inner.threshold)
            .field("sinks", &self.inner.sinks.len())
            .finish()
    }
}

impl Default for ControllerTelemetry {
    fn default() -> Self {
        Self::disabled()
    }
}

impl ControllerTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> ControllerTelemetryBuilder {
        ControllerTelemetryBuilder::new(module)
    }

    /// Telemetry with no sinks and no publisher; only `tracing` sees records.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: "controller".into(),
                threshold: LogLevel::default(),
                sinks: Vec::new(),
                publisher: None,
            }),
        }
    }

    /// Module name stamped on records and events.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Returns true when a record at `level` would reach the sinks.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level.passes(self.inner.threshold)
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        mirror(level, &self.inner.module, message, &metadata);
        if !self.enabled(level) {
            return Ok(());
        }
        let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
        for sink in &self.inner.sinks {
            sink.write(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    ///
    /// Publishing happens on the ambient tokio runtime; outside one the event
    /// is dropped.
    pub fn event(&self, topic: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let record = EventRecord::new(&self.inner.module, topic, payload);
        match Handle::try_current() {
            Ok(handle) => {
                let publisher = Arc::clone(publisher);
                handle.spawn(async move {
                    if let Err(err) = publisher.publish(record).await {
                        tracing::warn!("telemetry event publish failed: {err:#}");
                    }
                });
            }
            Err(_) => tracing::debug!(topic, "no runtime, telemetry event dropped"),
        }
        Ok(())
    }
}

fn mirror(level: LogLevel, module: &str, message: &str, metadata: &Value) {
    match level {
        LogLevel::Error => tracing::error!(module, %metadata, "{message}"),
        LogLevel::Warn => tracing::warn!(module, %metadata, "{message}"),
        LogLevel::Major => tracing::info!(module, %metadata, "{message}"),
        LogLevel::Minor => tracing::debug!(module, %metadata, "{message}"),
        LogLevel::Detailed => tracing::trace!(module, %metadata, "{message}"),
    }
}
