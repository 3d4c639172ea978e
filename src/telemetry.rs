//! Outward telemetry for the reader process.
//!
//! Events always go to the tracing pipeline. When `TELEMETRY_EVENTS_PATH` is
//! set they are also appended to that file, one JSON document per line.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use hookline_core::{MulticastEventHandler, ReaderEvent, ReaderEventHandler, TracingEventHandler};
use tokio::{fs::File, io::AsyncWriteExt, sync::Mutex};
use tracing::{info, warn};

use crate::config::Config;

/// Appends every event to a file as a JSON line.
#[derive(Debug)]
pub struct JsonLinesEventSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesEventSink {
    /// Opens `path` for appending, creating it if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open telemetry file {}", path.display()))?;

        Ok(Self { path, file: Mutex::new(file) })
    }
}

#[async_trait::async_trait]
impl ReaderEventHandler for JsonLinesEventSink {
    async fn handle_event(&self, event: ReaderEvent) {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode reader event");
                return;
            },
        };
        line.push(b'\n');

        let mut file = self.file.lock().await;
        let written = match file.write_all(&line).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(path = %self.path.display(), error = %e, "failed to write reader event");
        }
    }
}

/// Builds the handler every reader event is sent to.
pub async fn event_handler(config: &Config) -> Result<MulticastEventHandler> {
    let mut events = MulticastEventHandler::new();
    events.add_subscriber(Arc::new(TracingEventHandler::new()));

    if let Some(path) = &config.telemetry_events_path {
        events.add_subscriber(Arc::new(JsonLinesEventSink::open(path.clone()).await?));
        info!(path = %path.display(), "Writing reader events to file");
    }

    Ok(events)
}
