//! Event reports written to stdout

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::ValueEnum;
use kwatch_core::{EventKind, NotificationEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// One human-readable line per event
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// A resolved event as reported to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventReport {
    /// Affected entry: the watched path joined with the child name
    pub path: PathBuf,
    /// Watched path the event was resolved to
    pub watched: PathBuf,
    pub kinds: Vec<EventKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<u32>,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
}

impl EventReport {
    pub fn new(watched: &Path, event: &NotificationEvent) -> Self {
        Self {
            path: event.target_path(watched),
            watched: watched.to_path_buf(),
            kinds: event.kinds.kinds().collect(),
            cookie: event.cookie,
            is_dir: event.is_dir,
            pid: event.pid,
        }
    }

    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Text => Ok(self.render_text()),
            OutputFormat::Json => Ok(serde_json::to_string(self)?),
        }
    }

    fn render_text(&self) -> String {
        // Signal-delivered backends cannot say what changed
        let kinds = if self.kinds.is_empty() {
            "changed".to_string()
        } else {
            self.kinds
                .iter()
                .map(|kind| kind.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut line = format!("Received event in '{}': {}", self.path.display(), kinds);
        if let Some(cookie) = self.cookie {
            line.push_str(&format!(" (cookie: {cookie})"));
        }
        line
    }
}
