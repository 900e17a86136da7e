//! Line-delimited JSON protocol spoken with the interpreter driver.
//!
//! Every event carries the correlation id (`parent`) of the submission that
//! produced it; the collector uses it to drop anything stale.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Python driver run inside every worker. It executes requests in one
/// persistent namespace and reports events on a private copy of stdout.
pub const DRIVER_SOURCE: &str = include_str!("driver.py");

pub const PNG_MIME: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: Uuid,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Stream {
        parent: Uuid,
        name: StreamName,
        text: String,
    },
    Error {
        parent: Uuid,
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    DisplayData {
        parent: Uuid,
        data: HashMap<String, String>,
    },
    /// The submission finished; nothing more will be emitted for `parent`.
    Idle { parent: Uuid },
}

impl WorkerEvent {
    pub fn parent(&self) -> Uuid {
        match self {
            WorkerEvent::Stream { parent, .. }
            | WorkerEvent::Error { parent, .. }
            | WorkerEvent::DisplayData { parent, .. }
            | WorkerEvent::Idle { parent } => *parent,
        }
    }
}

/// Serialize a request as one newline-terminated frame.
pub fn encode_request(request: &WorkerRequest) -> serde_json::Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(request)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decode one frame; anything that is not a protocol event yields `None`.
pub fn decode_event(line: &str) -> Option<WorkerEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Reassembles newline-delimited frames from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }
}
