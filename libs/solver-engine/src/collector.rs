/// Output Collector - classify one submission's event stream
///
/// Consumes worker events until the completion event for the current
/// submission arrives. Events tagged with any other correlation id belong to
/// an abandoned submission and are dropped, never reordered into this result.
use crate::protocol::{StreamName, WorkerEvent, PNG_MIME};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

/// Assembled output of one submission, in emission order per bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedOutput {
    pub output: String,
    pub error: String,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollectError {
    #[error("worker event stream closed before submission {0} completed")]
    StreamClosed(Uuid),
    #[error("worker sent nothing for submission {submission} within {deadline:?}")]
    ReadDeadline { submission: Uuid, deadline: Duration },
}

/// The four buckets an event can land in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Output(String),
    Error(String),
    Artifact(String),
    Complete,
}

/// Map a worker event to its bucket. Display data without a PNG payload
/// carries nothing we keep.
pub fn classify(event: WorkerEvent) -> Option<Classified> {
    match event {
        WorkerEvent::Stream { name: StreamName::Stdout, text, .. } => Some(Classified::Output(text)),
        WorkerEvent::Stream { name: StreamName::Stderr, text, .. } => Some(Classified::Error(text)),
        WorkerEvent::Error { ename, evalue, traceback, .. } => {
            let mut message = if traceback.is_empty() {
                format!("{}: {}", ename, evalue)
            } else {
                traceback.concat()
            };
            if !message.ends_with('\n') {
                message.push('\n');
            }
            Some(Classified::Error(message))
        }
        WorkerEvent::DisplayData { mut data, .. } => data.remove(PNG_MIME).map(Classified::Artifact),
        WorkerEvent::Idle { .. } => Some(Classified::Complete),
    }
}

/// Collect events for `submission` until it completes.
///
/// `read_deadline` bounds the silence between two matching events; stale
/// events do not extend it. Dropping the returned future abandons the wait.
pub async fn collect(
    events: &mut mpsc::Receiver<WorkerEvent>,
    submission: Uuid,
    read_deadline: Duration,
) -> Result<CollectedOutput, CollectError> {
    let mut collected = CollectedOutput::default();
    let mut discarded = 0usize;
    let mut deadline = Instant::now() + read_deadline;

    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(CollectError::StreamClosed(submission)),
            Err(_) => {
                return Err(CollectError::ReadDeadline {
                    submission,
                    deadline: read_deadline,
                })
            }
        };

        let parent = event.parent();
        if parent != submission {
            discarded += 1;
            trace!(%submission, stale = %parent, "Discarding event from another submission");
            continue;
        }
        deadline = Instant::now() + read_deadline;

        match classify(event) {
            Some(Classified::Output(text)) => collected.output.push_str(&text),
            Some(Classified::Error(text)) => collected.error.push_str(&text),
            Some(Classified::Artifact(blob)) => collected.artifacts.push(blob),
            Some(Classified::Complete) => break,
            None => {}
        }
    }

    if discarded > 0 {
        debug!(%submission, discarded, "Dropped stale worker events");
    }
    Ok(collected)
}
