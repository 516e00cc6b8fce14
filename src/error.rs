//! Capture error taxonomy.
//!
//! The pipeline distinguishes two kinds of failure. Invalid events can
//! never succeed and are rejected outright; transient failures (embedding
//! provider down, database locked) are surfaced as retryable so the
//! delivering side can redeliver. Redelivery is safe because capture is
//! idempotent on `(workspace, source, source_id)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The event is malformed. Fatal: redelivering the same payload will
    /// fail the same way.
    #[error("invalid event: {0}")]
    Invalid(String),

    /// A transient infrastructure failure. The event was not stored and
    /// should be redelivered later.
    #[error("capture failed at {stage}: {source}")]
    Retryable {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl CaptureError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn retryable(stage: &'static str, source: anyhow::Error) -> Self {
        Self::Retryable { stage, source }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}
