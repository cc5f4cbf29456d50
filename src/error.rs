//! Error taxonomy shared by the pipeline stages.
//!
//! Stage handlers return `PipelineError`; the runtime logs them and keeps the
//! worker alive. Only the binary and configuration layer use `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Audio device could not be opened, read, or written.
    #[error("audio device error: {0}")]
    Device(String),

    /// The voice-activity classifier failed on a frame.
    #[error("classifier error: {0}")]
    Classifier(String),

    /// The remote conversational service failed or the stream broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// A response chunk arrived for a superseded session or request.
    #[error("stale response discarded (session {session}, request {request_id})")]
    StaleResponseDiscarded { session: u64, request_id: String },

    /// A worker did not exit within its join budget.
    #[error("{worker} did not stop within {waited_ms} ms")]
    ShutdownTimeout { worker: String, waited_ms: u64 },

    /// Audio payload could not be encoded or decoded.
    #[error("audio codec error: {0}")]
    Codec(String),
}

impl PipelineError {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineError::Device(_) => "device",
            PipelineError::Classifier(_) => "classifier",
            PipelineError::Transport(_) => "transport",
            PipelineError::StaleResponseDiscarded { .. } => "stale_response_discarded",
            PipelineError::ShutdownTimeout { .. } => "shutdown_timeout",
            PipelineError::Codec(_) => "codec",
        }
    }

    /// Stale responses are expected during barge-in and are not failures.
    pub fn is_stale(&self) -> bool {
        matches!(self, PipelineError::StaleResponseDiscarded { .. })
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Transport(err.to_string())
    }
}

impl From<hound::Error> for PipelineError {
    fn from(err: hound::Error) -> Self {
        PipelineError::Codec(err.to_string())
    }
}

impl From<base64::DecodeError> for PipelineError {
    fn from(err: base64::DecodeError) -> Self {
        PipelineError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_errors_are_distinguishable() {
        let stale = PipelineError::StaleResponseDiscarded {
            session: 3,
            request_id: "req-1".to_string(),
        };
        assert!(stale.is_stale());
        assert_eq!(stale.label(), "stale_response_discarded");
        assert!(!PipelineError::Transport("reset".to_string()).is_stale());
    }

    #[test]
    fn shutdown_timeout_message_names_worker() {
        let err = PipelineError::ShutdownTimeout {
            worker: "stage:ears".to_string(),
            waited_ms: 1000,
        };
        assert_eq!(err.to_string(), "stage:ears did not stop within 1000 ms");
    }
}
