//! Blocking SSE (Server-Sent Events) line parser.
//!
//! Turns any `BufRead` (normally a streaming HTTP body) into an iterator of
//! events. A blank line dispatches the pending event; `:` lines are comments.

use crate::error::PipelineError;
use std::io::BufRead;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

pub struct SseReader<R> {
    reader: R,
    line: String,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
    finished: bool,
}

impl<R: BufRead> SseReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            current_event: None,
            current_data: Vec::new(),
            current_id: None,
            finished: false,
        }
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            self.current_id = None;
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        Some(event)
    }
}

impl<R: BufRead> Iterator for SseReader<R> {
    type Item = Result<SseEvent, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    // Stream ended. Dispatch any remaining data.
                    self.finished = true;
                    return self.take_event().map(Ok);
                }
                Ok(_) => {}
                Err(err) => {
                    self.finished = true;
                    return Some(Err(PipelineError::Transport(format!(
                        "SSE stream error: {err}"
                    ))));
                }
            }

            let line = self.line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    return Some(Ok(event));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                self.current_event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                let value = value.strip_prefix(' ').unwrap_or(value).to_string();
                self.current_data.push(value);
            } else if let Some(value) = line.strip_prefix("id:") {
                self.current_id = Some(value.trim_start().to_string());
            }
            // Ignore unknown fields
        }
    }
}
