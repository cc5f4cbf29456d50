//! OpenAI-compatible omni chat-completions client (text + audio out).
//!
//! Requests are `stream: true`; each SSE `data:` line is one JSON chunk and the
//! stream ends with `data: [DONE]`. The chunk `id` is the request id.

use super::sse::SseReader;
use super::{
    ChunkStream, ConversationService, HistoryEntry, Modality, ResponseChunk, ServiceConfig,
    TurnRequest,
};
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::io::BufReader;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_DONE: &str = "[DONE]";

// --- request/response types ---

#[derive(Debug, Serialize)]
pub(crate) struct OmniRequest {
    model: String,
    messages: Vec<Message>,
    modalities: Vec<Modality>,
    audio: AudioOptions,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    InputAudio { input_audio: InputAudio },
}

#[derive(Debug, Serialize)]
struct InputAudio {
    data: String,
    format: &'static str,
}

#[derive(Debug, Serialize)]
struct AudioOptions {
    voice: String,
    format: String,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    audio: Option<AudioDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct AudioDelta {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    transcript: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl From<ChatCompletionChunk> for ResponseChunk {
    fn from(chunk: ChatCompletionChunk) -> Self {
        let delta = chunk
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.delta)
            .unwrap_or_default();
        let audio = delta.audio.unwrap_or_default();
        ResponseChunk {
            request_id: non_empty(chunk.id),
            text: non_empty(delta.content),
            audio_b64: non_empty(audio.data),
            transcript: non_empty(audio.transcript),
        }
    }
}

/// Parse one SSE `data:` payload. `Ok(None)` marks the end of the stream.
pub(crate) fn parse_chunk(data: &str) -> Result<Option<ResponseChunk>, PipelineError> {
    let data = data.trim();
    if data == STREAM_DONE {
        return Ok(None);
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|err| PipelineError::Transport(format!("malformed chunk: {err}")))?;
    Ok(Some(chunk.into()))
}

fn message_for(entry: &HistoryEntry) -> Message {
    let part = match entry {
        HistoryEntry::UserAudio(utterance) => ContentPart::InputAudio {
            input_audio: InputAudio {
                data: utterance.data_url(),
                format: "wav",
            },
        },
        HistoryEntry::UserText(text) | HistoryEntry::AssistantText(text) => {
            ContentPart::Text { text: text.clone() }
        }
    };
    Message {
        role: entry.role(),
        content: vec![part],
    }
}

pub struct OmniClient {
    config: ServiceConfig,
    client: reqwest::blocking::Client,
}

impl OmniClient {
    pub fn new(config: ServiceConfig) -> Result<Self, PipelineError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(config, client))
    }

    /// Use a preconfigured HTTP client (proxies, custom TLS roots).
    pub fn with_client(config: ServiceConfig, client: reqwest::blocking::Client) -> Self {
        Self { config, client }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    pub(crate) fn build_request(&self, request: &TurnRequest) -> OmniRequest {
        OmniRequest {
            model: self.config.model.clone(),
            messages: request.history.iter().map(message_for).collect(),
            modalities: request.modalities.clone(),
            audio: AudioOptions {
                voice: request
                    .voice
                    .clone()
                    .unwrap_or_else(|| self.config.voice.clone()),
                format: request.audio_format.clone(),
            },
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

impl ConversationService for OmniClient {
    fn open_stream(&self, request: &TurnRequest) -> Result<ChunkStream, PipelineError> {
        let body = self.build_request(request);
        tracing::debug!(
            model = %self.config.model,
            messages = body.messages.len(),
            "opening streaming request"
        );
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .header("accept", "text/event-stream")
            .json(&body)
            .send()?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().unwrap_or_default();
            return Err(PipelineError::Transport(format!(
                "service returned {status}: {detail}"
            )));
        }
        Ok(Box::new(OmniStream {
            events: SseReader::new(BufReader::new(response)),
            done: false,
        }))
    }
}

struct OmniStream<R> {
    events: SseReader<R>,
    done: bool,
}

impl<R: std::io::BufRead> Iterator for OmniStream<R> {
    type Item = Result<ResponseChunk, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let event = match self.events.next() {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    return None;
                }
            };
            match parse_chunk(&event.data) {
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unparseable chunk");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::EncodedUtterance;
    use std::io::{BufRead, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    fn config(base_url: &str) -> ServiceConfig {
        ServiceConfig {
            api_key: "sk-test".into(),
            base_url: base_url.into(),
            model: "qwen-omni-turbo".into(),
            voice: "Chelsie".into(),
            timeout: Duration::from_secs(5),
        }
    }

    fn utterance() -> EncodedUtterance {
        EncodedUtterance {
            wav_base64: "UklGRg==".into(),
            sample_rate: 16_000,
            frame_count: 1,
            start_index: 0,
            end_index: 1,
            duration: Duration::from_millis(32),
        }
    }

    #[test]
    fn request_body_matches_omni_dialect() {
        let client = OmniClient::new(config("https://example.com/v1")).expect("client");
        let request = TurnRequest::new(vec![
            HistoryEntry::UserAudio(utterance()),
            HistoryEntry::AssistantText("hello".into()),
        ]);
        let body = serde_json::to_value(client.build_request(&request)).expect("json");
        assert_eq!(body["model"], "qwen-omni-turbo");
        assert_eq!(body["modalities"], serde_json::json!(["text", "audio"]));
        assert_eq!(body["audio"], serde_json::json!({"voice": "Chelsie", "format": "wav"}));
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["type"], "input_audio");
        assert_eq!(
            body["messages"][0]["content"][0]["input_audio"]["data"],
            "data:audio/wav;base64,UklGRg=="
        );
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(
            body["messages"][1]["content"][0],
            serde_json::json!({"type": "text", "text": "hello"})
        );
    }

    #[test]
    fn voice_override_wins() {
        let client = OmniClient::new(config("https://example.com/v1")).expect("client");
        let mut request = TurnRequest::new(Vec::new());
        request.voice = Some("Ethan".into());
        let body = serde_json::to_value(client.build_request(&request)).expect("json");
        assert_eq!(body["audio"]["voice"], "Ethan");
    }

    #[test]
    fn parses_text_audio_and_transcript_deltas() {
        let chunk = parse_chunk(
            r#"{"id":"req-1","choices":[{"delta":{"content":"hi","audio":{"data":"AAA=","transcript":"hey"}}}]}"#,
        )
        .expect("parse")
        .expect("chunk");
        assert_eq!(chunk.request_id.as_deref(), Some("req-1"));
        assert_eq!(chunk.text.as_deref(), Some("hi"));
        assert_eq!(chunk.audio_b64.as_deref(), Some("AAA="));
        assert_eq!(chunk.transcript.as_deref(), Some("hey"));
    }

    #[test]
    fn usage_chunk_carries_only_the_id() {
        let chunk = parse_chunk(r#"{"id":"req-1","choices":[],"usage":{"total_tokens":5}}"#)
            .expect("parse")
            .expect("chunk");
        assert_eq!(
            chunk,
            ResponseChunk {
                request_id: Some("req-1".into()),
                ..ResponseChunk::default()
            }
        );
    }

    #[test]
    fn done_marker_ends_stream() {
        assert!(parse_chunk("[DONE]").expect("parse").is_none());
        assert!(parse_chunk("{not json").is_err());
    }

    #[test]
    fn stream_skips_malformed_chunks_and_stops_at_done() {
        let raw = "data: {\"id\":\"a\",\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n\
                   data: {broken\n\n\
                   data: [DONE]\n\n\
                   data: {\"id\":\"late\"}\n\n";
        let stream = OmniStream {
            events: SseReader::new(std::io::Cursor::new(raw.as_bytes().to_vec())),
            done: false,
        };
        let chunks: Vec<_> = stream.collect::<Result<_, _>>().expect("chunks");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text.as_deref(), Some("x"));
    }

    fn serve_once(status: &'static str, body: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = std::io::BufReader::new(stream.try_clone().expect("clone"));
            let mut head = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).expect("read") == 0 {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
                head.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).expect("body");
            head.push_str(&String::from_utf8_lossy(&request_body));
            let _ = tx.send(head);
            let mut stream = stream;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).expect("write");
        });
        (format!("http://{addr}/v1"), rx)
    }

    fn local_client(base_url: &str) -> OmniClient {
        let http = reqwest::blocking::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("http client");
        OmniClient::with_client(config(base_url), http)
    }

    #[test]
    fn streams_chunks_from_http_endpoint() {
        let (base_url, requests) = serve_once(
            "200 OK",
            "data: {\"id\":\"r1\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
             data: {\"id\":\"r1\",\"choices\":[{\"delta\":{\"audio\":{\"transcript\":\"Hello\"}}}]}\n\n\
             data: [DONE]\n\n",
        );
        let client = local_client(&base_url);
        let stream = client
            .open_stream(&TurnRequest::new(vec![HistoryEntry::UserText("hi".into())]))
            .expect("open");
        let chunks: Vec<_> = stream.collect::<Result<_, _>>().expect("chunks");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text.as_deref(), Some("Hel"));
        assert_eq!(chunks[1].transcript.as_deref(), Some("Hello"));

        let request = requests
            .recv_timeout(Duration::from_secs(5))
            .expect("request seen");
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert!(request.contains("\"stream\":true"));
    }

    #[test]
    fn http_errors_become_transport_errors() {
        let (base_url, _requests) = serve_once("401 Unauthorized", "bad key");
        let client = local_client(&base_url);
        let err = match client.open_stream(&TurnRequest::new(Vec::new())) {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert_eq!(err.label(), "transport");
        assert!(err.to_string().contains("401"));
    }
}
