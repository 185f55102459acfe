use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

/// Wire shape of one stream-json line.
/// Uses `#[serde(other)]` to ignore message types we don't know about.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamMessage {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        text: Option<String>,
    },
    #[serde(rename = "tool_call")]
    ToolCall {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        tool_call: Option<Value>,
    },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(default)]
        message: Value,
    },
    #[serde(rename = "user")]
    User {
        #[serde(default)]
        message: Value,
    },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default, rename = "result")]
        result_text: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPhase {
    Started,
    Completed,
}

/// Normalised agent event.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Session init; carries the continuation token.
    Init { session_id: Option<String> },
    Thinking(String),
    ToolCall { phase: ToolPhase, name: String },
    AssistantText(String),
    Result {
        subtype: String,
        text: Option<String>,
        session_id: Option<String>,
        is_error: bool,
    },
    Error(String),
    /// A line that was not JSON at all.
    Raw(String),
}

/// Parse one stdout line into zero or more events.
///
/// Blank lines and JSON of an unknown type produce nothing; anything that is
/// not JSON comes back as [`AgentEvent::Raw`].
pub fn parse_line(line: &str) -> Vec<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<StreamMessage>(trimmed) {
        Ok(msg) => normalise(msg),
        Err(_) if serde_json::from_str::<Value>(trimmed).is_ok() => Vec::new(),
        Err(_) => vec![AgentEvent::Raw(trimmed.to_string())],
    }
}

fn normalise(msg: StreamMessage) -> Vec<AgentEvent> {
    match msg {
        StreamMessage::System { subtype, session_id } => {
            if subtype.as_deref().map_or(true, |s| s == "init") {
                vec![AgentEvent::Init { session_id }]
            } else {
                Vec::new()
            }
        }
        StreamMessage::Thinking { text } => vec![AgentEvent::Thinking(text.unwrap_or_default())],
        StreamMessage::ToolCall {
            subtype,
            name,
            tool_call,
        } => {
            let phase = match subtype.as_deref() {
                Some("completed") => ToolPhase::Completed,
                _ => ToolPhase::Started,
            };
            let name = name
                .or_else(|| tool_call.as_ref().and_then(first_key))
                .unwrap_or_else(|| "tool".into());
            vec![AgentEvent::ToolCall { phase, name }]
        }
        StreamMessage::Assistant { message } => assistant_events(&message),
        StreamMessage::User { message } => content_blocks(&message)
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|_| AgentEvent::ToolCall {
                phase: ToolPhase::Completed,
                name: "tool_result".into(),
            })
            .collect(),
        StreamMessage::Result {
            subtype,
            result_text,
            session_id,
            is_error,
        } => vec![AgentEvent::Result {
            subtype: subtype.unwrap_or_else(|| "unknown".into()),
            text: result_text,
            session_id,
            is_error,
        }],
        StreamMessage::Error { message, error } => {
            let text = message
                .or_else(|| {
                    error.map(|e| match e {
                        Value::String(s) => s,
                        other => other
                            .get("message")
                            .and_then(Value::as_str)
                            .map(String::from)
                            .unwrap_or_else(|| other.to_string()),
                    })
                })
                .unwrap_or_else(|| "unknown error".into());
            vec![AgentEvent::Error(text)]
        }
        StreamMessage::Unknown => Vec::new(),
    }
}

/// `{"editToolCall": {...}}` style payloads name the tool by their only key.
fn first_key(v: &Value) -> Option<String> {
    v.as_object().and_then(|o| o.keys().next().cloned())
}

fn content_blocks(message: &Value) -> Vec<Value> {
    message
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn assistant_events(message: &Value) -> Vec<AgentEvent> {
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        return vec![AgentEvent::AssistantText(text.to_string())];
    }
    content_blocks(message)
        .iter()
        .filter_map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") => block
                .get("text")
                .and_then(Value::as_str)
                .map(|t| AgentEvent::AssistantText(t.to_string())),
            Some("thinking") => Some(AgentEvent::Thinking(
                block
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )),
            Some("tool_use") => Some(AgentEvent::ToolCall {
                phase: ToolPhase::Started,
                name: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("tool")
                    .to_string(),
            }),
            _ => None,
        })
        .collect()
}

/// Final `result` message, if one was seen.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultInfo {
    pub subtype: String,
    pub text: Option<String>,
    pub is_error: bool,
}

/// Everything accumulated from one agent run.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub session_id: Option<String>,
    /// Assistant text and raw lines, in arrival order.
    pub accumulated: String,
    pub result: Option<ResultInfo>,
    pub errors: Vec<String>,
    pub tool_calls: usize,
}

impl StreamOutcome {
    pub fn apply(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::Init { session_id } => {
                if session_id.is_some() {
                    self.session_id = session_id.clone();
                }
            }
            AgentEvent::Thinking(_) => {}
            AgentEvent::ToolCall { phase, .. } => {
                if *phase == ToolPhase::Started {
                    self.tool_calls += 1;
                }
            }
            AgentEvent::AssistantText(text) | AgentEvent::Raw(text) => {
                if !self.accumulated.is_empty() {
                    self.accumulated.push('\n');
                }
                self.accumulated.push_str(text);
            }
            AgentEvent::Result {
                subtype,
                text,
                session_id,
                is_error,
            } => {
                if session_id.is_some() {
                    self.session_id = session_id.clone();
                }
                self.result = Some(ResultInfo {
                    subtype: subtype.clone(),
                    text: text.clone(),
                    is_error: *is_error,
                });
            }
            AgentEvent::Error(msg) => self.errors.push(msg.clone()),
        }
    }

    /// The agent's answer: the final result text when present, otherwise
    /// whatever was accumulated.
    pub fn output(&self) -> String {
        match self.result.as_ref().and_then(|r| r.text.as_deref()) {
            Some(text) if !text.trim().is_empty() => text.to_string(),
            _ => self.accumulated.clone(),
        }
    }
}

/// Last-output clock shared between the stream reader and the supervisor.
#[derive(Debug)]
pub struct Activity {
    last: Mutex<Instant>,
    bytes: AtomicU64,
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn touch(&self, n: usize) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn idle(&self) -> Duration {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).elapsed()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Reads the agent's stream-json stdout line by line.
pub struct StreamMonitor<R> {
    reader: BufReader<R>,
    outcome: StreamOutcome,
    activity: Arc<Activity>,
    tee_writer: Option<std::io::BufWriter<std::fs::File>>,
}

impl<R: AsyncRead + Unpin> StreamMonitor<R> {
    pub fn new(stdout: R, activity: Arc<Activity>) -> Self {
        Self {
            reader: BufReader::new(stdout),
            outcome: StreamOutcome::default(),
            activity,
            tee_writer: None,
        }
    }

    /// Tee raw stdout lines to a file (transcript capture).
    /// Best-effort: if the file can't be opened, tee is silently skipped.
    pub fn with_tee(mut self, path: Option<PathBuf>) -> Self {
        if let Some(p) = path {
            if let Some(parent) = p.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Ok(file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&p)
            {
                self.tee_writer = Some(std::io::BufWriter::new(file));
            }
        }
        self
    }

    /// Read until EOF. The outcome stays available through [`Self::outcome`],
    /// also when the read is abandoned midway.
    pub async fn run(&mut self) -> std::io::Result<()> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = self.reader.read_until(b'\n', &mut buf).await?;
            if n == 0 {
                break;
            }
            self.activity.touch(n);

            if let Some(ref mut w) = self.tee_writer {
                use std::io::Write;
                let _ = w.write_all(&buf);
            }

            // Agents may print arbitrary bytes; those lines end up as raw text.
            let line = String::from_utf8_lossy(&buf);
            for event in parse_line(&line) {
                log_event(&event);
                self.outcome.apply(&event);
            }
        }
        if let Some(ref mut w) = self.tee_writer {
            use std::io::Write;
            let _ = w.flush();
        }
        Ok(())
    }

    pub fn outcome(&self) -> &StreamOutcome {
        &self.outcome
    }

    pub fn into_outcome(self) -> StreamOutcome {
        self.outcome
    }
}

fn log_event(event: &AgentEvent) {
    match event {
        AgentEvent::Init { session_id } => debug!(session_id = ?session_id, "agent session"),
        AgentEvent::ToolCall {
            phase: ToolPhase::Started,
            name,
        } => debug!(tool = %name, "agent tool call"),
        AgentEvent::Result {
            subtype, is_error, ..
        } => debug!(%subtype, is_error, "agent result"),
        AgentEvent::Error(msg) => debug!(error = %msg, "agent error event"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_init_carries_token() {
        let events = parse_line(r#"{"type":"system","subtype":"init","session_id":"abc-123","model":"m"}"#);
        assert_eq!(
            events,
            vec![AgentEvent::Init {
                session_id: Some("abc-123".into())
            }]
        );
    }

    #[test]
    fn assistant_blocks_are_normalised() {
        let events = parse_line(
            r#"{"type":"assistant","message":{"content":[
                {"type":"thinking","thinking":"hmm"},
                {"type":"text","text":"Fixing the test"},
                {"type":"tool_use","name":"Edit","input":{"file_path":"src/lib.rs"}}
            ]}}"#,
        );
        assert_eq!(
            events,
            vec![
                AgentEvent::Thinking("hmm".into()),
                AgentEvent::AssistantText("Fixing the test".into()),
                AgentEvent::ToolCall {
                    phase: ToolPhase::Started,
                    name: "Edit".into()
                },
            ]
        );
    }

    #[test]
    fn user_tool_result_completes_call() {
        let events = parse_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#,
        );
        assert!(matches!(
            events.as_slice(),
            [AgentEvent::ToolCall {
                phase: ToolPhase::Completed,
                ..
            }]
        ));
    }

    #[test]
    fn top_level_tool_call_and_thinking() {
        let events = parse_line(
            r#"{"type":"tool_call","subtype":"completed","call_id":"1","tool_call":{"shellToolCall":{"args":{}}}}"#,
        );
        assert_eq!(
            events,
            vec![AgentEvent::ToolCall {
                phase: ToolPhase::Completed,
                name: "shellToolCall".into()
            }]
        );
        let events = parse_line(r#"{"type":"thinking","subtype":"delta","text":"..."}"#);
        assert_eq!(events, vec![AgentEvent::Thinking("...".into())]);
    }

    #[test]
    fn error_event_message() {
        assert_eq!(
            parse_line(r#"{"type":"error","error":{"message":"rate limited"}}"#),
            vec![AgentEvent::Error("rate limited".into())]
        );
        assert_eq!(
            parse_line(r#"{"type":"error","message":"boom"}"#),
            vec![AgentEvent::Error("boom".into())]
        );
    }

    #[test]
    fn unknown_json_ignored_and_text_is_raw() {
        assert!(parse_line(r#"{"type":"future_new_type","data":1}"#).is_empty());
        assert!(parse_line("   ").is_empty());
        assert_eq!(
            parse_line("Warning: something odd\n"),
            vec![AgentEvent::Raw("Warning: something odd".into())]
        );
    }

    #[test]
    fn result_text_is_authoritative() {
        let mut out = StreamOutcome::default();
        for line in [
            r#"{"type":"system","subtype":"init","session_id":"s1"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}"#,
            "plain noise",
            r#"{"type":"result","subtype":"success","result":"Fixed and committed","session_id":"s1","is_error":false}"#,
        ] {
            for e in parse_line(line) {
                out.apply(&e);
            }
        }
        assert_eq!(out.session_id.as_deref(), Some("s1"));
        assert_eq!(out.accumulated, "partial\nplain noise");
        assert_eq!(out.output(), "Fixed and committed");
    }

    #[test]
    fn output_falls_back_to_accumulated() {
        let mut out = StreamOutcome::default();
        out.apply(&AgentEvent::AssistantText("did a thing".into()));
        out.apply(&AgentEvent::Result {
            subtype: "success".into(),
            text: None,
            session_id: None,
            is_error: false,
        });
        assert_eq!(out.output(), "did a thing");
    }

    #[tokio::test]
    async fn monitor_reads_tees_and_touches() {
        let dir = tempfile::tempdir().unwrap();
        let tee_path = dir.path().join("t").join("transcript.jsonl");
        let input: &[u8] = b"{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"x\"}\nline_two\n";
        let activity = Arc::new(Activity::new());

        let mut monitor =
            StreamMonitor::new(input, Arc::clone(&activity)).with_tee(Some(tee_path.clone()));
        monitor.run().await.unwrap();
        let outcome = monitor.into_outcome();

        assert_eq!(outcome.session_id.as_deref(), Some("x"));
        assert_eq!(outcome.accumulated, "line_two");
        assert_eq!(activity.bytes(), input.len() as u64);
        let content = std::fs::read_to_string(&tee_path).unwrap();
        assert!(content.contains("line_two"), "tee should capture raw lines: {content}");
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_raw_text() {
        let input: &[u8] = b"compiling \xff\xfe blob\n{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"fixed\",\"is_error\":false}\n";
        let mut monitor = StreamMonitor::new(input, Arc::new(Activity::new()));
        monitor.run().await.unwrap();
        let outcome = monitor.into_outcome();

        assert!(outcome.accumulated.starts_with("compiling "));
        assert!(outcome.accumulated.contains('\u{FFFD}'));
        assert_eq!(outcome.output(), "fixed");
    }
}
