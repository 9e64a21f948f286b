use marshal_core::agent::AgentChunk;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single NDJSON message emitted by the agent CLI
/// (`--output-format stream-json`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First message on stream: session initialisation.
    System(SystemEvent),

    /// An assistant turn (text or tool calls).
    Assistant(AssistantEvent),

    /// A user turn (tool results injected back into the conversation).
    User(UserEvent),

    /// Final result message — emitted once at the very end.
    Result(ResultEvent),

    /// Any message type not explicitly handled above.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantEvent {
    pub message: Option<AssistantMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
}

/// A single content block inside an assistant or user message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text output.
    Text { text: String },

    /// A tool invocation by the agent.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    /// Result returned by a tool (appears in user turn).
    ToolResult {
        tool_use_id: String,
        content: Option<Value>,
        is_error: Option<bool>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEvent {
    pub message: Option<Value>,
}

/// Final result event, emitted once when the agent finishes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    /// Textual output (may be empty if the last turn was a tool call).
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub is_error: Option<bool>,
}

/// Turn one NDJSON line into a progress chunk for the session log.
/// Lines that carry nothing worth persisting (tool results, malformed
/// JSON, unknown event types) map to `None`.
pub fn chunk_from_line(line: &str) -> Option<AgentChunk> {
    if line.is_empty() {
        return None;
    }
    let event: AgentEvent = serde_json::from_str(line).ok()?;
    match event {
        AgentEvent::System(e) => {
            let session = e.session_id.unwrap_or_default();
            let subtype = e.subtype.unwrap_or_default();
            Some(AgentChunk::System {
                content: format!("agent session {session} {subtype}").trim().to_string(),
            })
        }
        AgentEvent::Assistant(e) => {
            let mut text = String::new();
            for block in e.message?.content? {
                match block {
                    ContentBlock::Text { text: t } => {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(&t);
                    }
                    ContentBlock::ToolUse { name, .. } => {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(&format!("[tool: {name}]"));
                    }
                    _ => {}
                }
            }
            if text.is_empty() {
                None
            } else {
                Some(AgentChunk::Progress { content: text })
            }
        }
        AgentEvent::Result(e) => {
            // An error result is not a completion signal; the stream will
            // simply end without a terminal chunk.
            if e.is_error.unwrap_or(false) {
                return None;
            }
            Some(AgentChunk::Result {
                content: e.result.unwrap_or_default(),
            })
        }
        AgentEvent::User(_) | AgentEvent::Unknown => None,
    }
}
