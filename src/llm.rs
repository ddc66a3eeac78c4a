//! Language-model boundary.
//!
//! The agent talks to a model only through [`LanguageModel::chat`]: a list
//! of messages, optionally a set of callable tools, optionally a JSON schema
//! the reply must follow. [`LanguageModel::chat_stream`] is the same call
//! with answer text delivered piecewise as it is generated.
//! [`OpenAiChatModel`] implements both against any OpenAI-compatible
//! `/chat/completions` endpoint, streaming over server-sent events.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::http::{send_for_response, send_with_retry};
use crate::models::{Message, Role, ToolCall};

/// A function the model may call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Constrain the reply to a JSON document matching `schema`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// [`LanguageModel::chat`], sending content to `tokens` as it arrives.
    /// The returned response still carries the full content. Models that
    /// cannot stream send the whole reply as one piece.
    async fn chat_stream(
        &self,
        request: ChatRequest,
        tokens: &mpsc::UnboundedSender<String>,
    ) -> Result<ChatResponse> {
        let response = self.chat(request).await?;
        if !response.content.is_empty() {
            let _ = tokens.send(response.content.clone());
        }
        Ok(response)
    }
}

/// OpenAI-compatible chat completions client. Reads `OPENAI_API_KEY`.
pub struct OpenAiChatModel {
    model: String,
    base_url: String,
    api_key: String,
    temperature: f64,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client,
        })
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": request.messages.iter().map(message_to_wire).collect::<Vec<_>>(),
        });
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        if let Some(format) = &request.response_format {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": format.name,
                    "schema": format.schema,
                    "strict": true,
                }
            });
        }
        body
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = self.request_body(&request);
        let http_request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        let json = send_with_retry(http_request, self.max_retries, "Chat").await?;
        parse_chat_response(&json)
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        tokens: &mpsc::UnboundedSender<String>,
    ) -> Result<ChatResponse> {
        let mut body = self.request_body(&request);
        body["stream"] = json!(true);
        let http_request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        let mut response = send_for_response(http_request, self.max_retries, "Chat").await?;

        let mut stream = StreamAccumulator::default();
        while let Some(bytes) = response.chunk().await? {
            for piece in stream.push(&bytes)? {
                let _ = tokens.send(piece);
            }
            if stream.done {
                break;
            }
        }
        stream.finish()
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Reassembles a `stream: true` completion from its `data:` lines.
/// Tool-call fragments are merged by their `index`.
#[derive(Debug, Default)]
struct StreamAccumulator {
    pending: Vec<u8>,
    content: String,
    calls: BTreeMap<u64, PartialToolCall>,
    done: bool,
}

impl StreamAccumulator {
    /// Feed raw body bytes. Returns the content deltas of every event the
    /// bytes completed; a partial trailing line waits for the next push.
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        self.pending.extend_from_slice(bytes);
        let mut pieces = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                break;
            }
            let event: Value = serde_json::from_str(data)
                .with_context(|| format!("Invalid chat stream event: {}", data))?;
            if let Some(error) = event.get("error") {
                bail!("Chat stream error: {}", error);
            }
            if let Some(piece) = self.apply(&event) {
                pieces.push(piece);
            }
        }
        Ok(pieces)
    }

    fn apply(&mut self, event: &Value) -> Option<String> {
        let delta = event.get("choices")?.get(0)?.get("delta")?;
        if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
            for call in calls {
                let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let entry = self.calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                    entry.id = Some(id.to_string());
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                        entry.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                        entry.arguments.push_str(args);
                    }
                }
            }
        }
        let text = delta
            .get("content")
            .and_then(|c| c.as_str())
            .filter(|t| !t.is_empty())?;
        self.content.push_str(text);
        Some(text.to_string())
    }

    fn finish(self) -> Result<ChatResponse> {
        if !self.done && self.content.is_empty() && self.calls.is_empty() {
            bail!("Chat stream ended before any data");
        }
        let mut tool_calls = Vec::with_capacity(self.calls.len());
        for (index, call) in self.calls {
            if call.name.is_empty() {
                bail!("Invalid chat stream: tool call {} without name", index);
            }
            tool_calls.push(ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{}", index)),
                name: call.name,
                arguments: parse_arguments(&call.arguments),
            });
        }
        Ok(ChatResponse {
            content: self.content,
            tool_calls,
        })
    }
}

/// Tool arguments arrive as a JSON string; one that fails to parse is kept
/// as a plain string so the tool layer can report it.
fn parse_arguments(raw: &str) -> Value {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn message_to_wire(message: &Message) -> Value {
    match message.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
        Role::Assistant if !message.tool_calls.is_empty() => json!({
            "role": "assistant",
            "content": message.content,
            "tool_calls": message.tool_calls.iter().map(|c| json!({
                "id": c.id,
                "type": "function",
                "function": {
                    "name": c.name,
                    "arguments": c.arguments.to_string(),
                }
            })).collect::<Vec<_>>(),
        }),
        role => json!({
            "role": role,
            "content": message.content,
        }),
    }
}

/// Pull content and tool calls out of `choices[0].message`.
fn parse_chat_response(json: &Value) -> Result<ChatResponse> {
    let message = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message"))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for (i, call) in calls.iter().enumerate() {
            let function = call
                .get("function")
                .ok_or_else(|| anyhow::anyhow!("Invalid chat response: tool call without function"))?;
            let name = function
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| anyhow::anyhow!("Invalid chat response: tool call without name"))?
                .to_string();
            let raw_args = function
                .get("arguments")
                .and_then(|a| a.as_str())
                .unwrap_or("{}");
            let arguments = parse_arguments(raw_args);
            let id = call
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", i));
            tool_calls.push(ToolCall {
                id,
                name,
                arguments,
            });
        }
    }

    Ok(ChatResponse {
        content,
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> OpenAiChatModel {
        OpenAiChatModel {
            model: "gpt-4o".into(),
            base_url: "http://localhost".into(),
            api_key: "test".into(),
            temperature: 0.0,
            max_retries: 0,
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn test_parse_plain_answer() {
        let json = json!({"choices": [{"message": {"role": "assistant", "content": "Hello"}}]});
        assert_eq!(parse_chat_response(&json).unwrap(), ChatResponse::text("Hello"));
    }

    #[test]
    fn test_parse_tool_calls() {
        let json = json!({"choices": [{"message": {
            "role": "assistant",
            "content": null,
            "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "retrieve_docs", "arguments": "{\"query\":\"hq\"}"}},
                {"type": "function", "function": {"name": "python_interpreter", "arguments": "not json"}}
            ]
        }}]});
        let resp = parse_chat_response(&json).unwrap();
        assert_eq!(resp.content, "");
        assert_eq!(resp.tool_calls.len(), 2);
        assert_eq!(resp.tool_calls[0].id, "c1");
        assert_eq!(resp.tool_calls[0].arguments, json!({"query": "hq"}));
        assert_eq!(resp.tool_calls[1].id, "call_1");
        assert_eq!(resp.tool_calls[1].arguments, json!("not json"));
    }

    #[test]
    fn test_parse_rejects_missing_choices() {
        assert!(parse_chat_response(&json!({"error": "x"})).is_err());
    }

    #[test]
    fn test_request_body_shapes() {
        let request = ChatRequest::new(vec![
            Message::system("sys"),
            Message::user("hi"),
            Message::assistant(
                "",
                vec![ToolCall {
                    id: "c1".into(),
                    name: "read_memory_tool".into(),
                    arguments: json!({"target": "USER"}),
                }],
            ),
            Message::tool("c1", "memory text"),
        ])
        .with_tools(vec![ToolSpec {
            name: "read_memory_tool".into(),
            description: "Read memory".into(),
            parameters: json!({"type": "object"}),
        }])
        .with_response_format(ResponseFormat {
            name: "memory_decision".into(),
            schema: json!({"type": "object"}),
        });

        let body = model().request_body(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            "{\"target\":\"USER\"}"
        );
        assert_eq!(messages[3]["tool_call_id"], "c1");
        assert_eq!(body["tools"][0]["function"]["name"], "read_memory_tool");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
    }

    fn feed(stream: &mut StreamAccumulator, events: &[Value]) -> Vec<String> {
        let body: String = events
            .iter()
            .map(|e| format!("data: {}\n\n", e))
            .collect();
        let mut pieces = Vec::new();
        // Split mid-line to exercise buffering across chunks.
        let (head, tail) = body.as_bytes().split_at(body.len() / 2);
        pieces.extend(stream.push(head).unwrap());
        pieces.extend(stream.push(tail).unwrap());
        pieces
    }

    #[test]
    fn test_stream_content_arrives_piecewise() {
        let mut stream = StreamAccumulator::default();
        let pieces = feed(
            &mut stream,
            &[
                json!({"choices": [{"delta": {"role": "assistant", "content": ""}}]}),
                json!({"choices": [{"delta": {"content": "Austin, "}}]}),
                json!({"choices": [{"delta": {"content": "Texas."}}]}),
                json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
            ],
        );
        assert_eq!(pieces, vec!["Austin, ", "Texas."]);
        assert!(stream.push(b"data: [DONE]\n\n").unwrap().is_empty());
        assert!(stream.done);
        assert_eq!(stream.finish().unwrap(), ChatResponse::text("Austin, Texas."));
    }

    #[test]
    fn test_stream_merges_tool_call_fragments() {
        let mut stream = StreamAccumulator::default();
        let pieces = feed(
            &mut stream,
            &[
                json!({"choices": [{"delta": {"tool_calls": [
                    {"index": 0, "id": "c1", "type": "function", "function": {"name": "retrieve_docs", "arguments": ""}}
                ]}}]}),
                json!({"choices": [{"delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "{\"query\":"}}
                ]}}]}),
                json!({"choices": [{"delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "\"hq\"}"}},
                    {"index": 1, "function": {"name": "read_memory_tool"}}
                ]}}]}),
            ],
        );
        assert!(pieces.is_empty());
        let response = stream.finish().unwrap();
        assert_eq!(response.content, "");
        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[0].id, "c1");
        assert_eq!(response.tool_calls[0].arguments, json!({"query": "hq"}));
        assert_eq!(response.tool_calls[1].id, "call_1");
        assert_eq!(response.tool_calls[1].arguments, json!({}));
    }

    #[test]
    fn test_stream_error_event_and_empty_body() {
        let mut stream = StreamAccumulator::default();
        let err = stream
            .push(b"data: {\"error\": {\"message\": \"overloaded\"}}\n")
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));

        let mut empty = StreamAccumulator::default();
        assert!(empty.push(b": keep-alive\n\n").unwrap().is_empty());
        assert!(empty.finish().is_err());
    }

    #[tokio::test]
    async fn test_default_stream_sends_whole_reply() {
        struct Fixed;
        #[async_trait]
        impl LanguageModel for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }
            async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
                Ok(ChatResponse::text("whole reply"))
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let response = Fixed
            .chat_stream(ChatRequest::new(vec![Message::user("hi")]), &tx)
            .await
            .unwrap();
        assert_eq!(response.content, "whole reply");
        assert_eq!(rx.try_recv().unwrap(), "whole reply");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_request_body_omits_empty_tools() {
        let body = model().request_body(&ChatRequest::new(vec![Message::user("hi")]));
        assert!(body.get("tools").is_none());
        assert!(body.get("response_format").is_none());
    }
}
