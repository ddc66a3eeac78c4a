//! Conversation turns.
//!
//! A turn walks a fixed state machine:
//!
//! ```text
//! MEMORY_ROUTE ──▶ REASON ──▶ DONE
//!                   ▲  │
//!                   │  ▼
//!              TOOL_DISPATCH
//! ```
//!
//! - **MEMORY_ROUTE** asks the model, with only the latest user message,
//!   whether it states a durable fact. A confident decision is written to
//!   the memory log before reasoning starts.
//! - **REASON** sends the system directive plus the thread history and the
//!   tool specs. Tool calls move to TOOL_DISPATCH; a plain answer ends the
//!   turn.
//! - **TOOL_DISPATCH** runs each call through the [`ToolRegistry`] and
//!   appends the outputs to history.
//!
//! REASON runs at most `agent.max_iterations` times per turn. Model failures
//! and the iteration cap abort the turn; the thread's history is then rolled
//! back to where it was before the turn started.
//!
//! Progress is reported as [`TurnEvent`]s over an unbounded mpsc channel.
//! A closed receiver is ignored.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::Instrument;

use crate::config::Config;
use crate::error::RagError;
use crate::llm::{ChatRequest, ChatResponse, LanguageModel, OpenAiChatModel, ResponseFormat};
use crate::memory::MemoryStore;
use crate::models::{MemoryDecision, MemorySnapshot, Message, ToolCall};
use crate::retrieval::HybridRetriever;
use crate::sandbox::Sandbox;
use crate::tools::{ToolContext, ToolRegistry};

pub const SYSTEM_DIRECTIVE: &str = "You are an expert AI assistant. \
Use the available tools to answer questions. \
Strict Citations: [Source: <filename>, Page: <page>] when using retrieved docs. \
Always execute code via the provided tools (e.g. analyze_weather) rather than displaying code blocks to the user. \
CRITICAL: Answer ONLY using information from the retrieved documents or tools. \
If the answer is not in the documents/tools, state 'I cannot answer this based on the available information.' \
Do NOT use your pre-existing knowledge for factual queries. \
EXCEPTION: You MAY use the python_interpreter tool for general math, logic, or data analysis tasks.";

pub const MEMORY_ROUTER_PROMPT: &str = "You are a Memory Router. Analyze the user's message for durable facts. \
Ignore ephemeral queries (e.g. 'what is the weather'). \
Focus on facts like 'My name is X', 'The company was founded in Y'. \
If a fact is found, output should_write=true.";

/// Tool output longer than this is cut in [`TurnEvent::ToolLog`].
pub const TOOL_LOG_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Status(String),
    Memory(MemorySnapshot),
    Token(String),
    ToolLog { tool: String, output: String },
    EndTurn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    MemoryRoute,
    Reason,
    ToolDispatch,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    pub message_history: Vec<Message>,
    /// The router's log line for the latest turn, or empty.
    pub memory_context: String,
}

/// Per-thread conversation state.
///
/// Each thread has its own async mutex. A turn holds it from start to
/// finish, so turns on one thread run one at a time while other threads
/// proceed independently.
#[derive(Default)]
pub struct ConversationStore {
    threads: std::sync::Mutex<HashMap<String, Arc<Mutex<ConversationState>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The thread's state cell, created empty on first use.
    pub fn thread(&self, thread_id: &str) -> Arc<Mutex<ConversationState>> {
        let mut threads = self
            .threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(threads.entry(thread_id.to_string()).or_default())
    }

    /// Copy of a thread's state, if the thread exists.
    pub async fn snapshot(&self, thread_id: &str) -> Option<ConversationState> {
        let cell = {
            let threads = self
                .threads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            threads.get(thread_id).cloned()
        }?;
        let state = cell.lock().await;
        Some(state.clone())
    }

    pub fn len(&self) -> usize {
        self.threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// JSON schema the router's reply must satisfy.
pub fn memory_decision_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "should_write": {
                "type": "boolean",
                "description": "Whether a durable fact should be written to memory."
            },
            "target": {
                "type": "string",
                "enum": ["USER", "COMPANY"],
                "description": "USER for preferences and personal facts, COMPANY for organizational facts."
            },
            "summary": {
                "type": "string",
                "description": "A concise summary of the fact."
            },
            "confidence": {
                "type": "number",
                "description": "Confidence score between 0.0 and 1.0."
            }
        },
        "required": ["should_write", "target", "summary", "confidence"],
        "additionalProperties": false
    })
}

/// Parse and check the router's structured reply.
pub fn parse_memory_decision(content: &str) -> Result<MemoryDecision, RagError> {
    let decision: MemoryDecision = serde_json::from_str(content.trim())
        .map_err(|e| RagError::InvalidDecision(format!("{}: {}", e, content)))?;
    if !(0.0..=1.0).contains(&decision.confidence) {
        return Err(RagError::InvalidDecision(format!(
            "confidence {} outside [0, 1]",
            decision.confidence
        )));
    }
    Ok(decision)
}

fn truncate_for_log(output: &str) -> String {
    match output.char_indices().nth(TOOL_LOG_LIMIT) {
        Some((cut, _)) => format!("{}...", &output[..cut]),
        None => output.to_string(),
    }
}

fn emit(events: &mpsc::UnboundedSender<TurnEvent>, event: TurnEvent) {
    // A closed receiver only means nobody is listening.
    let _ = events.send(event);
}

pub struct Agent {
    ctx: ToolContext,
    tools: ToolRegistry,
    conversations: ConversationStore,
    max_iterations: usize,
    router_threshold: f64,
}

impl Agent {
    pub fn new(ctx: ToolContext, tools: ToolRegistry, max_iterations: usize, router_threshold: f64) -> Self {
        Self {
            ctx,
            tools,
            conversations: ConversationStore::new(),
            max_iterations,
            router_threshold,
        }
    }

    /// Wire up every collaborator from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let model: Arc<dyn LanguageModel> = match config.llm.provider.as_str() {
            "openai" => Arc::new(OpenAiChatModel::new(&config.llm)?),
            other => anyhow::bail!("Unknown llm provider: {}", other),
        };
        let ctx = ToolContext::new(
            Arc::new(HybridRetriever::from_config(config)?),
            Arc::new(MemoryStore::from_config(&config.memory)),
            Sandbox::from_config(&config.sandbox),
            model,
        );
        Ok(Self::new(
            ctx,
            ToolRegistry::with_builtins(),
            config.agent.max_iterations,
            config.memory.confidence_threshold,
        ))
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    /// Run one turn and return only the answer.
    pub async fn ask(&self, thread_id: &str, user_message: &str) -> Result<String, RagError> {
        let (tx, _rx) = mpsc::unbounded_channel();
        self.run_turn(thread_id, user_message, &tx).await
    }

    /// Run one turn for `thread_id`, reporting progress on `events`.
    ///
    /// `EndTurn` is always the last event, whether the turn succeeds or not.
    pub async fn run_turn(
        &self,
        thread_id: &str,
        user_message: &str,
        events: &mpsc::UnboundedSender<TurnEvent>,
    ) -> Result<String, RagError> {
        self.turn(thread_id, user_message, events)
            .instrument(tracing::info_span!("turn", thread = thread_id))
            .await
    }

    async fn turn(
        &self,
        thread_id: &str,
        user_message: &str,
        events: &mpsc::UnboundedSender<TurnEvent>,
    ) -> Result<String, RagError> {
        let cell = self.conversations.thread(thread_id);
        let mut state = cell.lock().await;
        let checkpoint = state.message_history.len();

        self.publish_memory(events);
        emit(events, TurnEvent::Status("Processing request".to_string()));

        state.message_history.push(Message::user(user_message));
        let result = self.drive(&mut state, user_message, events).await;

        match result {
            Ok(answer) => {
                self.publish_memory(events);
                emit(events, TurnEvent::Status("Ready".to_string()));
                emit(events, TurnEvent::EndTurn);
                Ok(answer)
            }
            Err(e) => {
                tracing::error!(error = %e, "turn aborted");
                state.message_history.truncate(checkpoint);
                emit(events, TurnEvent::EndTurn);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        state: &mut ConversationState,
        user_message: &str,
        events: &mpsc::UnboundedSender<TurnEvent>,
    ) -> Result<String, RagError> {
        let mut phase = AgentState::MemoryRoute;
        let mut iterations = 0;
        let mut pending: Vec<ToolCall> = Vec::new();
        let mut answer = String::new();

        loop {
            tracing::debug!(?phase, iterations, "agent step");
            match phase {
                AgentState::MemoryRoute => {
                    state.memory_context = self.route_memory(user_message).await?;
                    phase = AgentState::Reason;
                }
                AgentState::Reason => {
                    if iterations >= self.max_iterations {
                        return Err(RagError::IterationLimit {
                            limit: self.max_iterations,
                        });
                    }
                    iterations += 1;

                    let mut messages = Vec::with_capacity(state.message_history.len() + 1);
                    messages.push(Message::system(SYSTEM_DIRECTIVE));
                    messages.extend(state.message_history.iter().cloned());
                    let request = ChatRequest::new(messages).with_tools(self.tools.specs());

                    let response = self
                        .reason(request, events)
                        .await
                        .map_err(|e| RagError::InferenceFailure(format!("{:#}", e)))?;

                    state.message_history.push(Message::assistant(
                        response.content.clone(),
                        response.tool_calls.clone(),
                    ));
                    if response.tool_calls.is_empty() {
                        answer = response.content;
                        phase = AgentState::Done;
                    } else {
                        pending = response.tool_calls;
                        phase = AgentState::ToolDispatch;
                    }
                }
                AgentState::ToolDispatch => {
                    for call in pending.drain(..) {
                        emit(events, TurnEvent::Status(format!("Executing {}", call.name)));
                        let output = self.tools.dispatch(&call, &self.ctx).await;
                        emit(
                            events,
                            TurnEvent::ToolLog {
                                tool: call.name.clone(),
                                output: truncate_for_log(&output.content),
                            },
                        );
                        if output.affects_memory {
                            self.publish_memory(events);
                        }
                        state
                            .message_history
                            .push(Message::tool(call.id, output.content));
                    }
                    phase = AgentState::Reason;
                }
                AgentState::Done => return Ok(answer),
            }
        }
    }

    /// One streamed model call. Content pieces are forwarded as
    /// [`TurnEvent::Token`] while the call is still running.
    async fn reason(
        &self,
        request: ChatRequest,
        events: &mpsc::UnboundedSender<TurnEvent>,
    ) -> Result<ChatResponse> {
        let (token_tx, mut token_rx) = mpsc::unbounded_channel();
        let call = async move { self.ctx.model.chat_stream(request, &token_tx).await };
        let forward = async {
            while let Some(piece) = token_rx.recv().await {
                emit(events, TurnEvent::Token(piece));
            }
        };
        let (response, ()) = tokio::join!(call, forward);
        response
    }

    /// Decide whether `user_message` holds a durable fact and write it.
    ///
    /// Returns the `[Memory Router] …` log line, or empty when nothing was
    /// attempted. A failing write is logged and reported in the line; only
    /// the inference call and an invalid decision abort the turn.
    pub async fn route_memory(&self, user_message: &str) -> Result<String, RagError> {
        let request = ChatRequest::new(vec![
            Message::system(MEMORY_ROUTER_PROMPT),
            Message::user(user_message),
        ])
        .with_response_format(ResponseFormat {
            name: "memory_decision".to_string(),
            schema: memory_decision_schema(),
        });

        let response = self
            .ctx
            .model
            .chat(request)
            .await
            .map_err(|e| RagError::InferenceFailure(format!("{:#}", e)))?;
        let decision = parse_memory_decision(&response.content)?;
        tracing::debug!(?decision, "memory decision");

        if !(decision.should_write && decision.confidence > self.router_threshold) {
            return Ok(String::new());
        }

        let line = match self.ctx.memory.append_if_new(
            decision.target,
            &decision.summary,
            decision.confidence,
        ) {
            Ok(outcome) => format!("[Memory Router] {}", outcome),
            Err(e) => {
                tracing::warn!(error = %e, "memory write failed");
                format!("[Memory Router] Error: {}", e)
            }
        };
        tracing::info!("{}", line);
        Ok(line)
    }

    fn publish_memory(&self, events: &mpsc::UnboundedSender<TurnEvent>) {
        match self.ctx.memory.snapshot() {
            Ok(snapshot) => emit(events, TurnEvent::Memory(snapshot)),
            Err(e) => tracing::warn!(error = %e, "memory snapshot unavailable"),
        }
    }
}

/// Print one event. `mid_line` tracks whether streamed answer text left
/// the cursor mid-line.
fn print_event(event: &TurnEvent, mid_line: &mut bool) {
    if *mid_line && !matches!(event, TurnEvent::Token(_) | TurnEvent::Memory(_)) {
        println!();
        *mid_line = false;
    }
    match event {
        TurnEvent::Status(message) => println!("[status] {}", message),
        TurnEvent::Memory(snapshot) => tracing::debug!(
            user_bytes = snapshot.user.len(),
            company_bytes = snapshot.company.len(),
            "memory snapshot"
        ),
        TurnEvent::Token(text) => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
            *mid_line = true;
        }
        TurnEvent::ToolLog { tool, output } => println!("[{}] Output:\n{}", tool, output),
        TurnEvent::EndTurn => {}
    }
}

/// Run one turn, printing events as they arrive.
async fn stream_turn(agent: &Agent, thread_id: &str, message: &str) -> Result<(), RagError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = async {
        let mut mid_line = false;
        while let Some(event) = rx.recv().await {
            print_event(&event, &mut mid_line);
            if event == TurnEvent::EndTurn {
                break;
            }
        }
    };
    let (result, ()) = tokio::join!(agent.run_turn(thread_id, message, &tx), printer);
    result.map(|_| ())
}

/// CLI entry point for `corpus ask`.
pub async fn run_ask(config: &Config, message: &str, thread: Option<String>) -> Result<()> {
    let agent = Agent::from_config(config)?;
    let thread_id = thread.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    stream_turn(&agent, &thread_id, message).await?;
    Ok(())
}

/// CLI entry point for `corpus chat`: one turn per stdin line until EOF or `exit`.
pub async fn run_chat(config: &Config, thread: Option<String>) -> Result<()> {
    use tokio::io::AsyncBufReadExt;

    let agent = Agent::from_config(config)?;
    let thread_id = thread.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    println!("thread: {}", thread_id);

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "exit" || message == "quit" {
            break;
        }
        if let Err(e) = stream_turn(&agent, &thread_id, message).await {
            println!("[error] {}", e);
        }
    }
    Ok(())
}
