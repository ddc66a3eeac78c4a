//! Tools the reasoning step can call.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                     ToolRegistry                       │
//! │  retrieve_docs │ read_memory_tool │ python_interpreter │
//! │                │                  │ analyze_weather    │
//! └───────────┬────────────────────────────────────────────┘
//!             ▼
//!   dispatch(call) → validate_params → Tool::execute → text
//! ```
//!
//! Every outcome of a dispatch is text. Unknown tool names, arguments that
//! fail schema validation, and execution errors are all rendered as tool
//! output so the next reasoning pass can react to them; nothing here aborts
//! a turn.
//!
//! Code tools pass through [`crate::safety::is_safe`] before reaching the
//! [`Sandbox`]. A rejected script yields [`SECURITY_BLOCK_MSG`] without being
//! run.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::RagError;
use crate::llm::{ChatRequest, LanguageModel, ToolSpec};
use crate::memory::MemoryStore;
use crate::models::{Message, MemoryTarget, ToolCall};
use crate::retrieval::{format_results, HybridRetriever};
use crate::safety::{first_violation, SECURITY_BLOCK_MSG};
use crate::sandbox::Sandbox;

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A function exposed to the model.
///
/// `execute` receives arguments already checked against
/// [`parameters_schema`](Tool::parameters_schema), with defaults filled in.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier the model calls the tool by.
    fn name(&self) -> &str;

    /// One-line description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema object with `properties` and optionally `required`.
    fn parameters_schema(&self) -> Value;

    /// Whether a call may change the memory logs. The agent publishes a
    /// fresh memory snapshot after such calls.
    fn affects_memory(&self) -> bool {
        false
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String>;
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Collaborators available to tools during a call.
#[derive(Clone)]
pub struct ToolContext {
    pub retriever: Arc<HybridRetriever>,
    pub memory: Arc<MemoryStore>,
    pub sandbox: Sandbox,
    pub model: Arc<dyn LanguageModel>,
}

impl ToolContext {
    pub fn new(
        retriever: Arc<HybridRetriever>,
        memory: Arc<MemoryStore>,
        sandbox: Sandbox,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            retriever,
            memory,
            sandbox,
            model,
        }
    }

    /// Gate `code`, then run it. Rejections return the security sentinel.
    pub async fn run_code(&self, code: &str) -> String {
        if let Some(token) = first_violation(code) {
            tracing::warn!(token, error = %RagError::SecurityRejection, "refusing to execute");
            return SECURITY_BLOCK_MSG.to_string();
        }
        self.sandbox.execute(code).await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in Tools
// ═══════════════════════════════════════════════════════════════════════

pub struct RetrieveDocsTool;

#[async_trait]
impl Tool for RetrieveDocsTool {
    fn name(&self) -> &str {
        "retrieve_docs"
    }

    fn description(&self) -> &str {
        "Search the knowledge base for information. Use this tool when the user asks \
         questions about uploaded documents or specific knowledge."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let query = params["query"].as_str().unwrap_or("");
        if query.trim().is_empty() {
            bail!("query must not be empty");
        }
        let chunks = ctx.retriever.retrieve_default(query).await?;
        Ok(format_results(&chunks))
    }
}

pub struct ReadMemoryTool;

#[async_trait]
impl Tool for ReadMemoryTool {
    fn name(&self) -> &str {
        "read_memory_tool"
    }

    fn description(&self) -> &str {
        "Read the current state of memory to avoid duplicates or conflicts."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target": {
                    "type": "string",
                    "enum": ["USER", "COMPANY"],
                    "description": "USER for user preferences and facts, COMPANY for organizational knowledge"
                }
            },
            "required": ["target"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let target = params["target"]
            .as_str()
            .and_then(MemoryTarget::parse)
            .ok_or_else(|| anyhow::anyhow!("target must be USER or COMPANY"))?;
        ctx.memory.read(target)
    }
}

pub struct InterpreterTool;

#[async_trait]
impl Tool for InterpreterTool {
    fn name(&self) -> &str {
        "python_interpreter"
    }

    fn description(&self) -> &str {
        "A sandboxed Lua 5.4 interpreter. Use it for calculations, data analysis, and \
         fetching external data. print() output and returned values are captured. \
         Available libraries: http (get, post), json (parse, encode), stats (sum, mean, \
         variance, stddev, min, max, rolling_mean), frame (column, filter, sort_by), \
         date (today, days_ago, now), log."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "Lua source to run" }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let code = params["code"].as_str().unwrap_or("");
        Ok(ctx.run_code(code).await)
    }
}

const WEATHER_SYSTEM_PROMPT: &str =
    "You are an expert Lua developer. Write a script to analyze weather for {location}.";

const WEATHER_TASK_PROMPT: &str = r#"
step 1: Use `http.get` to call the Open-Meteo Geocoding API (https://geocoding-api.open-meteo.com/v1/search?name=<name>&count=1) to get latitude/longitude for {location}.
step 2: Use `http.get` to fetch daily temperature_2m_max for the past 30 days from `https://archive-api.open-meteo.com/v1/archive`, passing `latitude`, `longitude`, `daily = "temperature_2m_max"`, `start_date = date.days_ago(30)` and `end_date = date.today()` through the `params` option.
step 3: Read the values from `response.json.daily`.
step 4: Calculate the 7-day rolling average with `stats.rolling_mean` and the volatility with `stats.variance`.
step 5: Print the results clearly.

IMPORTANT:
- Output ONLY valid Lua code.
- Do not use markdown backticks.
- ALWAYS wrap the network calls in pcall to handle connection errors.
- If the API fails, print "Error: <details>" so the user knows.
"#;

/// Drop markdown code-fence markers the model adds despite instructions.
pub fn strip_code_fences(code: &str) -> String {
    code.replace("```lua", "")
        .replace("```python", "")
        .replace("```", "")
        .trim()
        .to_string()
}

/// Has the model write an analysis script, then runs it like
/// `python_interpreter` would.
pub struct AnalyzeWeatherTool;

impl AnalyzeWeatherTool {
    async fn analyze(&self, location: &str, ctx: &ToolContext) -> Result<String> {
        let request = ChatRequest::new(vec![
            Message::system(WEATHER_SYSTEM_PROMPT.replace("{location}", location)),
            Message::user(WEATHER_TASK_PROMPT.replace("{location}", location)),
        ]);
        let response = ctx.model.chat(request).await?;
        let code = strip_code_fences(&response.content);
        tracing::debug!(location, bytes = code.len(), "weather script generated");
        if first_violation(&code).is_some() {
            return Ok(SECURITY_BLOCK_MSG.to_string());
        }
        Ok(format!("Analysis Result:\n{}", ctx.sandbox.execute(&code).await))
    }
}

#[async_trait]
impl Tool for AnalyzeWeatherTool {
    fn name(&self) -> &str {
        "analyze_weather"
    }

    fn description(&self) -> &str {
        "Analyze the weather for a specific location using historical data from Open-Meteo, \
         with insights like rolling averages or volatility."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "The name of the city or location (e.g. \"Topeka, KS\" or \"Berlin\")"
                }
            },
            "required": ["location"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let location = params["location"].as_str().unwrap_or("");
        match self.analyze(location, ctx).await {
            Ok(text) => Ok(text),
            Err(e) => Ok(format!("Failed to analyze weather: {}", e)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Result of one dispatched call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub affects_memory: bool,
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry holding the four built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(RetrieveDocsTool));
        registry.register(Box::new(ReadMemoryTool));
        registry.register(Box::new(InterpreterTool));
        registry.register(Box::new(AnalyzeWeatherTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Function specs for the chat request.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Validate and run one call. Never fails: every problem becomes text.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let Some(tool) = self.find(&call.name) else {
            tracing::warn!(tool = %call.name, "model requested unknown tool");
            return ToolOutput {
                content: format!("Error: unknown tool '{}'", call.name),
                affects_memory: false,
            };
        };

        let content = match validate_params(&tool.parameters_schema(), &call.arguments) {
            Err(e) => format!("Error: invalid arguments for {}: {}", call.name, e),
            Ok(params) => match tool.execute(params, ctx).await {
                Ok(text) => text,
                Err(e) => {
                    let failure = RagError::ToolExecutionFailure {
                        tool: call.name.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(error = %failure, "tool call failed");
                    format!("Error: {}", failure)
                }
            },
        };

        ToolOutput {
            content,
            affects_memory: tool.affects_memory(),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Parameter Validation
// ═══════════════════════════════════════════════════════════════════════

/// Check `params` against a JSON Schema `properties`/`required` object.
///
/// Handles required fields, primitive `type`, and `enum`; absent optional
/// properties receive their `default`. Arguments that are not a JSON object
/// are treated as an empty object.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let params_obj = params.as_object().cloned().unwrap_or_default();

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    for field in &required {
        if !params_obj.contains_key(*field) {
            bail!("missing required parameter: {}", field);
        }
    }

    let mut result = params_obj.clone();
    for (prop_name, prop_schema) in &properties {
        let Some(value) = params_obj.get(prop_name) else {
            if let Some(default) = prop_schema.get("default") {
                result.insert(prop_name.clone(), default.clone());
            }
            continue;
        };

        if let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) {
            let type_ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !type_ok {
                bail!(
                    "parameter '{}' must be of type '{}', got {}",
                    prop_name,
                    expected,
                    json_type_name(value)
                );
            }
        }

        if let Some(allowed) = prop_schema.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                let names: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                bail!(
                    "parameter '{}' must be one of [{}], got {}",
                    prop_name,
                    names.join(", "),
                    value
                );
            }
        }
    }

    Ok(Value::Object(result))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
