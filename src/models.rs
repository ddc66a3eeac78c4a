//! Core data models shared by the retrieval engine and the agent.
//!
//! Chunks flow from the loader into both indices; ranked candidates and
//! memory decisions are ephemeral per query; messages make up a
//! conversation's history.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A bounded span of source-document text with provenance.
///
/// Identity for ranking purposes is the exact text: two chunks with equal
/// text are the same document to fusion and dedup, whatever their source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    /// Basename of the origin file.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<usize>,
}

impl Chunk {
    pub fn new(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            page: None,
            start_offset: None,
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    /// Content address: hex SHA-256 of the text.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// `[Source: file, Page: n]`, or `[Source: file]` when the loader had no pages.
    pub fn citation(&self) -> String {
        match self.page {
            Some(page) => format!("[Source: {}, Page: {}]", self.source, page),
            None => format!("[Source: {}]", self.source),
        }
    }
}

/// A chunk with its fused score for one query. Never persisted.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub chunk: Chunk,
    pub fusion_score: f64,
}

/// One of the two durable fact logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryTarget {
    #[serde(rename = "USER")]
    User,
    #[serde(rename = "COMPANY")]
    Company,
}

impl MemoryTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTarget::User => "USER",
            MemoryTarget::Company => "COMPANY",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            MemoryTarget::User => "USER_MEMORY.md",
            MemoryTarget::Company => "COMPANY_MEMORY.md",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Some(MemoryTarget::User),
            "COMPANY" => Some(MemoryTarget::Company),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured output of the memory router, one per inbound user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryDecision {
    pub should_write: bool,
    pub target: MemoryTarget,
    pub summary: String,
    pub confidence: f64,
}

/// Full text of both memory logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub user: String,
    pub company: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One entry of a conversation's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `Role::Tool` messages: the call this output answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}
