//! # Corpus Agent
//!
//! Question answering over a local document corpus, with durable memory and
//! sandboxed code execution.
//!
//! Documents are split into overlapping chunks and indexed twice: a dense
//! embedding index and a BM25 lexical index. Queries are answered by fusing
//! both candidate lists with Reciprocal Rank Fusion and reranking the result.
//! On top of retrieval sits a tool-calling agent that routes durable facts to
//! append-only memory logs before it reasons.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────────┐
//! │  Loaders   │──▶│  Splitter   │──▶│ Dense  │ Lexical │
//! │ txt/pdf/.. │   │ size+overlap│   │ index  │  BM25   │
//! └────────────┘   └─────────────┘   └───┬────┴────┬────┘
//!                                        └── RRF ──┘
//!                                             │ rerank
//!                                             ▼
//!   user ─▶ MEMORY_ROUTE ─▶ REASON ⇄ TOOL_DISPATCH ─▶ answer
//!              │                        │
//!              ▼                        ▼
//!        USER/COMPANY logs     safety gate ─▶ Lua sandbox
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! corpus ingest ./docs
//! corpus search "headquarters location" --k-final 1
//! corpus ask "Where is the headquarters?"
//! corpus chat
//! corpus memory show
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`extract`] | Text extraction from PDF and Word files |
//! | [`chunk`] | Recursive text splitting |
//! | [`ingest`] | Parallel file chunking and indexing |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Dense and lexical indices on disk |
//! | [`rerank`] | Pairwise relevance scorers |
//! | [`retrieval`] | Hybrid retrieval with RRF |
//! | [`memory`] | Durable fact logs |
//! | [`safety`] | Denylist code filter |
//! | [`sandbox`] | Embedded Lua interpreter |
//! | [`llm`] | Chat model boundary |
//! | [`tools`] | Agent tools and registry |
//! | [`agent`] | Conversation state machine |

pub mod agent;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
mod http;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod models;
pub mod rerank;
pub mod retrieval;
pub mod safety;
pub mod sandbox;
pub mod tools;
