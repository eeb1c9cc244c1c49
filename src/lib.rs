//! # GhostWire (library root)
//!
//! Per-session conversational memory and retrieval-augmented generation service.
//!
//! - Durable turn storage and session bookkeeping (`store`, `models`, `schema`).
//! - Approximate nearest-neighbor recall over session embeddings (`ann`).
//! - Exact and near-duplicate response caching (`cache`).
//! - Upstream embedding and generation gateways (`embedder`, `generator`).
//! - The RAG control plane tying the above together into a single turn (`rag`).
//! - The HTTP surface: GhostWire-native, OpenAI-, Ollama- and Qdrant-compatible
//!   routes over that control plane (`http`).
//! - Runtime configuration (`config`) and the shared error hierarchy (`error`).

pub mod ann;
pub mod cache;
pub mod config;
pub mod embedder;
pub mod error;
pub mod generator;
pub mod http;
pub mod models;
pub mod rag;
pub mod schema;
pub mod store;
