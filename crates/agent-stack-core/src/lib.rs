//! # Agent Stack Core
//!
//! Pure logic for Agent Stack: the index bootstrap gate, the resource
//! dependency graph, vector index mappings, the search backend trait, and
//! LLM output helpers.
//!
//! This crate contains no tokio runtime, HTTP client, or filesystem I/O.
//! Network backends and front ends live in the `agent-stack` app crate.

pub mod backend;
pub mod error;
pub mod gate;
pub mod graph;
pub mod mapping;
pub mod models;
pub mod text;
