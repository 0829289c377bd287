//! # Agent Stack
//!
//! A declarative Bedrock agent stack with an idempotent vector-index
//! bootstrap gate.
//!
//! The stack provisions a managed agent, an OpenSearch Serverless vector
//! collection and a knowledge base fed from S3. The knowledge base needs a
//! vector index to exist inside the collection before it can be created,
//! and nothing declarative creates one; the **index gate** is a custom
//! resource that creates it and sits in the dependency graph between the
//! collection and the knowledge base.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Collection  │──▶│  Index gate  │──▶│ Knowledge    │──▶ Agent
//! │  + policies  │   │ (custom res.)│   │ base         │
//! └──────────────┘   └──────┬───────┘   └──────────────┘
//!                           │ PUT /{index}
//!                           ▼
//!                    ┌──────────────┐
//!                    │  OpenSearch  │
//!                    │  (SigV4)     │
//!                    └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! agent-stack synth --out cdk.out/stack.json   # render the template
//! agent-stack plan                             # creation phases
//! agent-stack mapping                          # index body
//! agent-stack bootstrap --endpoint https://…   # create the index directly
//! agent-stack serve                            # HTTP provider for the engine
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`stack`] | Resource declarations and dependency edges |
//! | [`opensearch`] | SigV4-signed OpenSearch index backend |
//! | [`sigv4`] | AWS Signature Version 4 |
//! | [`handler`] | Event parsing, retry policy, bootstrap |
//! | [`input`] | File or stdin input |
//! | [`server`] | HTTP provider |
//! | [`llm`] | LLM provider descriptors and extraction |
//! | [`console`] | Console message formatting |
//! | [`logging`] | Tracing setup |
//!
//! The gate itself, the resource graph, the index mapping and the backend
//! trait live in the `agent-stack-core` crate.

pub mod config;
pub mod console;
pub mod handler;
pub mod input;
pub mod llm;
pub mod logging;
pub mod opensearch;
pub mod server;
pub mod sigv4;
pub mod stack;
