//! # Docgate
//!
//! A document upload and query gateway: users upload files (CSV, text,
//! PDF, DOCX), Docgate extracts, chunks, and embeds their content into a
//! SQLite store, and answers natural-language questions about the corpus
//! through an LLM provider — with a leaky-bucket admission controller in
//! front of every request and transactional resource cleanup behind it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌───────────┐   ┌──────────────┐   ┌──────────┐
//! │  HTTP   │──▶│ Admission │──▶│ Orchestrator │──▶│  SQLite   │
//! │ (axum)  │   │  (bucket) │   │ (txn + ctx)  │   │ FTS5+Vec │
//! └─────────┘   └───────────┘   └──────┬───────┘   └──────────┘
//!                                      │
//!                      ┌───────────────┼───────────────┐
//!                      ▼               ▼               ▼
//!                ┌──────────┐   ┌───────────┐   ┌──────────┐
//!                │ FileStore│   │ Processor │   │   LLM    │
//!                │ + CSV    │   │ chunk+embd│   │ provider │
//!                └──────────┘   └───────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docgate init                  # create database
//! docgate serve                 # start the HTTP server
//! curl -F file=@sales.csv http://localhost:8001/upload
//! curl -d '{"query": "what drove Q3 revenue?"}' http://localhost:8001/query
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`admission`] | Leaky-bucket rate admission with bounded queuing |
//! | [`transaction`] | Scoped resource transactions with guaranteed cleanup |
//! | [`context`] | Per-request timing context registry |
//! | [`orchestrator`] | Upload and query workflow composition |
//! | [`storage`] | SQLite documents/chunks/tags store and search |
//! | [`upload`] | File store collaborator |
//! | [`processor`] | Extract → chunk → embed pipeline |
//! | [`csv_parser`] | CSV summary statistics |
//! | [`extract`] | PDF/DOCX/text extraction |
//! | [`embedding`] | Embedding provider client |
//! | [`llm`] | LLM provider client |
//! | [`server`] | HTTP server and error boundary |
//! | [`config`] | TOML configuration parsing |

pub mod admission;
pub mod chunk;
pub mod config;
pub mod context;
pub mod csv_parser;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod processor;
pub mod schemas;
pub mod server;
pub mod stats;
pub mod storage;
pub mod transaction;
pub mod upload;
