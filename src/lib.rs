//! # askdata
//!
//! Ask questions of a document collection in plain English.
//!
//! askdata sends the question and the collection schema to a chat
//! completion model, extracts the query expression it writes, validates it
//! against a closed, read-only grammar, runs it against the collection, and
//! asks the model again to summarize the rows.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────┐
//! │ HTTP/CLI │──▶│  Pipeline  │──▶│ Sanitize +  │──▶│  SQLite  │
//! │ + gate   │   │ prompt/LLM │   │ query plan  │   │  store   │
//! └──────────┘   └─────┬──────┘   └─────────────┘   └────┬─────┘
//!                      │                                 │
//!                      ▼                                 ▼
//!                ┌────────────┐                   ┌─────────────┐
//!                │ completion │◀──── summary ─────│ in-process  │
//!                │    API     │                   │ stages      │
//!                └────────────┘                   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! askdata init                       # create the collection table
//! askdata load ./data/financials.json
//! askdata query 'db._test.find({channel: "Retail"}).limit(5)'
//! askdata ask "Which channel had the highest revenue in 2023?"
//! askdata serve                      # POST /api/query
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Request, intermediate and response types |
//! | [`schema`] | The fixed collection schema |
//! | [`prompt`] | Prompt text for both completion calls |
//! | [`completion`] | Chat completion client |
//! | [`sanitize`] | Fenced-block extraction and collection placeholder |
//! | [`query`] | Closed query grammar: parser, planner, evaluator |
//! | [`store`] | Document store trait, SQLite and in-memory stores |
//! | [`executor`] | Runs sanitized queries against a store |
//! | [`tokenizer`] | Per-request tokenizer lease |
//! | [`pipeline`] | Generate, sanitize, execute, summarize |
//! | [`auth`] | Session gate |
//! | [`server`] | HTTP server |
//! | [`ingest`] | JSON document import |
//! | [`db`] | Database connection |
//! | [`migrate`] | Collection table creation |

pub mod auth;
pub mod completion;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod query;
pub mod sanitize;
pub mod schema;
pub mod server;
pub mod store;
pub mod tokenizer;
