//! finflow - financial-analysis workflow backend.
//!
//! finflow drives multi-step "AI agent" runs for stock-analysis chat: it
//! streams step-by-step progress to the client over Server-Sent Events while
//! durably recording every step, message, and derived resource into SQLite
//! with idempotent upserts keyed by client-supplied identifiers.
//!
//! ## Key pieces
//!
//! - **Persistence service**: sole writer of workflow state; every write is
//!   safe to retry and a persistence hiccup never interrupts a live stream
//! - **Step generator**: turns a user message into an ordered step plan,
//!   from the AI when it cooperates and from deterministic templates when
//!   it does not
//! - **Streaming orchestrator**: one driver task per SSE connection with a
//!   totally ordered event protocol (`start` .. `complete`/`error`)
//! - **Background runners**: a simulated five-agent pipeline and a small
//!   node-graph executor (validation, cycle detection, topological order)

pub mod ai;
pub mod api;
pub mod config;
pub mod error;
pub mod generator;
pub mod runner;
pub mod storage;
pub mod stream;
pub mod workflow;

pub use error::{Error, Result};
