//! Agent execution pipeline: the streaming turn loop, tool registry,
//! context builder, draft streamer, and balance gate.
//!
//! The frontend is reached only through the `Outbound` trait; the LLM only
//! through `LlmProvider`. Both seams have scripted fakes in the tests.

pub mod anthropic;
pub mod anthropic_stream;
pub mod context;
pub mod critique;
pub mod display;
pub mod draft;
pub mod files_api;
pub mod gate;
pub mod orchestrator;
pub mod outbound;
pub mod pricing;
pub mod provider;
pub mod runtime;
pub mod services;
pub mod stream;
pub mod tokens;
pub mod tools;
pub mod tracker;

pub use herald_core::{HeraldError, Result};
