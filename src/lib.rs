//! llm-ratelimit - per-user rate limiting for LLM-backed chat bot commands
//!
//! This crate implements the core of a chat-bot plugin that throttles how often
//! each user may reach the LLM backend. It keeps a sliding window of request
//! timestamps per user, honors a whitelist and per-user/per-group overrides,
//! and exposes an `rl` admin command group for changing the configuration at
//! runtime.

pub mod command;
pub mod config;
pub mod error;
pub mod plugin;
pub mod ratelimit;
pub mod store;
