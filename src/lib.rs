//! # claude-relay
//!
//! A local reverse proxy that multiplexes the Claude Messages API onto a
//! pool of heterogeneous LLM upstreams (Claude, OpenAI, Gemini), with
//! transparent failover, streaming translation, and per-upstream
//! statistics.
//!
//! ## Modules
//!
//! - [`config`] - TOML configuration loading and validation
//! - [`models`] - Claude Messages API wire types
//! - [`pool`] - the live upstream pool, pin, and cool-down state
//! - [`providers`] - the three protocol transformers and SSE plumbing
//! - [`proxy`] - the routing / failover engine
//! - [`server`] - the HTTP listener and its lifecycle
//! - [`stats`] - per-upstream counters with JSON persistence

pub mod config;
pub mod models;
pub mod pid;
pub mod pool;
pub mod providers;
pub mod proxy;
pub mod server;
pub mod stats;
