//! # Atlas Relay
//!
//! A retrieval-augmented chat relay with streaming citations.
//!
//! Atlas Relay sits between chat clients and a hosted model/retrieval
//! gateway: it forwards a user question plus conversation history, streams
//! the incremental answer back over a framed event protocol, resolves
//! citation titles to stable document links through a TTL-cached file
//! mapping, and persists the exchange in SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌───────────────┐   ┌───────────────┐
//! │ Client  │──▶│  HTTP Server  │──▶│  Chat Relay    │──▶ model gateway
//! │         │◀──│  (frames)     │◀──│  (turn loop)   │◀── (NDJSON units)
//! └─────────┘   └───────────────┘   └──┬─────────┬──┘
//!                                      │         │
//!                                ┌─────▼───┐ ┌───▼──────┐
//!                                │ SQLite  │ │ Resolver  │──▶ file mapping
//!                                │ store   │ │ TTL cache │    (object store)
//!                                └─────────┘ └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`protocol`] | Stream event framing and decoding |
//! | [`resolver`] | Citation title → document link resolution |
//! | [`upstream`] | Model gateway client |
//! | [`relay`] | Per-turn orchestration |
//! | [`consumer`] | Client-side stream reduction |
//! | [`store`] | Conversation persistence |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod consumer;
pub mod db;
pub mod migrate;
pub mod models;
pub mod protocol;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod store;
pub mod upstream;
