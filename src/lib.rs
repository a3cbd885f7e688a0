//! # Vault Context
//!
//! Client-side retrieval and ranking over a note vault that is reachable
//! only through a minimal HTTP file API (list a directory, read a note,
//! write a note). There is no server-side search: the engine walks the
//! vault, fetches candidate notes, ranks them locally and packs the best
//! excerpts into a token budget for an AI agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌───────────┐   ┌──────────┐   ┌──────────┐
//! │  Query   │──▶│ Aggregate │──▶│ Rank+Boost│──▶│  Dedup   │──▶│ Assemble │
//! │ Composer │   │ browse/3× │   │  TF-IDF   │   │ Levensh. │   │  budget  │
//! └──────────┘   └─────┬─────┘   └───────────┘   └──────────┘   └──────────┘
//!                      │
//!        ┌─────────────┼──────────────┐
//!        ▼             ▼              ▼
//!  ┌──────────┐  ┌───────────┐  ┌───────────┐
//!  │Discovery │  │ TTL Cache │  │ Transport │── retries, breaker, tiers
//!  └──────────┘  └───────────┘  └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vctx list                                 # walk the vault
//! vctx search "incident review"             # ranked matches
//! vctx ask "what changed in the q3 rollout" # budgeted context block
//! vctx serve                                # HTTP tools + MCP
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`circuit`] | Circuit breaker |
//! | [`transport`] | HTTP transport: retries, timeout tiers, streaming |
//! | [`vault`] | Vault file API binding |
//! | [`cache`] | TTL cache with optional disk persistence |
//! | [`discovery`] | Bounded recursive directory walk |
//! | [`query`] | Query composition and expansion |
//! | [`stream`] | Streaming segment merger |
//! | [`aggregate`] | Candidate aggregation passes |
//! | [`rank`] | TF-IDF ranking |
//! | [`boost`] | Path, tag and freshness boosts |
//! | [`dedup`] | Near-duplicate removal |
//! | [`context`] | Budgeted context assembly |
//! | [`pipeline`] | Per-query state machine |
//! | [`engine`] | Shared service object |
//! | [`params`] | Tool parameter validation |
//! | [`traits`] | Tool trait and registry |
//! | [`server`] | HTTP tool server |
//! | [`mcp`] | MCP protocol bridge |
//! | [`stats`] | Stats report |

pub mod aggregate;
pub mod boost;
pub mod cache;
pub mod circuit;
pub mod config;
pub mod context;
pub mod dedup;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod mcp;
pub mod models;
pub mod params;
pub mod pipeline;
pub mod query;
pub mod rank;
pub mod server;
pub mod stats;
pub mod stream;
pub mod traits;
pub mod transport;
pub mod vault;
