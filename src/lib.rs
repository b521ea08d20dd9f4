//! On-premise sync agent.
//!
//! A long-lived process installed next to customer databases. The remote
//! service drives it over a persistent websocket control channel; the agent
//! extracts rows per configured table and streams them back, either inline
//! as `data_update` messages or, for large tables, as direct HTTP uploads
//! from a dedicated worker process.
//!
//! Process layout: a supervisor ([`supervisor`]) watches a single worker
//! ([`agent::run_worker`]); the worker hosts the control channel
//! ([`channel`]), the sync engine ([`engine`]), and spawns one extra process
//! per active large-table run ([`worker`]).

pub mod adapters;
pub mod agent;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod rows;
pub mod state;
pub mod supervisor;
pub mod vault;
pub mod worker;
