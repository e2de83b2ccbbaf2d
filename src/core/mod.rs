//! Core modules for Phasegate's workflow server.
//!
//! Storage, retrieval, phase gating and the MCP surface live here. Optional
//! operational concerns (file watching, upgrade checks) live in `plugins`.

pub mod checkpoint;
pub mod chunker;
pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod index;
pub mod models;
pub mod parsers;
pub mod rag;
pub mod rpc;
pub mod server;
pub mod session;
pub mod state;
pub mod time;
pub mod tools;
pub mod validator;
