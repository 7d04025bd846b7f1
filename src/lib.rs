//! Rapport is a terminal chat client for local and hosted language models.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the neutral message model, the provider adapters, the
//!   model registry, the turn-resolution loop and the session lifecycle.
//! - [`mcp`] bridges provider tool calls to MCP servers over stdio or
//!   streamable HTTP, behind per-server allow-lists.
//! - [`api`] defines the wire payloads spoken by the provider adapters.
//! - [`cli`] parses arguments and runs the `models`, `tools`, `ask` and
//!   `chat` commands.
//!
//! The binary (`src/main.rs`) installs [`logging`] and routes through
//! [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod logging;
pub mod mcp;
pub mod utils;
