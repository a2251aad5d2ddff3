//! Poltergeist MCP server.
//!
//! Exposes the purchase-orchestration tools (product research, cart
//! management, spending-limited checkout, purchase history) to MCP
//! clients over newline-delimited JSON-RPC on stdio.

pub mod protocol;
pub mod server;
pub mod tools;

pub use server::McpServer;
pub use tools::AppState;
