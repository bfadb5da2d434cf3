//! Gateway: one outward MCP endpoint in front of many backends.
//!
//! - `router`: owns the backend clients, the tool directory and the
//!   prefix-based routing of calls
//! - `server`: the caller-facing JSON-RPC loop over stdio

pub mod router;
pub mod server;

pub use router::{error_result, Gateway};
pub use server::serve;
