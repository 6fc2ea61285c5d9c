//! CLI command implementations.

pub mod completions;
pub mod info;
pub mod mock_server;
