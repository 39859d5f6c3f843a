//! Courier Node -- library crate for the active-messaging runtime.
//!
//! Re-exports the runtime types so integration tests and the binary can
//! build nodes, register actions and inspect connections.

pub mod config;
pub mod connection;
pub mod error;
pub mod node;
pub mod queue;
pub mod stats;
pub mod table;

use std::path::PathBuf;

pub use config::NodeConfig;
pub use connection::{Connection, Direction, WriteDone};
pub use courier_protocol::{Action, TypedAction};
pub use error::{NodeError, Result};
pub use node::{EntryPoint, LocalTask, Node, NodeAction, NodeHandle, Registry};
pub use stats::{NodeStats, StatsSnapshot};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
