//! Integration test entry point for courier-node.
//!
//! Run with: cargo test --test integration

mod barrier;
mod connect;
mod end_to_end;
mod framing;
