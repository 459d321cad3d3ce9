//! tgw-daemon library target.
//!
//! Exposes the router, state, hub and device layer for integration tests.
//! The binary `main.rs` depends on this library target.

pub mod api_types;
pub mod bus;
pub mod devices;
pub mod hub;
pub mod routes;
pub mod state;
pub mod storage;
