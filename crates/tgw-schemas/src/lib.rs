//! tgw-schemas
//!
//! Shared data model for the gateway consistency core. Plain data only: no
//! IO, no locking, no async. Every crate in the workspace speaks these types.

pub mod diagnostics;
pub mod storage;
pub mod wire;

pub use diagnostics::*;
pub use storage::*;
pub use wire::*;
