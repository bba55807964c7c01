//! # PointSync Testkit
//!
//! Test utilities for PointSync.
//!
//! This crate provides:
//! - Synchronizer harnesses over mock backends and an in-process server
//! - Property-based test generators using proptest
//! - A scenario runner that checks convergence against a model store
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pointsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_server() {
//!     let harness = ServerHarness::new();
//!     harness.server.ledger().award("alice", 10);
//!     let handle = harness.subscribe("alice").await.unwrap();
//!     assert_eq!(handle.read(), 10);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod scenario;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::scenario::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use scenario::*;
pub use stress::*;
