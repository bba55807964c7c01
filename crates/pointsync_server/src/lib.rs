//! # PointSync Server
//!
//! Reference points server for PointSync.
//!
//! This crate provides:
//! - An in-memory points ledger with a strictly increasing server clock
//! - Snapshot reads and filtered change feeds over the wire protocol
//! - Authentication (HMAC-SHA256 tokens bound to an account key)
//! - Fault injection (severed feeds, failing snapshots) for testing clients
//!
//! # Architecture
//!
//! Every ledger write is stamped and broadcast to open feeds in commit
//! order. A feed filters the broadcast down to the keys it was opened for.
//! Snapshots carry the timestamp of the write they reflect, so a client can
//! order them against events.
//!
//! # Authentication
//!
//! Authentication is optional but recommended for production:
//!
//! ```rust,ignore
//! use pointsync_server::{AuthConfig, PointsServer, ServerConfig, TokenValidator};
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let server = PointsServer::new(ServerConfig::default().with_auth(secret.clone()));
//!
//! // Issue a token for an account
//! let validator = TokenValidator::new(AuthConfig::new(secret));
//! let token = validator.create_token(&"user-1".into())?;
//! ```
//!
//! A token only grants access to the account it was issued for.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod auth;
mod config;
mod error;
mod handler;
mod ledger;
mod server;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{FeedStream, HandlerContext, RequestHandler};
pub use ledger::PointsLedger;
pub use server::PointsServer;
