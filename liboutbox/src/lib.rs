//! liboutbox - core library for the Outbox publishing pipeline
//!
//! Outbox publishes scheduled social posts on behalf of tenants: a
//! scanner finds due posts, a broker hands them to a worker pool, and
//! workers resolve OAuth credentials (refreshing tokens as needed) and
//! publish through a provider adapter. Posts move monotonically from
//! pending to published or failed.

pub mod broker;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod publisher;
pub mod scanner;
pub mod token;
pub mod types;
pub mod vault;

pub use config::Config;
pub use crypto::{CryptoMode, TokenCipher};
pub use db::Database;
pub use error::{OutboxError, Result};
pub use pipeline::Pipeline;
pub use types::{Credential, PostStatus, ScheduledPost};
