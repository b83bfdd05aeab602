//! Durable store gateway: rusqlite repositories over the system of record.
//!
//! Reached on cache miss (reads) and by the write-behind flusher (bulk
//! writes). Balance mutations never ride the queue — `billing` writes them
//! synchronously in one transaction with their audit row.

pub mod billing;
pub mod chats;
pub mod db;
pub mod files;
pub mod flusher;
pub mod messages;
pub mod settings;
pub mod threads;
pub mod users;

mod error;

pub use db::Store;
pub use error::{Result, StoreError};
pub use flusher::Flusher;
