//! Telegram frontend adapter: ingress normalization, per-thread batching,
//! the outbound implementation the agent streams drafts through, and the
//! user/admin command surface.

pub mod adapter;
pub mod batcher;
pub mod commands;
pub mod error;
pub mod handler;
pub mod ingress;
pub mod outbound;
pub mod send;

pub use adapter::TelegramAdapter;
pub use error::TelegramError;
