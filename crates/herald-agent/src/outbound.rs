//! Frontend seam. The orchestrator, draft, and tools talk to the
//! messaging platform only through this trait; `herald-telegram`
//! implements it and the tests script it.

use async_trait::async_trait;

use herald_core::Result;

#[async_trait]
pub trait Outbound: Send + Sync {
    /// Send a new message; returns the frontend message id.
    /// `with_stop` attaches the stop control for an active generation.
    async fn send_text(&self, chat_id: i64, text: &str, with_stop: bool) -> Result<i64>;

    /// Edit an existing message in place.
    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        with_stop: bool,
    ) -> Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()>;

    /// Deliver a file; returns the frontend message id.
    async fn send_file(
        &self,
        chat_id: i64,
        filename: &str,
        mime: &str,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<i64>;

    /// Max characters per message; longer finals are split.
    fn text_limit(&self) -> usize;
}
