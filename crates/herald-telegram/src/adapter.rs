//! Telegram channel adapter: wraps a teloxide `Bot` + `Dispatcher` and
//! drives the long-polling loop for the lifetime of the process.

use std::sync::Arc;

use teloxide::prelude::*;
use tracing::info;

use herald_agent::runtime::AgentContext;

use crate::batcher::Batcher;
use crate::handler;

pub struct TelegramAdapter {
    ctx: Arc<AgentContext>,
}

impl TelegramAdapter {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Connect and dispatch until the process exits. Long polling — no
    /// public URL required.
    pub async fn run(self) {
        let bot = Bot::new(&self.ctx.config.telegram.bot_token);
        let batcher = Arc::new(Batcher::new(Arc::clone(&self.ctx), bot.clone()));

        info!("telegram: starting long-polling dispatcher");

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(handler::handle_message))
            .branch(Update::filter_edited_message().endpoint(handler::handle_edited_message))
            .branch(Update::filter_callback_query().endpoint(handler::handle_callback));

        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![Arc::clone(&self.ctx), batcher])
            .default_handler(|_upd| async {})
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;
    }
}
