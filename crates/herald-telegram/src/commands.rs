//! Slash command surface: user commands plus the operator-only admin set.
//!
//! Admin commands are gated on the configured id allowlist and hit the
//! durable store directly, invalidating caches as they go.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;

use herald_agent::runtime::AgentContext;
use herald_core::types::{OpKind, ThreadKey};
use herald_store::billing::OpDetails;

const HELP: &str = "I'm an AI assistant. Send text, photos, documents, voice or video \
and I'll respond — I can analyze files, run Python, search the web, generate images, \
and render LaTeX.\n\n\
Commands:\n\
/balance — show your balance\n\
/model [name] — show or set the model for this conversation\n\
/personality [text|clear] — set how I should behave for you\n\
/help — this message";

/// Handle a command message. Returns the reply text, or `None` when the
/// text is not a command we know (it then flows to the agent as chat).
pub async fn handle(
    ctx: &Arc<AgentContext>,
    key: ThreadKey,
    sender_id: i64,
    text: &str,
) -> Option<String> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts
        .next()
        .unwrap_or("")
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("");
    let args = parts.next().unwrap_or("").trim();

    match command {
        "start" => Some(format!(
            "Hello! {HELP}\n\nYour balance: ${}",
            balance_of(ctx, key.user_id).await
        )),
        "help" => Some(HELP.to_string()),
        "balance" => Some(format!(
            "Your balance: ${}",
            balance_of(ctx, key.user_id).await
        )),
        "model" => Some(set_model(ctx, &key, args).await),
        "personality" => Some(set_personality(ctx, key.user_id, args).await),
        // Operator-only surface.
        "set_balance" | "add_balance" | "refund" | "top_spenders" | "user_balance"
        | "set_margin" => {
            if !ctx.config.telegram.admin_ids.contains(&sender_id) {
                return Some("This command is operator-only.".to_string());
            }
            Some(admin(ctx, command, args).await)
        }
        _ => None,
    }
}

async fn balance_of(ctx: &Arc<AgentContext>, user_id: i64) -> String {
    match ctx.gate.balance(user_id).await {
        Ok(balance) => format!("{:.2}", balance),
        Err(_) => "0.00".to_string(),
    }
}

async fn set_model(ctx: &Arc<AgentContext>, key: &ThreadKey, args: &str) -> String {
    let available: Vec<&str> = ctx.config.models.keys().map(String::as_str).collect();
    if args.is_empty() {
        let current = match ctx.store.get_or_create_thread(key) {
            Ok(thread) => thread
                .model_key
                .unwrap_or_else(|| ctx.config.anthropic.default_model.clone()),
            Err(_) => ctx.config.anthropic.default_model.clone(),
        };
        return format!(
            "Current model: {current}\nAvailable: {}",
            available.join(", ")
        );
    }
    if !ctx.config.models.contains_key(args) {
        return format!("Unknown model '{args}'. Available: {}", available.join(", "));
    }
    match ctx.store.get_or_create_thread(key) {
        Ok(thread) => {
            if ctx.store.set_thread_model(&thread.id, Some(args)).is_err() {
                return "Failed to set the model; try again.".to_string();
            }
            ctx.cache.invalidate_thread(key).await;
            // In a private chat this is also the user's preference, so new
            // conversations elsewhere pick it up too.
            if key.chat_id == key.user_id
                && ctx.store.set_preferred_model(key.user_id, Some(args)).is_ok()
            {
                ctx.cache.invalidate_user(key.user_id).await;
            }
            format!("This conversation now uses {args}.")
        }
        Err(_) => "Failed to set the model; try again.".to_string(),
    }
}

async fn set_personality(ctx: &Arc<AgentContext>, user_id: i64, args: &str) -> String {
    if args.is_empty() {
        return "Usage: /personality <how I should behave>, or /personality clear".to_string();
    }
    let value = if args.eq_ignore_ascii_case("clear") {
        None
    } else {
        Some(args)
    };
    if ctx.store.set_personality(user_id, value).is_err() {
        return "Failed to save; try again.".to_string();
    }
    ctx.cache.invalidate_user(user_id).await;
    match value {
        Some(_) => "Saved. I'll keep that in mind.".to_string(),
        None => "Personality cleared.".to_string(),
    }
}

async fn admin(ctx: &Arc<AgentContext>, command: &str, args: &str) -> String {
    let mut parts = args.split_whitespace();
    match command {
        "set_balance" => {
            let (Some(user), Some(amount)) = (parts.next(), parts.next()) else {
                return "Usage: /set_balance <user_id> <amount>".to_string();
            };
            let (Ok(user_id), Ok(target)) = (user.parse::<i64>(), amount.parse::<Decimal>())
            else {
                return "Bad arguments.".to_string();
            };
            let current = match ctx.store.user_balance(user_id) {
                Ok(b) => b,
                Err(e) => return format!("Lookup failed: {e}"),
            };
            match ctx.store.apply_balance_op(
                user_id,
                OpKind::AdminAdjust,
                target - current,
                "operator set_balance",
                OpDetails::default(),
            ) {
                Ok(op) => {
                    ctx.cache.invalidate_user(user_id).await;
                    info!(user_id, balance = %op.balance_after, "operator set balance");
                    format!("Balance of {user_id} set to ${}", op.balance_after)
                }
                Err(e) => format!("Failed: {e}"),
            }
        }
        "add_balance" => {
            let (Some(user), Some(amount)) = (parts.next(), parts.next()) else {
                return "Usage: /add_balance <user_id> <amount> [provider_charge_id]".to_string();
            };
            let (Ok(user_id), Ok(delta)) = (user.parse::<i64>(), amount.parse::<Decimal>()) else {
                return "Bad arguments.".to_string();
            };
            let charge_id = parts.next().map(str::to_string);
            match ctx.store.apply_balance_op(
                user_id,
                OpKind::Deposit,
                delta,
                "operator deposit",
                OpDetails {
                    provider_charge_id: charge_id,
                    ..Default::default()
                },
            ) {
                Ok(op) => {
                    ctx.cache.invalidate_user(user_id).await;
                    format!(
                        "Deposited ${delta} to {user_id} (balance ${}) — op {}",
                        op.balance_after, op.id
                    )
                }
                Err(e) => format!("Failed: {e}"),
            }
        }
        "refund" => {
            let Some(op_id) = parts.next() else {
                return "Usage: /refund <operation_id>".to_string();
            };
            match ctx.store.refund_deposit(op_id) {
                Ok(op) => {
                    ctx.cache.invalidate_user(op.user_id).await;
                    format!(
                        "Refunded {op_id}: {} now has ${}",
                        op.user_id, op.balance_after
                    )
                }
                Err(e) => format!("Refund failed: {e}"),
            }
        }
        "top_spenders" => {
            let limit = parts
                .next()
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(10);
            match ctx.store.top_spenders(limit) {
                Ok(ranked) if ranked.is_empty() => "No charges recorded yet.".to_string(),
                Ok(ranked) => ranked
                    .iter()
                    .enumerate()
                    .map(|(i, (user_id, spent))| format!("{}. {user_id} — ${spent}", i + 1))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => format!("Failed: {e}"),
            }
        }
        "user_balance" => {
            let Some(user) = parts.next() else {
                return "Usage: /user_balance <user_id>".to_string();
            };
            let Ok(user_id) = user.parse::<i64>() else {
                return "Bad user id.".to_string();
            };
            match ctx.store.user_balance(user_id) {
                Ok(balance) => format!("{user_id} has ${balance}"),
                Err(e) => format!("Lookup failed: {e}"),
            }
        }
        "set_margin" => {
            let (Some(model), Some(margin)) = (parts.next(), parts.next()) else {
                return "Usage: /set_margin <model_key> <multiplier>".to_string();
            };
            if !ctx.config.models.contains_key(model) {
                return format!("Unknown model '{model}'.");
            }
            let Ok(margin) = margin.parse::<Decimal>() else {
                return "Bad multiplier.".to_string();
            };
            match ctx.store.set_model_margin(model, margin) {
                Ok(()) => format!("Margin for {model} set to {margin}×"),
                Err(e) => format!("Failed: {e}"),
            }
        }
        _ => unreachable!("gated by caller"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    use figment::providers::Format;
    use herald_cache::{CacheHandle, MemoryBackend};
    use herald_core::config::{CacheConfig, HeraldConfig};
    use herald_store::Store;
    use rust_decimal_macros::dec;

    use async_trait::async_trait;
    use herald_agent::provider::{ChatRequest, ChatResponse, LlmProvider};
    use herald_agent::stream::StreamEvent;
    use tokio::sync::mpsc;

    struct NullProvider;

    #[async_trait]
    impl LlmProvider for NullProvider {
        fn name(&self) -> &str {
            "null"
        }
        async fn send_stream(
            &self,
            _req: &ChatRequest,
            _tx: mpsc::Sender<StreamEvent>,
        ) -> herald_core::Result<()> {
            unimplemented!("commands never reach the provider")
        }
        async fn send(&self, _req: &ChatRequest) -> herald_core::Result<ChatResponse> {
            unimplemented!("commands never reach the provider")
        }
    }

    fn ctx_with_admin(admin_id: i64) -> StdArc<AgentContext> {
        let config: HeraldConfig = figment::Figment::new()
            .merge(figment::providers::Toml::string(&format!(
                r#"
                [telegram]
                bot_token = "t"
                admin_ids = [{admin_id}]
                [anthropic]
                api_key = "k"
                "#
            )))
            .extract()
            .unwrap();
        let store = StdArc::new(Store::open_in_memory().unwrap());
        store.upsert_user(2, "alice", false).unwrap();
        let cache = StdArc::new(CacheHandle::new(
            StdArc::new(MemoryBackend::new()),
            &CacheConfig::default(),
        ));
        StdArc::new(AgentContext::new(
            config,
            store,
            cache,
            StdArc::new(NullProvider),
        ))
    }

    fn key() -> ThreadKey {
        ThreadKey::new(1, 2, None)
    }

    #[tokio::test]
    async fn non_commands_flow_through() {
        let ctx = ctx_with_admin(99);
        assert!(handle(&ctx, key(), 2, "hello there").await.is_none());
        assert!(handle(&ctx, key(), 2, "/unknown_thing").await.is_none());
    }

    #[tokio::test]
    async fn balance_command_formats_two_decimals() {
        let ctx = ctx_with_admin(99);
        ctx.store
            .apply_balance_op(2, OpKind::Deposit, dec!(1.5), "seed", OpDetails::default())
            .unwrap();
        let reply = handle(&ctx, key(), 2, "/balance").await.unwrap();
        assert!(reply.contains("$1.50"));
    }

    #[tokio::test]
    async fn model_command_sets_thread_override() {
        let ctx = ctx_with_admin(99);
        let reply = handle(&ctx, key(), 2, "/model haiku").await.unwrap();
        assert!(reply.contains("haiku"));
        let thread = ctx.store.get_or_create_thread(&key()).unwrap();
        assert_eq!(thread.model_key.as_deref(), Some("haiku"));

        let reply = handle(&ctx, key(), 2, "/model nope").await.unwrap();
        assert!(reply.contains("Unknown model"));
    }

    #[tokio::test]
    async fn admin_commands_gated_on_allowlist() {
        let ctx = ctx_with_admin(99);
        let denied = handle(&ctx, key(), 2, "/set_balance 2 10").await.unwrap();
        assert!(denied.contains("operator-only"));

        let allowed = handle(&ctx, key(), 99, "/set_balance 2 10").await.unwrap();
        assert!(allowed.contains("set to $10"));
        assert_eq!(ctx.store.user_balance(2).unwrap(), dec!(10));
    }

    #[tokio::test]
    async fn add_balance_records_provider_charge_id() {
        let ctx = ctx_with_admin(99);
        let reply = handle(&ctx, key(), 99, "/add_balance 2 5 ch_abc")
            .await
            .unwrap();
        assert!(reply.contains("Deposited"));
        let ops = ctx.store.balance_history(2, 5).unwrap();
        assert_eq!(ops[0].kind, OpKind::Deposit);
        assert_eq!(ops[0].provider_charge_id.as_deref(), Some("ch_abc"));
    }

    #[tokio::test]
    async fn set_margin_updates_durable_setting() {
        let ctx = ctx_with_admin(99);
        let reply = handle(&ctx, key(), 99, "/set_margin sonnet 1.5")
            .await
            .unwrap();
        assert!(reply.contains("1.5"));
        assert_eq!(ctx.store.model_margin("sonnet"), dec!(1.5));
        let bad = handle(&ctx, key(), 99, "/set_margin nope 2").await.unwrap();
        assert!(bad.contains("Unknown model"));
    }

    #[tokio::test]
    async fn private_chat_model_change_sets_user_preference() {
        let ctx = ctx_with_admin(99);
        // Private chats have chat_id == user_id.
        let private = ThreadKey::new(2, 2, None);
        handle(&ctx, private, 2, "/model haiku").await.unwrap();
        let user = ctx.store.get_user(2).unwrap().unwrap();
        assert_eq!(user.preferred_model.as_deref(), Some("haiku"));
    }

    #[tokio::test]
    async fn refund_round_trips_through_command() {
        let ctx = ctx_with_admin(99);
        handle(&ctx, key(), 99, "/add_balance 2 5 ch_abc").await;
        let op_id = ctx.store.balance_history(2, 1).unwrap()[0].id.clone();
        let reply = handle(&ctx, key(), 99, &format!("/refund {op_id}"))
            .await
            .unwrap();
        assert!(reply.contains("Refunded"));
        assert_eq!(ctx.store.user_balance(2).unwrap(), Decimal::ZERO);
    }
}
