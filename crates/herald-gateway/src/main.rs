use std::sync::Arc;

use tracing::info;

mod app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=info,herald_gateway=info".into()),
        )
        .init();

    // Load config: explicit path arg > HERALD_CONFIG env > ./herald.toml
    let config_path = std::env::args().nth(1);
    let config = herald_core::config::HeraldConfig::load(config_path.as_deref())?;

    let app = app::App::build(config).await?;
    let ctx = Arc::clone(&app.ctx);

    info!("herald gateway starting");
    herald_telegram::TelegramAdapter::new(ctx).run().await;

    // Dispatcher returned (ctrl-c): drain the write-behind queue before
    // the process exits.
    info!("dispatcher stopped, draining write-behind queue");
    app.shutdown().await;
    Ok(())
}
