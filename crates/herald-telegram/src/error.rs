/// Errors produced by the Telegram adapter.
#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("teloxide error: {0}")]
    Teloxide(#[from] teloxide::RequestError),

    #[error("download error: {0}")]
    Download(String),

    #[error("no bot token configured")]
    NoToken,
}

impl From<TelegramError> for herald_core::HeraldError {
    fn from(e: TelegramError) -> Self {
        herald_core::HeraldError::Frontend(e.to_string())
    }
}
