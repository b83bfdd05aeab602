//! Shared agent context: every subsystem a turn needs, wired once at
//! startup and passed as `Arc<AgentContext>`.

use std::sync::Arc;

use herald_cache::CacheHandle;
use herald_core::config::HeraldConfig;
use herald_store::Store;

use crate::files_api::FilesClient;
use crate::gate::BalanceGate;
use crate::provider::LlmProvider;
use crate::services::imagegen::ImageGenClient;
use crate::services::latex::LatexClient;
use crate::services::sandbox::SandboxClient;
use crate::services::transcribe::TranscribeClient;
use crate::tracker::GenerationTracker;

pub struct AgentContext {
    pub config: HeraldConfig,
    pub store: Arc<Store>,
    pub cache: Arc<CacheHandle>,
    pub provider: Arc<dyn LlmProvider>,
    pub files: Arc<FilesClient>,
    pub sandbox: SandboxClient,
    pub transcriber: TranscribeClient,
    pub imagegen: ImageGenClient,
    pub latex: LatexClient,
    pub tracker: GenerationTracker,
    pub gate: BalanceGate,
}

impl AgentContext {
    pub fn new(
        config: HeraldConfig,
        store: Arc<Store>,
        cache: Arc<CacheHandle>,
        provider: Arc<dyn LlmProvider>,
    ) -> Self {
        let files = Arc::new(FilesClient::new(&config.anthropic));
        let sandbox = SandboxClient::new(&config.services.sandbox);
        let transcriber = TranscribeClient::new(&config.services.transcription);
        let imagegen = ImageGenClient::new(&config.services.image_generation);
        let latex = LatexClient::new(&config.services.latex);
        let gate = BalanceGate::new(Arc::clone(&store), Arc::clone(&cache));
        Self {
            config,
            store,
            cache,
            provider,
            files,
            sandbox,
            transcriber,
            imagegen,
            latex,
            tracker: GenerationTracker::new(),
            gate,
        }
    }
}
