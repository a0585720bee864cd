pub mod config;
pub mod data_dir;
mod fsio;
pub mod installer;
pub mod llm_chat;
pub mod metrics;
pub mod ocr_cli;
pub mod ocr_vision;
pub mod orchestrator;
pub mod provider;
pub mod runtime_api;
mod safe_print;
pub mod secrets;
pub mod shortcut_executor;
pub mod shortcuts;
pub mod stt_cli;
pub mod stt_http;
pub mod trace;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

pub use config::{
    load_runtime_config, normalize_runtime_config, save_runtime_config, RuntimeConfig,
};
pub use installer::{InstallAction, InstallJob, InstallState, InstallerService, StartJobRequest};
pub use orchestrator::Orchestrator;
pub use provider::{
    Capability, LlmProvider, LlmRequest, LlmResult, OcrProvider, OcrRequest, OcrResult,
    ProviderDescriptor, ProviderHandle, ProviderRegistry, ProviderStatus, SttProvider, SttRequest,
    SttResult,
};
pub use runtime_api::RuntimeApiServer;
pub use secrets::SecretsService;
pub use shortcut_executor::{
    RecordedAudio, RecordingSource, ScreenshotSource, ShortcutExecutor, TextSink,
};
pub use shortcuts::{validate_shortcuts, ShortcutDefinition, ShortcutStep, ValidationReport};

/// One wired instance of the provider stack: secrets, the provider
/// registry with the built-in providers registered, the installer queue,
/// and the orchestrator holding the normalized config.
pub struct Runtime {
    pub data_dir: PathBuf,
    pub secrets: Arc<SecretsService>,
    pub registry: ProviderRegistry,
    pub installer: InstallerService,
    pub orchestrator: Orchestrator,
}

impl Runtime {
    /// Bring up the stack against one data directory: load and normalize
    /// `config.json` (writing it back if normalization changed it) and
    /// register the built-in providers for all three capabilities.
    pub fn bootstrap(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir failed: {}", data_dir.display()))?;
        let secrets = Arc::new(SecretsService::new(data_dir));

        let registry = ProviderRegistry::new();
        registry.register(ProviderHandle::Stt(Arc::new(
            stt_cli::WhisperCliProvider::new(data_dir),
        )));
        registry.register(ProviderHandle::Stt(Arc::new(
            stt_http::WhisperHttpProvider::new(secrets.clone()),
        )));
        registry.register(ProviderHandle::Llm(Arc::new(
            llm_chat::OpenAiCompatibleProvider::new(secrets.clone()),
        )));
        registry.register(ProviderHandle::Ocr(Arc::new(
            ocr_cli::TesseractCliProvider::new(data_dir),
        )));
        registry.register(ProviderHandle::Ocr(Arc::new(
            ocr_vision::VisionLlmProvider::new(secrets.clone()),
        )));

        let installer = InstallerService::new(data_dir);
        let orchestrator = Orchestrator::new(data_dir, registry.clone(), installer.clone());
        let cfg = load_runtime_config(&config::config_path(data_dir))?;
        orchestrator.configure(cfg);

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            secrets,
            registry,
            installer,
            orchestrator,
        })
    }

    /// Start the local runtime API when the config enables it. Returns the
    /// bound TCP address, or `None` when disabled or bound to a unix socket.
    pub async fn start_api(
        &self,
        cancel: CancellationToken,
    ) -> Result<Option<std::net::SocketAddr>> {
        let cfg = self.orchestrator.config_snapshot().runtime_api;
        if !cfg.enabled {
            return Ok(None);
        }
        let server = RuntimeApiServer::from_config(self.orchestrator.clone(), &self.secrets, &cfg)?;
        #[cfg(unix)]
        if let Some(path) = cfg
            .socket_path
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            server.start_unix(Path::new(path), cancel).await?;
            return Ok(None);
        }
        let addr = server.start_tcp(&cfg.host, cfg.port, cancel).await?;
        Ok(Some(addr))
    }

    /// Wire the shortcut executor against the platform seams the embedding
    /// shell provides (hotkey capture, microphone, clipboard automation).
    pub fn shortcut_executor(
        &self,
        recording: Arc<dyn RecordingSource>,
        screenshot: Arc<dyn ScreenshotSource>,
        sink: Arc<dyn TextSink>,
    ) -> ShortcutExecutor {
        ShortcutExecutor::new(
            &self.data_dir,
            self.orchestrator.clone(),
            recording,
            screenshot,
            sink,
        )
    }
}
