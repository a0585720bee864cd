use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::{
    config::{normalize_runtime_config, ProviderProfile, RuntimeConfig},
    data_dir::temp_dir,
    installer::{InstallState, InstallerService},
    provider::{
        error_code, provider_err, Capability, LlmRequest, LlmResult, OcrRequest, OcrResult,
        ProviderDescriptor, ProviderRegistry, ProviderStatus, SttRequest, SttResult,
    },
    trace::Span,
};

/// Active selection for one capability. `profile: None` is a valid state:
/// the provider runs on its built-in defaults.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSelection {
    pub provider_id: String,
    pub profile: Option<ProviderProfile>,
}

/// Registry descriptor joined with live status and persisted install state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOverview {
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
    pub status: ProviderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallState>,
    pub active: bool,
}

/// Caller-supplied override fields win over the active profile; the
/// active profile fills everything the override leaves unset. Options
/// maps are merged key-wise, override wins per key.
fn merge_profiles(
    active: Option<&ProviderProfile>,
    overlay: Option<&ProviderProfile>,
) -> Option<ProviderProfile> {
    match (active, overlay) {
        (None, None) => None,
        (Some(a), None) => Some(a.clone()),
        (None, Some(o)) => Some(o.clone()),
        (Some(a), Some(o)) => {
            let mut merged = a.clone();
            if o.endpoint.is_some() {
                merged.endpoint = o.endpoint.clone();
            }
            if o.model.is_some() {
                merged.model = o.model.clone();
            }
            if o.language.is_some() {
                merged.language = o.language.clone();
            }
            if o.local_path.is_some() {
                merged.local_path = o.local_path.clone();
            }
            if o.secret_ref.is_some() {
                merged.secret_ref = o.secret_ref.clone();
            }
            for (k, v) in &o.options {
                merged.options.insert(k.clone(), v.clone());
            }
            Some(merged)
        }
    }
}

/// Resolves the active provider+profile per capability and dispatches
/// capability calls through the registry. Holds its own config reference,
/// replaced wholesale by `configure`; it never edits the config in place.
#[derive(Clone)]
pub struct Orchestrator {
    data_dir: PathBuf,
    registry: ProviderRegistry,
    installer: InstallerService,
    config: Arc<Mutex<RuntimeConfig>>,
}

impl Orchestrator {
    pub fn new(data_dir: &Path, registry: ProviderRegistry, installer: InstallerService) -> Self {
        let cfg = normalize_runtime_config(RuntimeConfig::default());
        installer.configure(cfg.installer.clone());
        Self {
            data_dir: data_dir.to_path_buf(),
            registry,
            installer,
            config: Arc::new(Mutex::new(cfg)),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn installer(&self) -> &InstallerService {
        &self.installer
    }

    /// Swap in a fully-normalized config. The previous one is discarded;
    /// in-flight calls keep the selection they already resolved.
    pub fn configure(&self, cfg: RuntimeConfig) {
        self.installer.configure(cfg.installer.clone());
        *self.config.lock().unwrap() = cfg;
    }

    pub fn config_snapshot(&self) -> RuntimeConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn active_provider_profile(&self, cap: Capability) -> ActiveSelection {
        let g = self.config.lock().unwrap();
        let cc = g.capability(cap);
        ActiveSelection {
            provider_id: cc.active_provider_id.clone(),
            profile: cc.active_profile().cloned(),
        }
    }

    pub fn list_providers(&self, capability: Option<Capability>) -> Vec<ProviderOverview> {
        let active_ids: Vec<(Capability, String)> = {
            let g = self.config.lock().unwrap();
            Capability::ALL
                .iter()
                .map(|c| (*c, g.capability(*c).active_provider_id.clone()))
                .collect()
        };
        self.registry
            .list(capability)
            .into_iter()
            .map(|d| {
                let status = self
                    .registry
                    .status_of(&d.id)
                    .unwrap_or_else(ProviderStatus::ready);
                let install = self.installer.install_state(&d.id);
                let active = active_ids
                    .iter()
                    .any(|(c, id)| *c == d.capability && *id == d.id);
                ProviderOverview {
                    descriptor: d,
                    status,
                    install,
                    active,
                }
            })
            .collect()
    }

    pub fn provider_status(&self, id: &str) -> Option<ProviderStatus> {
        self.registry.status_of(id)
    }

    pub async fn transcribe(&self, mut req: SttRequest) -> Result<SttResult> {
        let sel = self.active_provider_profile(Capability::Stt);
        let provider = self.registry.get_stt(&sel.provider_id).ok_or_else(|| {
            provider_err(
                "E_PROVIDER_UNAVAILABLE",
                format!("no stt provider registered for '{}'", sel.provider_id),
            )
        })?;
        req.profile = merge_profiles(sel.profile.as_ref(), req.profile.as_ref());
        let span = Span::start(
            &self.data_dir,
            None,
            "Orchestrator",
            "STT.transcribe",
            Some(serde_json::json!({"provider_id": sel.provider_id})),
        );
        match provider.transcribe(req).await {
            Ok(r) => {
                span.ok(Some(serde_json::json!({"chars": r.text.chars().count()})));
                Ok(r)
            }
            Err(e) => {
                let code = error_code(&e).unwrap_or_else(|| "E_EXEC_FAILED".to_string());
                span.err_anyhow("provider", &code, &e, None);
                Err(e)
            }
        }
    }

    /// Materialize captured audio to a uniquely named file so path-based
    /// backends can read it; the file is removed on every exit path.
    pub async fn transcribe_from_buffer(
        &self,
        audio: &[u8],
        extension: Option<&str>,
        mut req: SttRequest,
    ) -> Result<SttResult> {
        let ext = extension
            .map(|e| e.trim_start_matches('.').to_string())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "wav".to_string());
        let dir = temp_dir(&self.data_dir)?;
        let path = dir.join(format!("capture-{}.{ext}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, audio)
            .await
            .with_context(|| format!("write capture file failed: {}", path.display()))?;
        req.audio_path = Some(path.clone());
        req.audio = None;
        req.extension = Some(ext);
        let out = self.transcribe(req).await;
        let _ = tokio::fs::remove_file(&path).await;
        out
    }

    pub async fn respond_llm(&self, mut req: LlmRequest) -> Result<LlmResult> {
        let sel = self.active_provider_profile(Capability::Llm);
        let provider = self.registry.get_llm(&sel.provider_id).ok_or_else(|| {
            provider_err(
                "E_PROVIDER_UNAVAILABLE",
                format!("no llm provider registered for '{}'", sel.provider_id),
            )
        })?;
        req.profile = merge_profiles(sel.profile.as_ref(), req.profile.as_ref());
        let span = Span::start(
            &self.data_dir,
            None,
            "Orchestrator",
            "LLM.respond",
            Some(serde_json::json!({
                "provider_id": sel.provider_id,
                "streaming": req.delta_tx.is_some(),
            })),
        );
        match provider.respond(req).await {
            Ok(r) => {
                span.ok(Some(serde_json::json!({"chars": r.text.chars().count()})));
                Ok(r)
            }
            Err(e) => {
                let code = error_code(&e).unwrap_or_else(|| "E_EXEC_FAILED".to_string());
                span.err_anyhow("provider", &code, &e, None);
                Err(e)
            }
        }
    }

    pub async fn extract_ocr(&self, mut req: OcrRequest) -> Result<OcrResult> {
        let sel = self.active_provider_profile(Capability::Ocr);
        let provider = self.registry.get_ocr(&sel.provider_id).ok_or_else(|| {
            provider_err(
                "E_PROVIDER_UNAVAILABLE",
                format!("no ocr provider registered for '{}'", sel.provider_id),
            )
        })?;
        req.profile = merge_profiles(sel.profile.as_ref(), req.profile.as_ref());
        let span = Span::start(
            &self.data_dir,
            None,
            "Orchestrator",
            "OCR.extract",
            Some(serde_json::json!({"provider_id": sel.provider_id})),
        );
        match provider.extract_text(req).await {
            Ok(r) => {
                span.ok(Some(serde_json::json!({"chars": r.text.chars().count()})));
                Ok(r)
            }
            Err(e) => {
                let code = error_code(&e).unwrap_or_else(|| "E_EXEC_FAILED".to_string());
                span.err_anyhow("provider", &code, &e, None);
                Err(e)
            }
        }
    }

    /// Preload the active speech backend so the first real transcription
    /// does not pay model load time. A missing provider is a no-op here;
    /// it becomes a dispatch error only when actually called.
    pub async fn warmup_stt(&self) -> Result<()> {
        let sel = self.active_provider_profile(Capability::Stt);
        let Some(provider) = self.registry.get_stt(&sel.provider_id) else {
            return Ok(());
        };
        provider.warmup().await
    }
}
