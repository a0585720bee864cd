use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderProfile;

pub const PROVIDER_STT_WHISPER_CLI: &str = "whisper_cli";
pub const PROVIDER_STT_WHISPER_HTTP: &str = "whisper_http";
pub const PROVIDER_LLM_OPENAI_COMPATIBLE: &str = "openai_compatible";
pub const PROVIDER_OCR_TESSERACT_CLI: &str = "tesseract_cli";
pub const PROVIDER_OCR_VISION_LLM: &str = "vision_llm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Stt,
    Llm,
    Ocr,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Stt, Capability::Llm, Capability::Ocr];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Stt => "stt",
            Capability::Llm => "llm",
            Capability::Ocr => "ocr",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stt" => Ok(Capability::Stt),
            "llm" => Ok(Capability::Llm),
            "ocr" => Ok(Capability::Ocr),
            other => Err(anyhow!("unknown capability: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Remote,
}

/// Classified provider failure. Callers branch on `code`; the message is
/// for humans.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub code: String,
    pub message: String,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ProviderError {}

pub fn provider_err(code: &str, message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ProviderError {
        code: code.to_string(),
        message: message.into(),
    })
}

pub fn error_code(err: &anyhow::Error) -> Option<String> {
    err.chain()
        .find_map(|e| e.downcast_ref::<ProviderError>().map(|p| p.code.clone()))
}

/// Immutable provider identity, registered once per process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub id: String,
    pub capability: Capability,
    pub display_name: String,
    pub kind: ProviderKind,
    pub requires_install: bool,
    pub supports_local_path: bool,
}

/// Non-blocking self-report: is the backend expected to work right now,
/// and if not, why.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ProviderStatus {
    pub fn ready() -> Self {
        Self {
            ready: true,
            ..Default::default()
        }
    }

    pub fn not_ready(code: &str, message: impl Into<String>) -> Self {
        Self {
            ready: false,
            code: Some(code.to_string()),
            message: Some(message.into()),
            detail: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SttRequest {
    pub audio_path: Option<PathBuf>,
    pub audio: Option<Vec<u8>>,
    pub extension: Option<String>,
    pub language: Option<String>,
    pub profile: Option<ProviderProfile>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct SttResult {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Default, Clone)]
pub struct LlmRequest {
    pub prompt: Option<String>,
    pub messages: Vec<LlmMessage>,
    pub system_prompt: Option<String>,
    pub profile: Option<ProviderProfile>,
    /// Streaming surface: each textual delta is sent as it arrives. The full
    /// concatenated text is still returned at the end of `respond`.
    pub delta_tx: Option<UnboundedSender<String>>,
    pub cancel: CancellationToken,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmResult {
    pub text: String,
}

#[derive(Debug, Default, Clone)]
pub struct OcrRequest {
    pub image_path: Option<PathBuf>,
    pub image: Option<Vec<u8>>,
    pub language_hint: Option<String>,
    pub prompt: Option<String>,
    pub profile: Option<ProviderProfile>,
    pub cancel: CancellationToken,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OcrResult {
    pub text: String,
}

#[async_trait]
pub trait SttProvider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;
    fn status(&self) -> ProviderStatus;
    async fn transcribe(&self, req: SttRequest) -> Result<SttResult>;
    /// Preload the backend without transcribing. Failures are status-level.
    async fn warmup(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;
    fn status(&self) -> ProviderStatus;
    async fn respond(&self, req: LlmRequest) -> Result<LlmResult>;
}

#[async_trait]
pub trait OcrProvider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;
    fn status(&self) -> ProviderStatus;
    async fn extract_text(&self, req: OcrRequest) -> Result<OcrResult>;
}

#[derive(Clone)]
pub enum ProviderHandle {
    Stt(Arc<dyn SttProvider>),
    Llm(Arc<dyn LlmProvider>),
    Ocr(Arc<dyn OcrProvider>),
}

impl ProviderHandle {
    pub fn descriptor(&self) -> &ProviderDescriptor {
        match self {
            ProviderHandle::Stt(p) => p.descriptor(),
            ProviderHandle::Llm(p) => p.descriptor(),
            ProviderHandle::Ocr(p) => p.descriptor(),
        }
    }

    pub fn status(&self) -> ProviderStatus {
        match self {
            ProviderHandle::Stt(p) => p.status(),
            ProviderHandle::Llm(p) => p.status(),
            ProviderHandle::Ocr(p) => p.status(),
        }
    }
}

/// In-memory catalog of provider implementations keyed by descriptor id.
/// No persistence of its own; install state and profiles live elsewhere.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    inner: Arc<Mutex<HashMap<String, ProviderHandle>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last registration wins on id collision.
    pub fn register(&self, handle: ProviderHandle) {
        let id = handle.descriptor().id.clone();
        self.inner.lock().unwrap().insert(id, handle);
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.inner.lock().unwrap().remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<ProviderHandle> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    // The typed getters trust the descriptor's capability tag, never the
    // shape of the registered object.
    pub fn get_stt(&self, id: &str) -> Option<Arc<dyn SttProvider>> {
        let h = self.get(id)?;
        if h.descriptor().capability != Capability::Stt {
            return None;
        }
        match h {
            ProviderHandle::Stt(p) => Some(p),
            _ => None,
        }
    }

    pub fn get_llm(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        let h = self.get(id)?;
        if h.descriptor().capability != Capability::Llm {
            return None;
        }
        match h {
            ProviderHandle::Llm(p) => Some(p),
            _ => None,
        }
    }

    pub fn get_ocr(&self, id: &str) -> Option<Arc<dyn OcrProvider>> {
        let h = self.get(id)?;
        if h.descriptor().capability != Capability::Ocr {
            return None;
        }
        match h {
            ProviderHandle::Ocr(p) => Some(p),
            _ => None,
        }
    }

    /// Descriptors only, sorted by display name (plain byte order).
    pub fn list(&self, capability: Option<Capability>) -> Vec<ProviderDescriptor> {
        let mut out: Vec<ProviderDescriptor> = self
            .inner
            .lock()
            .unwrap()
            .values()
            .map(|h| h.descriptor().clone())
            .filter(|d| capability.map(|c| d.capability == c).unwrap_or(true))
            .collect();
        out.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        out
    }

    pub fn status_of(&self, id: &str) -> Option<ProviderStatus> {
        self.get(id).map(|h| h.status())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct FixedStt {
        pub descriptor: ProviderDescriptor,
        pub reply: String,
    }

    #[async_trait]
    impl SttProvider for FixedStt {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.descriptor
        }

        fn status(&self) -> ProviderStatus {
            ProviderStatus::ready()
        }

        async fn transcribe(&self, _req: SttRequest) -> Result<SttResult> {
            Ok(SttResult {
                text: self.reply.clone(),
            })
        }
    }

    pub(crate) fn stt_descriptor(id: &str, display_name: &str) -> ProviderDescriptor {
        ProviderDescriptor {
            id: id.to_string(),
            capability: Capability::Stt,
            display_name: display_name.to_string(),
            kind: ProviderKind::Local,
            requires_install: false,
            supports_local_path: false,
        }
    }

    pub(crate) fn fixed_stt(id: &str, display_name: &str, reply: &str) -> ProviderHandle {
        ProviderHandle::Stt(Arc::new(FixedStt {
            descriptor: stt_descriptor(id, display_name),
            reply: reply.to_string(),
        }))
    }

    #[test]
    fn register_overwrites_on_id_collision() {
        let reg = ProviderRegistry::new();
        reg.register(fixed_stt("dup", "First", "one"));
        reg.register(fixed_stt("dup", "Second", "two"));
        let list = reg.list(None);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].display_name, "Second");
    }

    #[test]
    fn typed_getter_rejects_capability_mismatch() {
        let reg = ProviderRegistry::new();
        // Registered through the STT arm but tagged llm: the descriptor wins.
        let mut mislabeled = stt_descriptor("weird", "Weird");
        mislabeled.capability = Capability::Llm;
        reg.register(ProviderHandle::Stt(Arc::new(FixedStt {
            descriptor: mislabeled,
            reply: String::new(),
        })));

        assert!(reg.get("weird").is_some(), "untyped get still finds it");
        assert!(reg.get_stt("weird").is_none(), "stt getter rejects llm tag");
        assert!(reg.get_llm("weird").is_none(), "llm getter rejects stt shape");
    }

    #[test]
    fn absent_id_is_none_not_error() {
        let reg = ProviderRegistry::new();
        assert!(reg.get("nope").is_none());
        assert!(reg.get_stt("nope").is_none());
        assert!(reg.status_of("nope").is_none());
    }

    #[test]
    fn list_sorts_by_display_name_and_filters_by_capability() {
        let reg = ProviderRegistry::new();
        reg.register(fixed_stt("b", "Bravo", ""));
        reg.register(fixed_stt("a", "Alpha", ""));
        reg.register(fixed_stt("c", "Charlie", ""));
        let names: Vec<String> = reg
            .list(Some(Capability::Stt))
            .into_iter()
            .map(|d| d.display_name)
            .collect();
        assert_eq!(names, vec!["Alpha", "Bravo", "Charlie"]);
        assert!(reg.list(Some(Capability::Ocr)).is_empty());
    }

    #[test]
    fn unregister_removes_the_entry() {
        let reg = ProviderRegistry::new();
        reg.register(fixed_stt("x", "X", ""));
        assert!(reg.unregister("x"));
        assert!(!reg.unregister("x"));
        assert!(reg.get("x").is_none());
    }
}
