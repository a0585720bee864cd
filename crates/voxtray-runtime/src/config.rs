use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    fsio,
    provider::{self, Capability},
    secrets,
    shortcuts::{self, LegacyShortcutFields, ShortcutDefinition},
};

pub const CONFIG_VERSION: u32 = 3;

pub const CONFIG_RESET_NOTICE: &str =
    "configuration version mismatch: settings were reset to defaults";
pub const CONFIG_UNREADABLE_NOTICE: &str =
    "configuration could not be read: settings were reset to defaults";

// Top-level config.json keys that may change without a full runtime restart.
// `hot_reloadable` below gates on this list; keep it in sync with the
// serialized field names (see the drift test at the bottom).
pub const HOT_RELOAD_KEYS: &[&str] = &["shortcuts", "hotkey", "holdToTalk", "assistantShortcuts"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProfile {
    pub id: String,
    pub provider_id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

impl ProviderProfile {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CapabilityConfig {
    pub active_provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_profile_id: Option<String>,
    pub profiles: Vec<ProviderProfile>,
}

impl CapabilityConfig {
    /// Profile referenced by `active_profile_id`, required to belong to the
    /// active provider. `None` is a valid state callers must handle.
    pub fn active_profile(&self) -> Option<&ProviderProfile> {
        let id = self.active_profile_id.as_deref()?;
        self.profiles
            .iter()
            .find(|p| p.id == id && p.provider_id == self.active_provider_id)
    }

    fn active_profile_mut(&mut self) -> Option<&mut ProviderProfile> {
        let id = self.active_profile_id.clone()?;
        let active = self.active_provider_id.clone();
        self.profiles
            .iter_mut()
            .find(|p| p.id == id && p.provider_id == active)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub stt: CapabilityConfig,
    pub llm: CapabilityConfig,
    pub ocr: CapabilityConfig,
}

impl ProvidersConfig {
    pub fn get(&self, cap: Capability) -> &CapabilityConfig {
        match cap {
            Capability::Stt => &self.stt,
            Capability::Llm => &self.llm,
            Capability::Ocr => &self.ocr,
        }
    }

    pub fn get_mut(&mut self, cap: Capability) -> &mut CapabilityConfig {
        match cap {
            Capability::Stt => &mut self.stt,
            Capability::Llm => &mut self.llm,
            Capability::Ocr => &mut self.ocr,
        }
    }
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    4765
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RuntimeApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    pub auth_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token_ref: Option<String>,
}

impl Default for RuntimeApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_api_host(),
            port: default_api_port(),
            socket_path: None,
            auth_required: false,
            auth_token_ref: None,
        }
    }
}

fn default_download_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct InstallerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
    pub download_timeout_secs: u64,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            install_root: None,
            manifest_url: None,
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SecretsConfig {
    pub prefer_keychain: bool,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            prefer_keychain: true,
        }
    }
}

/// Last values derived for the legacy flat fields. Comparing the raw flat
/// fields against this snapshot tells apart "user edited the legacy field"
/// from "field still holds what we derived last time".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct LegacySeen {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asr_engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RuntimeConfig {
    pub config_version: u32,
    pub providers: ProvidersConfig,
    pub runtime_api: RuntimeApiConfig,
    pub installer: InstallerConfig,
    pub secrets: SecretsConfig,
    pub shortcuts: Vec<ShortcutDefinition>,

    // Legacy flat fields older code paths still read; derived from the
    // active profiles on every normalize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asr_engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_seen: Option<LegacySeen>,

    // Pre-ShortcutDefinition keys, consumed by migration and then stripped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hotkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_to_talk: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_shortcuts: Option<Vec<shortcuts::LegacyAssistantShortcut>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

impl RuntimeConfig {
    pub fn capability(&self, cap: Capability) -> &CapabilityConfig {
        self.providers.get(cap)
    }

    pub fn active_profile(&self, cap: Capability) -> Option<&ProviderProfile> {
        self.providers.get(cap).active_profile()
    }
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}

fn default_provider_id(cap: Capability) -> &'static str {
    match cap {
        Capability::Stt => provider::PROVIDER_STT_WHISPER_CLI,
        Capability::Llm => provider::PROVIDER_LLM_OPENAI_COMPATIBLE,
        Capability::Ocr => provider::PROVIDER_OCR_TESSERACT_CLI,
    }
}

fn provider_needs_secret(provider_id: &str) -> bool {
    matches!(
        provider_id,
        provider::PROVIDER_STT_WHISPER_HTTP
            | provider::PROVIDER_LLM_OPENAI_COMPATIBLE
            | provider::PROVIDER_OCR_VISION_LLM
    )
}

fn default_profile(provider_id: &str) -> ProviderProfile {
    let mut options = serde_json::Map::new();
    let (label, model) = match provider_id {
        provider::PROVIDER_STT_WHISPER_CLI => {
            options.insert("engine".to_string(), Value::from("faster-whisper"));
            ("Local Whisper", None)
        }
        provider::PROVIDER_STT_WHISPER_HTTP => ("Remote Whisper", None),
        provider::PROVIDER_LLM_OPENAI_COMPATIBLE => {
            ("OpenAI Compatible", Some("gpt-4o-mini".to_string()))
        }
        provider::PROVIDER_OCR_TESSERACT_CLI => ("Tesseract OCR", None),
        provider::PROVIDER_OCR_VISION_LLM => ("Vision LLM", Some("gpt-4o-mini".to_string())),
        other => (other, None),
    };
    let secret_ref = if provider_needs_secret(provider_id) {
        secrets::default_secret_refs(provider_id).into_iter().next()
    } else {
        None
    };
    ProviderProfile {
        id: format!("{provider_id}_default"),
        provider_id: provider_id.to_string(),
        label: label.to_string(),
        endpoint: None,
        model,
        language: None,
        local_path: None,
        options,
        secret_ref,
    }
}

fn normalize_capability(cc: &mut CapabilityConfig, cap: Capability) {
    if cc.active_provider_id.trim().is_empty() {
        cc.active_provider_id = default_provider_id(cap).to_string();
    }

    // Every capability keeps at least one profile for its active provider,
    // and active_profile_id must point at a profile of the active provider.
    let has_match = cc
        .profiles
        .iter()
        .any(|p| p.provider_id == cc.active_provider_id);
    if !has_match {
        let seeded = default_profile(&cc.active_provider_id);
        cc.profiles.push(seeded);
    }
    let valid_active = cc
        .active_profile_id
        .as_deref()
        .map(|id| {
            cc.profiles
                .iter()
                .any(|p| p.id == id && p.provider_id == cc.active_provider_id)
        })
        .unwrap_or(false);
    if !valid_active {
        cc.active_profile_id = cc
            .profiles
            .iter()
            .find(|p| p.provider_id == cc.active_provider_id)
            .map(|p| p.id.clone());
    }

    for p in cc.profiles.iter_mut() {
        if let Some(r) = p.secret_ref.as_deref() {
            let canonical = secrets::canonical_secret_ref(r);
            if canonical != r {
                p.secret_ref = Some(canonical);
            }
        }
        if p.secret_ref.is_none() && provider_needs_secret(&p.provider_id) {
            p.secret_ref = secrets::default_secret_refs(&p.provider_id).into_iter().next();
        }
    }
}

fn flat_field_changed(raw: &Option<String>, seen: &Option<String>) -> bool {
    match raw.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => seen.as_deref().map(str::trim) != Some(v),
        _ => false,
    }
}

/// Push freshly-edited legacy flat fields into the active profiles. A flat
/// field equal to what we derived last time never overwrites the profile.
fn apply_legacy_overrides(cfg: &mut RuntimeConfig) {
    let seen = cfg.legacy_seen.clone().unwrap_or_default();

    if let Some(p) = cfg.providers.stt.active_profile_mut() {
        if flat_field_changed(&cfg.asr_engine, &seen.asr_engine) {
            if let Some(v) = cfg.asr_engine.as_deref() {
                p.options
                    .insert("engine".to_string(), Value::from(v.trim()));
            }
        }
        if flat_field_changed(&cfg.model, &seen.model) {
            p.model = cfg.model.as_deref().map(|v| v.trim().to_string());
        }
    }

    if let Some(p) = cfg.providers.llm.active_profile_mut() {
        if flat_field_changed(&cfg.llm_endpoint, &seen.llm_endpoint) {
            p.endpoint = cfg.llm_endpoint.as_deref().map(|v| v.trim().to_string());
        }
        if flat_field_changed(&cfg.llm_model, &seen.llm_model) {
            p.model = cfg.llm_model.as_deref().map(|v| v.trim().to_string());
        }
        if flat_field_changed(&cfg.assistant_name, &seen.assistant_name) {
            if let Some(v) = cfg.assistant_name.as_deref() {
                p.options
                    .insert("assistantName".to_string(), Value::from(v.trim()));
            }
        }
        if flat_field_changed(&cfg.llm_system_prompt, &seen.llm_system_prompt) {
            if let Some(v) = cfg.llm_system_prompt.as_deref() {
                p.options
                    .insert("systemPrompt".to_string(), Value::from(v.trim()));
            }
        }
    }
}

/// Recompute the legacy flat fields from the active profiles and remember
/// the derived values in `legacy_seen`.
fn derive_legacy_fields(cfg: &mut RuntimeConfig) {
    let (asr_engine, model) = match cfg.providers.stt.active_profile() {
        Some(p) => (
            p.option_str("engine")
                .map(|s| s.to_string())
                .or_else(|| Some(p.provider_id.clone())),
            p.model.clone(),
        ),
        None => (Some(cfg.providers.stt.active_provider_id.clone()), None),
    };
    let (llm_endpoint, llm_model, assistant_name, llm_system_prompt) =
        match cfg.providers.llm.active_profile() {
            Some(p) => (
                p.endpoint.clone(),
                p.model.clone(),
                p.option_str("assistantName").map(|s| s.to_string()),
                p.option_str("systemPrompt").map(|s| s.to_string()),
            ),
            None => (None, None, None, None),
        };

    cfg.asr_engine = asr_engine;
    cfg.model = model;
    cfg.llm_endpoint = llm_endpoint;
    cfg.llm_model = llm_model;
    cfg.assistant_name = assistant_name;
    cfg.llm_system_prompt = llm_system_prompt;
    cfg.legacy_seen = Some(LegacySeen {
        asr_engine: cfg.asr_engine.clone(),
        model: cfg.model.clone(),
        llm_endpoint: cfg.llm_endpoint.clone(),
        llm_model: cfg.llm_model.clone(),
        assistant_name: cfg.assistant_name.clone(),
        llm_system_prompt: cfg.llm_system_prompt.clone(),
    });
}

/// Single entry point for config hygiene. Order matters: version gate,
/// seed actives/profiles, canonicalize secret refs, reconcile legacy flat
/// fields (push changed values in, then re-derive), migrate shortcuts.
pub fn normalize_runtime_config(mut cfg: RuntimeConfig) -> RuntimeConfig {
    // A document from a different schema generation is reset wholesale.
    // Documents without a version (pre-versioning or brand new) are
    // normalized incrementally instead.
    if cfg.config_version != 0 && cfg.config_version != CONFIG_VERSION {
        cfg = RuntimeConfig {
            notice: Some(CONFIG_RESET_NOTICE.to_string()),
            ..RuntimeConfig::default()
        };
    }
    cfg.config_version = CONFIG_VERSION;

    for cap in Capability::ALL {
        normalize_capability(cfg.providers.get_mut(cap), cap);
    }

    apply_legacy_overrides(&mut cfg);
    derive_legacy_fields(&mut cfg);

    let legacy = LegacyShortcutFields {
        hotkey: cfg.hotkey.take(),
        hold_to_talk: cfg.hold_to_talk.take(),
        assistant_shortcuts: cfg.assistant_shortcuts.take(),
    };
    cfg.shortcuts = shortcuts::normalize_shortcut_config(std::mem::take(&mut cfg.shortcuts), legacy);
    if cfg.shortcuts.is_empty() {
        cfg.shortcuts = shortcuts::default_shortcuts();
    }

    cfg
}

pub fn load_runtime_config(path: &Path) -> Result<RuntimeConfig> {
    if !path.exists() {
        let cfg = normalize_runtime_config(RuntimeConfig::default());
        save_runtime_config(path, &cfg)?;
        return Ok(cfg);
    }
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read config failed: {}", path.display()))?;
    // Unparseable text (a truncated write) and a document of the wrong shape
    // reset the same way; Null never decodes, so it funnels into the arm
    // below and the rewrite check replaces the broken file.
    let raw: Value = serde_json::from_str(&s).unwrap_or(Value::Null);
    let parsed: RuntimeConfig = match serde_json::from_value(raw.clone()) {
        Ok(c) => c,
        Err(_) => RuntimeConfig {
            notice: Some(CONFIG_UNREADABLE_NOTICE.to_string()),
            ..RuntimeConfig::default()
        },
    };
    let cfg = normalize_runtime_config(parsed);
    let normalized = serde_json::to_value(&cfg).context("serialize config failed")?;
    if normalized != raw {
        save_runtime_config(path, &cfg)?;
    }
    Ok(cfg)
}

pub fn save_runtime_config(path: &Path, cfg: &RuntimeConfig) -> Result<()> {
    fsio::write_json_pretty(path, cfg).context("write config.json failed")
}

/// True when every top-level key that differs between the two serialized
/// documents is on the hot-reload allow-list.
pub fn hot_reloadable(old: &RuntimeConfig, new: &RuntimeConfig) -> bool {
    let (Ok(a), Ok(b)) = (serde_json::to_value(old), serde_json::to_value(new)) else {
        return false;
    };
    let (Value::Object(a), Value::Object(b)) = (a, b) else {
        return false;
    };
    let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
    keys.sort();
    keys.dedup();
    keys.into_iter()
        .filter(|k| a.get(*k) != b.get(*k))
        .all(|k| HOT_RELOAD_KEYS.contains(&k.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{PROVIDER_LLM_OPENAI_COMPATIBLE, PROVIDER_STT_WHISPER_CLI};
    use crate::shortcuts::ShortcutStep;

    #[test]
    fn version_is_forced_to_current_for_any_input() {
        for raw in [
            RuntimeConfig::default(),
            RuntimeConfig {
                config_version: 1,
                ..RuntimeConfig::default()
            },
            RuntimeConfig {
                config_version: 99,
                ..RuntimeConfig::default()
            },
        ] {
            let cfg = normalize_runtime_config(raw);
            assert_eq!(cfg.config_version, CONFIG_VERSION);
        }
    }

    #[test]
    fn mismatched_version_resets_and_records_notice() {
        let mut raw = RuntimeConfig::default();
        raw.config_version = 2;
        raw.providers.llm.active_provider_id = "something_custom".to_string();
        let cfg = normalize_runtime_config(raw);
        assert_eq!(cfg.notice.as_deref(), Some(CONFIG_RESET_NOTICE));
        assert_eq!(
            cfg.providers.llm.active_provider_id,
            PROVIDER_LLM_OPENAI_COMPATIBLE
        );
    }

    #[test]
    fn seeds_defaults_for_empty_document() {
        let cfg = normalize_runtime_config(RuntimeConfig::default());
        assert!(cfg.notice.is_none());
        assert_eq!(
            cfg.providers.stt.active_provider_id,
            PROVIDER_STT_WHISPER_CLI
        );
        for cap in Capability::ALL {
            let cc = cfg.capability(cap);
            assert!(!cc.profiles.is_empty(), "{cap:?} has a default profile");
            assert!(cc.active_profile().is_some(), "{cap:?} active profile set");
        }
        // The default LLM profile names its canonical secret ref.
        let llm = cfg.active_profile(Capability::Llm).unwrap();
        assert_eq!(
            llm.secret_ref.as_deref(),
            Some(secrets::SECRET_REF_LLM_API_KEY)
        );
        assert!(!cfg.shortcuts.is_empty());
    }

    #[test]
    fn repairs_active_profile_provider_mismatch() {
        let mut raw = RuntimeConfig::default();
        raw.providers.llm.active_provider_id = PROVIDER_LLM_OPENAI_COMPATIBLE.to_string();
        raw.providers.llm.profiles = vec![
            ProviderProfile {
                id: "other".to_string(),
                provider_id: "some_other_llm".to_string(),
                label: "Other".to_string(),
                ..Default::default()
            },
            ProviderProfile {
                id: "mine".to_string(),
                provider_id: PROVIDER_LLM_OPENAI_COMPATIBLE.to_string(),
                label: "Mine".to_string(),
                ..Default::default()
            },
        ];
        // Points at a profile of a different provider.
        raw.providers.llm.active_profile_id = Some("other".to_string());
        let cfg = normalize_runtime_config(raw);
        assert_eq!(cfg.providers.llm.active_profile_id.as_deref(), Some("mine"));
    }

    #[test]
    fn legacy_secret_refs_are_canonicalized() {
        let mut raw = RuntimeConfig::default();
        raw.providers.llm.profiles = vec![ProviderProfile {
            id: "p1".to_string(),
            provider_id: PROVIDER_LLM_OPENAI_COMPATIBLE.to_string(),
            label: "P1".to_string(),
            secret_ref: Some("llm.openai.api_key".to_string()),
            ..Default::default()
        }];
        let cfg = normalize_runtime_config(raw);
        assert_eq!(
            cfg.providers.llm.profiles[0].secret_ref.as_deref(),
            Some(secrets::SECRET_REF_LLM_API_KEY)
        );
    }

    #[test]
    fn unchanged_legacy_fields_do_not_clobber_profile() {
        // First pass: user customized the profile through the structured UI.
        let mut cfg = normalize_runtime_config(RuntimeConfig::default());
        {
            let id = cfg.providers.llm.active_profile_id.clone().unwrap();
            let p = cfg
                .providers
                .llm
                .profiles
                .iter_mut()
                .find(|p| p.id == id)
                .unwrap();
            p.endpoint = Some("http://customized:9999".to_string());
            p.model = Some("my-model".to_string());
        }
        let cfg = normalize_runtime_config(cfg);
        assert_eq!(
            cfg.llm_endpoint.as_deref(),
            Some("http://customized:9999"),
            "derive step mirrors the profile"
        );

        // Second pass with the same (derived, unchanged) flat fields.
        let again = normalize_runtime_config(cfg.clone());
        let p = again.active_profile(Capability::Llm).unwrap();
        assert_eq!(p.endpoint.as_deref(), Some("http://customized:9999"));
        assert_eq!(p.model.as_deref(), Some("my-model"));
    }

    #[test]
    fn changed_legacy_endpoint_propagates_into_profile() {
        let mut cfg = normalize_runtime_config(RuntimeConfig::default());
        // Simulate an old code path editing only the flat field.
        cfg.llm_endpoint = Some("http://edited:1234".to_string());
        let cfg = normalize_runtime_config(cfg);
        let p = cfg.active_profile(Capability::Llm).unwrap();
        assert_eq!(p.endpoint.as_deref(), Some("http://edited:1234"));
        // And the derived flat field agrees.
        assert_eq!(cfg.llm_endpoint.as_deref(), Some("http://edited:1234"));
    }

    #[test]
    fn legacy_system_prompt_lands_in_profile_options() {
        let mut cfg = normalize_runtime_config(RuntimeConfig::default());
        cfg.llm_system_prompt = Some("You are terse.".to_string());
        cfg.assistant_name = Some("Scribe".to_string());
        let cfg = normalize_runtime_config(cfg);
        let p = cfg.active_profile(Capability::Llm).unwrap();
        assert_eq!(p.option_str("systemPrompt"), Some("You are terse."));
        assert_eq!(p.option_str("assistantName"), Some("Scribe"));
    }

    #[test]
    fn load_writes_back_only_when_normalization_changed_the_document() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = config_path(td.path());
        let cfg = load_runtime_config(&p).expect("first load seeds file");
        assert!(p.exists());

        // A persisted normalized document must round-trip unchanged, which
        // is what makes the second load skip the rewrite.
        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(&p).unwrap()).unwrap();
        let renorm =
            normalize_runtime_config(serde_json::from_value(raw.clone()).unwrap());
        assert_eq!(serde_json::to_value(&renorm).unwrap(), raw);

        let before = std::fs::metadata(&p).unwrap().modified().unwrap();
        let cfg2 = load_runtime_config(&p).expect("second load");
        assert_eq!(cfg, cfg2);
        let after = std::fs::metadata(&p).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn unreadable_typed_document_resets_with_notice() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = config_path(td.path());
        std::fs::write(&p, r#"{"providers": 42}"#).unwrap();
        let cfg = load_runtime_config(&p).expect("load");
        assert_eq!(cfg.notice.as_deref(), Some(CONFIG_UNREADABLE_NOTICE));
        assert_eq!(cfg.config_version, CONFIG_VERSION);
    }

    #[test]
    fn truncated_document_resets_with_notice_and_replaces_the_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = config_path(td.path());
        // The tail of an interrupted write: syntactically invalid JSON.
        std::fs::write(&p, r#"{"configVersion": 3, "provi"#).unwrap();
        let cfg = load_runtime_config(&p).expect("load");
        assert_eq!(cfg.notice.as_deref(), Some(CONFIG_UNREADABLE_NOTICE));
        assert_eq!(cfg.config_version, CONFIG_VERSION);

        // The broken file was replaced by the reset document.
        let rewritten: RuntimeConfig =
            serde_json::from_str(&std::fs::read_to_string(&p).unwrap()).unwrap();
        assert_eq!(rewritten.config_version, CONFIG_VERSION);
    }

    #[test]
    fn hot_reload_allows_shortcut_only_changes() {
        let base = normalize_runtime_config(RuntimeConfig::default());
        let mut shortcut_change = base.clone();
        shortcut_change.shortcuts = vec![ShortcutDefinition {
            id: "x".to_string(),
            label: "X".to_string(),
            enabled: true,
            shortcut: "F9".to_string(),
            steps: vec![ShortcutStep::RecordToggle, ShortcutStep::OutputText { mode: None }],
        }];
        assert!(hot_reloadable(&base, &shortcut_change));

        let mut provider_change = base.clone();
        provider_change.providers.llm.active_provider_id = "elsewhere".to_string();
        assert!(!hot_reloadable(&base, &provider_change));
    }

    #[test]
    fn hot_reload_allow_list_matches_serialized_key_names() {
        // Every allow-listed key must be a key this struct can actually
        // serialize, otherwise the list has drifted.
        let mut cfg = normalize_runtime_config(RuntimeConfig::default());
        cfg.hotkey = Some("F9".to_string());
        cfg.hold_to_talk = Some(true);
        cfg.assistant_shortcuts = Some(vec![]);
        let v = serde_json::to_value(&cfg).unwrap();
        let obj = v.as_object().unwrap();
        for key in HOT_RELOAD_KEYS {
            assert!(
                obj.contains_key(*key),
                "allow-listed key {key} is not a serialized top-level field"
            );
        }
    }
}
