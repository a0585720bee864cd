use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::{fsio, trace};

const KEYCHAIN_SERVICE: &str = "voxtray";

pub const SECRET_REF_LLM_API_KEY: &str = "providers.llm.openai_compatible.api_key";
pub const SECRET_REF_STT_API_KEY: &str = "providers.stt.whisper_http.api_key";
pub const SECRET_REF_OCR_API_KEY: &str = "providers.ocr.vision_llm.api_key";

// First entry of each group is the canonical ref; the rest are legacy names
// still present in configs written by older releases.
const ALIAS_GROUPS: &[&[&str]] = &[
    &[SECRET_REF_LLM_API_KEY, "llm.openai.api_key", "llm.api_key"],
    &[SECRET_REF_STT_API_KEY, "stt.remote.api_key"],
    &[SECRET_REF_OCR_API_KEY, "ocr.vision.api_key"],
];

pub fn canonical_secret_ref(secret_ref: &str) -> String {
    for group in ALIAS_GROUPS {
        if group.iter().any(|r| *r == secret_ref) {
            return group[0].to_string();
        }
    }
    secret_ref.to_string()
}

/// All names a value might be stored under, starting with the ref itself.
pub fn alias_group(secret_ref: &str) -> Vec<String> {
    let mut out = vec![secret_ref.to_string()];
    for group in ALIAS_GROUPS {
        if group.iter().any(|r| *r == secret_ref) {
            for r in group.iter() {
                if *r != secret_ref {
                    out.push(r.to_string());
                }
            }
        }
    }
    out
}

/// Canonical refs a provider is expected to keep its credential under when
/// the profile does not name one explicitly.
pub fn default_secret_refs(provider_id: &str) -> Vec<String> {
    match provider_id {
        "openai_compatible" => vec![SECRET_REF_LLM_API_KEY.to_string()],
        "whisper_http" => vec![SECRET_REF_STT_API_KEY.to_string()],
        "vision_llm" => vec![SECRET_REF_OCR_API_KEY.to_string()],
        other => vec![format!("providers.{other}.api_key")],
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SecretWriteOutcome {
    pub backend: String, // keychain|plaintext
    pub degraded: bool,  // true when keychain was attempted and failed
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecretStatus {
    pub configured: bool,
    pub backend: String, // keychain|plaintext|none
    pub reason: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct SecretQuery {
    pub provider_id: String,
    pub secret_ref: Option<String>,
    pub extra_refs: Vec<String>,
    pub env_var_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SecretsService {
    data_dir: PathBuf,
    use_keychain: bool,
}

impl SecretsService {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            use_keychain: true,
        }
    }

    /// Skip the OS keychain entirely. Used by headless runs and tests where
    /// no secret service is available.
    pub fn plaintext_only(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            use_keychain: false,
        }
    }

    fn fallback_path(&self) -> PathBuf {
        self.data_dir.join("secrets-fallback.json")
    }

    fn load_fallback(&self) -> BTreeMap<String, String> {
        let p = self.fallback_path();
        let Ok(s) = std::fs::read_to_string(&p) else {
            return BTreeMap::new();
        };
        serde_json::from_str(&s).unwrap_or_default()
    }

    fn save_fallback(&self, map: &BTreeMap<String, String>) -> Result<()> {
        fsio::write_json_pretty(&self.fallback_path(), map)
            .context("write secrets-fallback.json failed")
    }

    fn keychain_get(&self, secret_ref: &str) -> Result<String> {
        let entry = keyring::Entry::new(KEYCHAIN_SERVICE, secret_ref)
            .map_err(|e| anyhow::anyhow!("keyring entry init failed: {e:?}"))?;
        entry
            .get_password()
            .map_err(|e| anyhow::anyhow!("keyring get failed: {e:?}"))
    }

    fn note_plaintext_fallback(&self, secret_ref: &str, reason: &str) {
        crate::safe_eprintln!("secrets: keychain unavailable for {secret_ref}, using plaintext fallback: {reason}");
        trace::event(
            &self.data_dir,
            None,
            "SecretsService",
            "SECRETS.plaintext_fallback",
            "ok",
            Some(serde_json::json!({"ref": secret_ref, "reason": reason})),
        );
    }

    pub fn set_secret(&self, secret_ref: &str, value: &str) -> Result<SecretWriteOutcome> {
        if self.use_keychain {
            let attempt = keyring::Entry::new(KEYCHAIN_SERVICE, secret_ref)
                .map_err(|e| format!("keyring entry init failed: {e:?}"))
                .and_then(|entry| {
                    entry
                        .set_password(value)
                        .map_err(|e| format!("keyring set failed: {e:?}"))
                });
            match attempt {
                Ok(()) => {
                    return Ok(SecretWriteOutcome {
                        backend: "keychain".to_string(),
                        degraded: false,
                        reason: None,
                    });
                }
                Err(reason) => {
                    self.note_plaintext_fallback(secret_ref, &reason);
                    let mut map = self.load_fallback();
                    map.insert(secret_ref.to_string(), value.to_string());
                    self.save_fallback(&map)?;
                    return Ok(SecretWriteOutcome {
                        backend: "plaintext".to_string(),
                        degraded: true,
                        reason: Some(reason),
                    });
                }
            }
        }
        let mut map = self.load_fallback();
        map.insert(secret_ref.to_string(), value.to_string());
        self.save_fallback(&map)?;
        Ok(SecretWriteOutcome {
            backend: "plaintext".to_string(),
            degraded: false,
            reason: None,
        })
    }

    pub fn get_secret(&self, secret_ref: &str) -> Option<String> {
        if self.use_keychain {
            if let Ok(v) = self.keychain_get(secret_ref) {
                if !v.trim().is_empty() {
                    return Some(v);
                }
            }
        }
        self.load_fallback()
            .get(secret_ref)
            .map(|v| v.to_string())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn delete_secret(&self, secret_ref: &str) -> Result<SecretWriteOutcome> {
        let mut backend = "plaintext".to_string();
        let mut degraded = false;
        let mut reason = None;
        if self.use_keychain {
            // keyring v3 has no cross-platform delete; overwrite with empty
            // and treat empty as "not configured".
            let attempt = keyring::Entry::new(KEYCHAIN_SERVICE, secret_ref)
                .map_err(|e| format!("keyring entry init failed: {e:?}"))
                .and_then(|entry| {
                    entry
                        .set_password("")
                        .map_err(|e| format!("keyring set failed: {e:?}"))
                });
            match attempt {
                Ok(()) => backend = "keychain".to_string(),
                Err(r) => {
                    degraded = true;
                    reason = Some(r);
                }
            }
        }
        let mut map = self.load_fallback();
        if map.remove(secret_ref).is_some() {
            self.save_fallback(&map)?;
        }
        Ok(SecretWriteOutcome {
            backend,
            degraded,
            reason,
        })
    }

    pub fn secret_status(&self, secret_ref: &str) -> SecretStatus {
        if self.use_keychain {
            match self.keychain_get(secret_ref) {
                Ok(v) if !v.trim().is_empty() => {
                    return SecretStatus {
                        configured: true,
                        backend: "keychain".to_string(),
                        reason: None,
                    };
                }
                _ => {}
            }
        }
        let map = self.load_fallback();
        if map
            .get(secret_ref)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
        {
            return SecretStatus {
                configured: true,
                backend: "plaintext".to_string(),
                reason: None,
            };
        }
        SecretStatus {
            configured: false,
            backend: "none".to_string(),
            reason: Some("no stored value".to_string()),
        }
    }

    /// Ordered resolution: explicit ref and its aliases, else the provider's
    /// canonical defaults and their aliases, then extra refs, then env vars.
    /// Returns an empty string when nothing resolves.
    pub fn resolve_secret_value(&self, query: &SecretQuery) -> String {
        let mut candidates: Vec<String> = Vec::new();
        let push_with_aliases = |candidates: &mut Vec<String>, r: &str| {
            for name in alias_group(r) {
                if !candidates.iter().any(|c| c == &name) {
                    candidates.push(name);
                }
            }
        };

        match query
            .secret_ref
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(explicit) => push_with_aliases(&mut candidates, explicit),
            None => {
                for r in default_secret_refs(&query.provider_id) {
                    push_with_aliases(&mut candidates, &r);
                }
            }
        }
        for r in &query.extra_refs {
            push_with_aliases(&mut candidates, r);
        }

        for c in &candidates {
            if let Some(v) = self.get_secret(c) {
                let t = v.trim();
                if !t.is_empty() {
                    return t.to_string();
                }
            }
        }
        for name in &query.env_var_names {
            if let Ok(v) = std::env::var(name) {
                let t = v.trim();
                if !t.is_empty() {
                    return t.to_string();
                }
            }
        }
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn alias_members_share_one_canonical_ref() {
        assert_eq!(
            canonical_secret_ref("llm.openai.api_key"),
            canonical_secret_ref("providers.llm.openai_compatible.api_key")
        );
        assert_eq!(
            canonical_secret_ref("llm.openai.api_key"),
            SECRET_REF_LLM_API_KEY
        );
        // Unknown refs pass through untouched.
        assert_eq!(canonical_secret_ref("custom.key"), "custom.key");
    }

    #[test]
    fn plaintext_roundtrip_and_delete() {
        let td = tempfile::tempdir().expect("tempdir");
        let svc = SecretsService::plaintext_only(td.path());

        let out = svc.set_secret("providers.llm.openai_compatible.api_key", "sk-1").unwrap();
        assert_eq!(out.backend, "plaintext");
        assert!(!out.degraded);
        assert!(td.path().join("secrets-fallback.json").exists());

        assert_eq!(
            svc.get_secret("providers.llm.openai_compatible.api_key").as_deref(),
            Some("sk-1")
        );
        let st = svc.secret_status("providers.llm.openai_compatible.api_key");
        assert!(st.configured);
        assert_eq!(st.backend, "plaintext");

        svc.delete_secret("providers.llm.openai_compatible.api_key").unwrap();
        assert!(svc.get_secret("providers.llm.openai_compatible.api_key").is_none());
        let st = svc.secret_status("providers.llm.openai_compatible.api_key");
        assert!(!st.configured);
        assert_eq!(st.backend, "none");
    }

    #[test]
    fn resolve_finds_value_stored_under_legacy_alias() {
        let td = tempfile::tempdir().expect("tempdir");
        let svc = SecretsService::plaintext_only(td.path());
        svc.set_secret("llm.openai.api_key", "legacy-key").unwrap();

        let v = svc.resolve_secret_value(&SecretQuery {
            provider_id: "openai_compatible".to_string(),
            secret_ref: Some(SECRET_REF_LLM_API_KEY.to_string()),
            ..Default::default()
        });
        assert_eq!(v, "legacy-key");
    }

    #[test]
    fn resolve_prefers_explicit_ref_over_provider_defaults() {
        let td = tempfile::tempdir().expect("tempdir");
        let svc = SecretsService::plaintext_only(td.path());
        svc.set_secret(SECRET_REF_LLM_API_KEY, "default-key").unwrap();
        svc.set_secret("custom.myprofile.key", "profile-key").unwrap();

        let v = svc.resolve_secret_value(&SecretQuery {
            provider_id: "openai_compatible".to_string(),
            secret_ref: Some("custom.myprofile.key".to_string()),
            ..Default::default()
        });
        assert_eq!(v, "profile-key");

        // Without an explicit ref the provider default wins.
        let v = svc.resolve_secret_value(&SecretQuery {
            provider_id: "openai_compatible".to_string(),
            secret_ref: None,
            ..Default::default()
        });
        assert_eq!(v, "default-key");
    }

    #[test]
    fn resolve_falls_through_to_env_then_empty() {
        let _g = env_lock().lock().unwrap();
        let td = tempfile::tempdir().expect("tempdir");
        let svc = SecretsService::plaintext_only(td.path());

        std::env::remove_var("VOXTRAY_TEST_KEY_A");
        std::env::set_var("VOXTRAY_TEST_KEY_B", "env-key");
        let v = svc.resolve_secret_value(&SecretQuery {
            provider_id: "openai_compatible".to_string(),
            secret_ref: None,
            env_var_names: vec![
                "VOXTRAY_TEST_KEY_A".to_string(),
                "VOXTRAY_TEST_KEY_B".to_string(),
            ],
            ..Default::default()
        });
        assert_eq!(v, "env-key");
        std::env::remove_var("VOXTRAY_TEST_KEY_B");

        let v = svc.resolve_secret_value(&SecretQuery {
            provider_id: "openai_compatible".to_string(),
            ..Default::default()
        });
        assert_eq!(v, "");
    }
}
