use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde_json::Value;

use crate::{
    llm_chat::{error_body_excerpt, extract_text, is_local_endpoint, resolve_llm_endpoint},
    provider::{
        provider_err, Capability, OcrProvider, OcrRequest, OcrResult, ProviderDescriptor,
        ProviderKind, ProviderStatus, PROVIDER_OCR_VISION_LLM,
    },
    secrets::{SecretQuery, SecretsService},
};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT_SECS: u64 = 90;
const DEFAULT_PROMPT: &str =
    "Extract all text from this image. Output only the extracted text, nothing else.";
const OCR_KEY_ENV_VARS: &[&str] = &["VOXTRAY_OCR_API_KEY"];

pub struct VisionLlmProvider {
    descriptor: ProviderDescriptor,
    client: Client,
    secrets: Arc<SecretsService>,
}

impl VisionLlmProvider {
    pub fn new(secrets: Arc<SecretsService>) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: PROVIDER_OCR_VISION_LLM.to_string(),
                capability: Capability::Ocr,
                display_name: "Vision LLM".to_string(),
                kind: ProviderKind::Remote,
                requires_install: false,
                supports_local_path: false,
            },
            client: Client::new(),
            secrets,
        }
    }

    fn resolve_key(&self, secret_ref: Option<String>) -> String {
        self.secrets.resolve_secret_value(&SecretQuery {
            provider_id: self.descriptor.id.clone(),
            secret_ref,
            env_var_names: OCR_KEY_ENV_VARS.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl OcrProvider for VisionLlmProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn status(&self) -> ProviderStatus {
        let key = self.resolve_key(None);
        let mut st = ProviderStatus::ready();
        st.detail = Some(serde_json::json!({ "apiKeyConfigured": !key.is_empty() }));
        st
    }

    async fn extract_text(&self, req: OcrRequest) -> Result<OcrResult> {
        let profile = req.profile.as_ref();
        // Same host rules as the chat provider; only the path differs because
        // multimodal image content rides the chat-completions shape.
        let resolved =
            resolve_llm_endpoint(profile.and_then(|p| p.endpoint.as_deref()).unwrap_or(""));
        let endpoint = format!("{}/v1/chat/completions", resolved.host);
        let model = profile
            .and_then(|p| p.model.as_deref())
            .unwrap_or(DEFAULT_MODEL);

        let key = self.resolve_key(profile.and_then(|p| p.secret_ref.clone()));
        if key.is_empty() && !is_local_endpoint(&resolved.host) {
            return Err(provider_err(
                "E_API_KEY_MISSING",
                format!("{} requires an API key and none was resolved", resolved.host),
            ));
        }

        let bytes = match (&req.image, &req.image_path) {
            (Some(b), _) => b.clone(),
            (None, Some(p)) => tokio::fs::read(p)
                .await
                .with_context(|| format!("read image failed: {}", p.display()))?,
            (None, None) => {
                return Err(anyhow!(
                    "ocr request carries neither image_path nor image bytes"
                ));
            }
        };
        let data_url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&bytes)
        );

        let prompt = req
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| profile.and_then(|p| p.option_str("prompt")))
            .unwrap_or(DEFAULT_PROMPT);
        let mut user_text = prompt.to_string();
        if let Some(lang) = req
            .language_hint
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            user_text.push_str(&format!(" The text is primarily in: {lang}."));
        }

        let body = serde_json::json!({
            "model": model,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": user_text },
                        { "type": "image_url", "image_url": { "url": data_url } }
                    ]
                }
            ]
        });

        let mut http = self.client.post(&endpoint).json(&body);
        if !key.is_empty() {
            http = http.bearer_auth(&key);
        }

        let timeout_secs = req.timeout_secs.unwrap_or_else(|| {
            profile
                .and_then(|p| p.options.get("timeoutSecs"))
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_TIMEOUT_SECS)
        });
        let fut = async move {
            let resp = http.send().await.context("vision ocr request failed")?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(provider_err(
                    &format!("E_HTTP_STATUS_{}", status.as_u16()),
                    error_body_excerpt(&body),
                ));
            }
            let v: Value = resp.json().await.context("vision ocr response parse failed")?;
            extract_text(&v)
                .ok_or_else(|| provider_err("E_EMPTY_TEXT", "vision ocr returned no text"))
        };

        // The select drops the in-flight request on cancel or expiry, which
        // aborts it rather than leaving it running unobserved.
        let text = tokio::select! {
            _ = req.cancel.cancelled() => {
                return Err(provider_err("E_CANCELLED", "ocr cancelled"));
            }
            r = tokio::time::timeout(Duration::from_secs(timeout_secs), fut) => match r {
                Ok(v) => v?,
                Err(_) => {
                    return Err(provider_err(
                        "E_TIMEOUT",
                        format!("vision ocr request exceeded {timeout_secs}s"),
                    ));
                }
            },
        };

        Ok(OcrResult { text })
    }
}
