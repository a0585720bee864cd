use std::{net::IpAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    provider::{
        provider_err, Capability, LlmProvider, LlmRequest, LlmResult, ProviderDescriptor,
        ProviderKind, ProviderStatus, PROVIDER_LLM_OPENAI_COMPATIBLE,
    },
    secrets::{SecretQuery, SecretsService},
};

pub const DEFAULT_LLM_HOST: &str = "https://api.openai.com";
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const LLM_KEY_ENV_VARS: &[&str] = &["VOXTRAY_LLM_API_KEY", "OPENAI_API_KEY"];

fn host_of(raw: &str) -> String {
    let t = raw.trim();
    let rest = match t.find("://") {
        Some(i) => &t[i + 3..],
        None => t,
    };
    let rest = rest.split('/').next().unwrap_or("");
    let rest = rest.split('?').next().unwrap_or("");
    let rest = rest.rsplit('@').next().unwrap_or("");
    if let Some(stripped) = rest.strip_prefix('[') {
        return stripped.split(']').next().unwrap_or("").to_string();
    }
    // More than one colon means a bare IPv6 literal, not host:port.
    if rest.matches(':').count() > 1 {
        return rest.to_string();
    }
    match rest.rsplit_once(':') {
        Some((h, p)) if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => h.to_string(),
        _ => rest.to_string(),
    }
}

/// Hosts that may be called without credentials: loopback, private and
/// link-local ranges, and the common LAN name suffixes.
pub fn is_local_endpoint(raw: &str) -> bool {
    let host = host_of(raw).to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    if host == "localhost" {
        return true;
    }
    if host.ends_with(".local") || host.ends_with(".lan") || host.ends_with(".home") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => v6.is_loopback(),
        Err(_) => false,
    }
}

/// Reduce whatever the user pasted (full endpoint, host with path, trailing
/// slash) to `scheme://host[:port]`, or a bare `host[:port]` when no scheme
/// was given. Empty input stays empty.
pub fn normalize_llm_host(raw: &str) -> String {
    let t = raw.trim();
    if t.is_empty() {
        return String::new();
    }
    let (scheme, rest) = match t.find("://") {
        Some(i) => (Some(&t[..i]), &t[i + 3..]),
        None => (None, t),
    };
    let authority = rest.split('/').next().unwrap_or("");
    let authority = authority.split('?').next().unwrap_or("");
    if authority.is_empty() {
        return String::new();
    }
    match scheme {
        Some(s) => format!("{s}://{authority}"),
        None => authority.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLlmEndpoint {
    pub host: String,
    pub endpoint: String,
}

/// Canonical Responses API endpoint for a configured host. Scheme defaults
/// to https, except local hosts which get http (local servers rarely carry
/// certificates).
pub fn resolve_llm_endpoint(raw: &str) -> ResolvedLlmEndpoint {
    let mut host = normalize_llm_host(raw);
    if host.is_empty() {
        host = DEFAULT_LLM_HOST.to_string();
    }
    if !host.contains("://") {
        let scheme = if is_local_endpoint(&host) { "http" } else { "https" };
        host = format!("{scheme}://{host}");
    }
    let endpoint = format!("{host}/v1/responses");
    ResolvedLlmEndpoint { host, endpoint }
}

fn match_output_text_string(v: &Value) -> Option<String> {
    v.get("output_text").and_then(Value::as_str).map(str::to_string)
}

fn match_output_text_array(v: &Value) -> Option<String> {
    let arr = v.get("output_text")?.as_array()?;
    let parts: Vec<&str> = arr.iter().filter_map(Value::as_str).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.concat())
    }
}

fn match_output_items(v: &Value) -> Option<String> {
    let arr = v.get("output")?.as_array()?;
    let mut out = String::new();
    for item in arr {
        let Some(content) = item.get("content").and_then(Value::as_array) else {
            continue;
        };
        for c in content {
            if let Some(t) = c.get("text").and_then(Value::as_str) {
                out.push_str(t);
            }
        }
    }
    if out.trim().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn match_chat_choices(v: &Value) -> Option<String> {
    let content = v
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()?;
    Some(content.to_string())
}

// Historical response shapes, newest first. First matcher producing
// non-empty text wins.
const RESPONSE_SHAPES: &[fn(&Value) -> Option<String>] = &[
    match_output_text_string,
    match_output_text_array,
    match_output_items,
    match_chat_choices,
];

pub(crate) fn extract_text(v: &Value) -> Option<String> {
    RESPONSE_SHAPES
        .iter()
        .find_map(|m| m(v).map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
}

const ERROR_BODY_MAX_CHARS: usize = 512;

/// Bounded excerpt of a non-2xx response body for the error message. Cuts
/// on a char boundary; error pages are not guaranteed to be ASCII.
pub(crate) fn error_body_excerpt(body: &str) -> String {
    if body.chars().count() <= ERROR_BODY_MAX_CHARS {
        return body.to_string();
    }
    let head: String = body.chars().take(ERROR_BODY_MAX_CHARS).collect();
    format!("{head}...(truncated)")
}

/// Incremental SSE parser for Responses API streams. Only
/// `response.output_text.delta` events contribute text; a terminal
/// `response.completed` is consulted only when no delta produced content,
/// so the final text is never counted twice.
struct SseAccumulator {
    delta_tx: Option<UnboundedSender<String>>,
    pending: String,
    text: String,
    saw_delta: bool,
}

impl SseAccumulator {
    fn new(delta_tx: Option<UnboundedSender<String>>) -> Self {
        Self {
            delta_tx,
            pending: String::new(),
            text: String::new(),
            saw_delta: false,
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            self.handle_line(line.trim_end_matches(|c| c == '\r' || c == '\n'));
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let Ok(v) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        match v.get("type").and_then(Value::as_str) {
            Some("response.output_text.delta") => {
                if let Some(d) = v.get("delta").and_then(Value::as_str) {
                    if !d.is_empty() {
                        self.saw_delta = true;
                        self.text.push_str(d);
                        if let Some(tx) = &self.delta_tx {
                            let _ = tx.send(d.to_string());
                        }
                    }
                }
            }
            Some("response.completed") => {
                if !self.saw_delta {
                    if let Some(t) = v.get("response").and_then(extract_text) {
                        self.text = t;
                    }
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> String {
        self.text
    }
}

#[derive(Serialize)]
struct ResponsesReq<'a> {
    model: &'a str,
    input: Vec<InputItem<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct InputItem<'a> {
    role: &'a str,
    content: &'a str,
}

pub struct OpenAiCompatibleProvider {
    descriptor: ProviderDescriptor,
    client: Client,
    secrets: Arc<SecretsService>,
}

impl OpenAiCompatibleProvider {
    pub fn new(secrets: Arc<SecretsService>) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: PROVIDER_LLM_OPENAI_COMPATIBLE.to_string(),
                capability: Capability::Llm,
                display_name: "OpenAI Compatible".to_string(),
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
            env_var_names: LLM_KEY_ENV_VARS.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn status(&self) -> ProviderStatus {
        let key = self.resolve_key(None);
        let mut st = ProviderStatus::ready();
        st.detail = Some(serde_json::json!({ "apiKeyConfigured": !key.is_empty() }));
        st
    }

    async fn respond(&self, req: LlmRequest) -> Result<LlmResult> {
        let profile = req.profile.as_ref();
        let resolved =
            resolve_llm_endpoint(profile.and_then(|p| p.endpoint.as_deref()).unwrap_or(""));
        let model = profile
            .and_then(|p| p.model.as_deref())
            .unwrap_or(DEFAULT_LLM_MODEL);

        let key = self.resolve_key(profile.and_then(|p| p.secret_ref.clone()));
        if key.is_empty() && !is_local_endpoint(&resolved.host) {
            return Err(provider_err(
                "E_API_KEY_MISSING",
                format!("{} requires an API key and none was resolved", resolved.host),
            ));
        }

        let mut input: Vec<InputItem> = Vec::new();
        let system = req
            .system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| profile.and_then(|p| p.option_str("systemPrompt")));
        if let Some(sp) = system {
            input.push(InputItem {
                role: "system",
                content: sp,
            });
        }
        if req.messages.is_empty() {
            let prompt = req
                .prompt
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("llm request requires a prompt or messages"))?;
            input.push(InputItem {
                role: "user",
                content: prompt,
            });
        } else {
            for m in &req.messages {
                input.push(InputItem {
                    role: &m.role,
                    content: &m.content,
                });
            }
        }

        let streaming = req.delta_tx.is_some();
        let body = ResponsesReq {
            model,
            input,
            stream: streaming,
            temperature: profile
                .and_then(|p| p.options.get("temperature"))
                .and_then(Value::as_f64),
        };

        let mut http = self.client.post(&resolved.endpoint).json(&body);
        if !key.is_empty() {
            http = http.bearer_auth(&key);
        }

        let timeout_secs = req.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let delta_tx = req.delta_tx.clone();
        let fut = async move {
            let resp = http.send().await.context("llm request failed")?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(provider_err(
                    &format!("E_HTTP_STATUS_{}", status.as_u16()),
                    error_body_excerpt(&body),
                ));
            }
            if streaming {
                let mut acc = SseAccumulator::new(delta_tx);
                let mut stream = resp.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let bytes = chunk.context("llm stream read failed")?;
                    acc.push_bytes(&bytes);
                }
                Ok(acc.finish())
            } else {
                let v: Value = resp.json().await.context("llm response parse failed")?;
                extract_text(&v)
                    .ok_or_else(|| provider_err("E_EMPTY_TEXT", "llm returned empty content"))
            }
        };

        let text = tokio::select! {
            _ = req.cancel.cancelled() => {
                return Err(provider_err("E_CANCELLED", "llm request cancelled"));
            }
            r = tokio::time::timeout(Duration::from_secs(timeout_secs), fut) => match r {
                Ok(v) => v?,
                Err(_) => {
                    return Err(provider_err(
                        "E_TIMEOUT",
                        format!("llm request exceeded {timeout_secs}s"),
                    ));
                }
            },
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(provider_err("E_EMPTY_TEXT", "llm returned empty content"));
        }
        Ok(LlmResult { text })
    }
}
