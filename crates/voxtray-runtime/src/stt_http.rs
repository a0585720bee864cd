use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client};
use serde::Deserialize;

use crate::{
    llm_chat::{error_body_excerpt, is_local_endpoint},
    provider::{
        provider_err, Capability, ProviderDescriptor, ProviderKind, ProviderStatus, SttProvider,
        SttRequest, SttResult, PROVIDER_STT_WHISPER_HTTP,
    },
    secrets::{SecretQuery, SecretsService},
};

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const STT_KEY_ENV_VARS: &[&str] = &["VOXTRAY_STT_API_KEY"];

#[derive(Debug, Deserialize)]
struct TranscribeResp {
    text: Option<String>,
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

pub struct WhisperHttpProvider {
    descriptor: ProviderDescriptor,
    client: Client,
    secrets: Arc<SecretsService>,
}

impl WhisperHttpProvider {
    pub fn new(secrets: Arc<SecretsService>) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: PROVIDER_STT_WHISPER_HTTP.to_string(),
                capability: Capability::Stt,
                display_name: "Remote Whisper".to_string(),
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
            env_var_names: STT_KEY_ENV_VARS.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl SttProvider for WhisperHttpProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn status(&self) -> ProviderStatus {
        let key = self.resolve_key(None);
        let mut st = ProviderStatus::ready();
        st.detail = Some(serde_json::json!({ "apiKeyConfigured": !key.is_empty() }));
        st
    }

    async fn transcribe(&self, req: SttRequest) -> Result<SttResult> {
        let profile = req.profile.as_ref();
        let endpoint = profile
            .and_then(|p| p.endpoint.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("remote transcription endpoint is not configured"))?
            .to_string();

        let key = self.resolve_key(profile.and_then(|p| p.secret_ref.clone()));
        if key.is_empty() && !is_local_endpoint(&endpoint) {
            return Err(provider_err(
                "E_API_KEY_MISSING",
                format!("{endpoint} requires an API key and none was resolved"),
            ));
        }

        let bytes = match (&req.audio, &req.audio_path) {
            (Some(b), _) => b.clone(),
            (None, Some(p)) => tokio::fs::read(p)
                .await
                .with_context(|| format!("read audio failed: {}", p.display()))?,
            (None, None) => {
                return Err(anyhow!(
                    "transcribe request carries neither audio_path nor audio bytes"
                ));
            }
        };

        let ext = req.extension.as_deref().unwrap_or("wav");
        let part = multipart::Part::bytes(bytes)
            .file_name(format!("audio.{ext}"))
            .mime_str(mime_for_extension(ext))
            .context("invalid audio mime")?;
        let mut form = multipart::Form::new().part("file", part);
        if let Some(m) = profile.and_then(|p| p.model.as_deref()).map(str::trim) {
            if !m.is_empty() {
                form = form.text("model", m.to_string());
            }
        }
        if let Some(lang) = req
            .language
            .as_deref()
            .or_else(|| profile.and_then(|p| p.language.as_deref()))
        {
            form = form.text("language", lang.to_string());
        }

        let mut http = self.client.post(&endpoint).multipart(form);
        if !key.is_empty() {
            http = http.bearer_auth(&key);
        }

        let timeout_secs = profile
            .and_then(|p| p.options.get("timeoutSecs"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let fut = async move {
            let resp = http.send().await.context("transcription request failed")?;
            let status = resp.status();
            let body = resp
                .text()
                .await
                .context("read transcription response failed")?;
            if !status.is_success() {
                return Err(provider_err(
                    &format!("E_HTTP_STATUS_{}", status.as_u16()),
                    error_body_excerpt(&body),
                ));
            }
            let parsed: TranscribeResp =
                serde_json::from_str(&body).context("invalid transcription response json")?;
            Ok(parsed.text.unwrap_or_default())
        };

        let text = tokio::select! {
            _ = req.cancel.cancelled() => {
                return Err(provider_err("E_CANCELLED", "transcription cancelled"));
            }
            r = tokio::time::timeout(Duration::from_secs(timeout_secs), fut) => match r {
                Ok(v) => v?,
                Err(_) => {
                    return Err(provider_err(
                        "E_TIMEOUT",
                        format!("transcription request exceeded {timeout_secs}s"),
                    ));
                }
            },
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(provider_err(
                "E_EMPTY_TEXT",
                "transcription response text is missing or empty",
            ));
        }
        Ok(SttResult { text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderProfile;
    use crate::provider::error_code;
    use std::sync::{Mutex, OnceLock};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn provider_in(dir: &std::path::Path) -> WhisperHttpProvider {
        WhisperHttpProvider::new(Arc::new(SecretsService::plaintext_only(dir)))
    }

    fn remote_profile(endpoint: &str) -> ProviderProfile {
        ProviderProfile {
            id: "p".to_string(),
            provider_id: PROVIDER_STT_WHISPER_HTTP.to_string(),
            label: "P".to_string(),
            endpoint: Some(endpoint.to_string()),
            model: Some("whisper-1".to_string()),
            ..Default::default()
        }
    }

    async fn one_shot_server(
        status_line: &'static str,
        response_body: &'static str,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            let mut tmp = [0u8; 4096];
            loop {
                let n = sock.read(&mut tmp).await.unwrap();
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&tmp[..n]);
                if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                    let headers = String::from_utf8_lossy(&data[..pos]).to_string();
                    let cl = headers
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            if k.eq_ignore_ascii_case("content-length") {
                                v.trim().parse::<usize>().ok()
                            } else {
                                None
                            }
                        })
                        .unwrap_or(0);
                    if data.len() >= pos + 4 + cl {
                        break;
                    }
                }
            }
            let resp = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                response_body.len(),
                response_body
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
            String::from_utf8_lossy(&data).to_string()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn missing_endpoint_is_rejected() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = provider_in(td.path());
        let err = p
            .transcribe(SttRequest {
                audio: Some(vec![1, 2, 3]),
                profile: Some(ProviderProfile {
                    id: "p".to_string(),
                    provider_id: PROVIDER_STT_WHISPER_HTTP.to_string(),
                    label: "P".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("endpoint"));
    }

    #[tokio::test]
    async fn remote_endpoint_without_key_fails_before_upload() {
        let _g = env_lock().lock().unwrap();
        for name in STT_KEY_ENV_VARS {
            std::env::remove_var(name);
        }
        let td = tempfile::tempdir().expect("tempdir");
        let p = provider_in(td.path());
        let err = p
            .transcribe(SttRequest {
                audio: Some(vec![1, 2, 3]),
                profile: Some(remote_profile("https://stt.example.com/transcribe")),
                ..Default::default()
            })
            .await
            .expect_err("should fail");
        assert_eq!(error_code(&err).as_deref(), Some("E_API_KEY_MISSING"));
        assert!(err.to_string().contains("API key"));
    }

    #[tokio::test]
    async fn uploads_multipart_audio_and_trims_response_text() {
        let _g = env_lock().lock().unwrap();
        for name in STT_KEY_ENV_VARS {
            std::env::remove_var(name);
        }
        let (addr, server) = one_shot_server("200 OK", r#"{"text":"  hello from remote  "}"#).await;
        let td = tempfile::tempdir().expect("tempdir");
        let p = provider_in(td.path());
        let out = p
            .transcribe(SttRequest {
                audio: Some(b"RIFFdata".to_vec()),
                extension: Some("wav".to_string()),
                language: Some("en".to_string()),
                profile: Some(remote_profile(&format!(
                    "http://127.0.0.1:{}/transcribe",
                    addr.port()
                ))),
                ..Default::default()
            })
            .await
            .expect("transcribe");
        assert_eq!(out.text, "hello from remote");

        let request = server.await.unwrap();
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
        assert!(request.contains("audio.wav"));
        assert!(request.contains("whisper-1"));
        assert!(request.contains("name=\"language\""));
    }

    #[tokio::test]
    async fn non_success_status_maps_to_http_status_code() {
        let (addr, _server) =
            one_shot_server("503 Service Unavailable", r#"{"error":"down"}"#).await;
        let td = tempfile::tempdir().expect("tempdir");
        let p = provider_in(td.path());
        let err = p
            .transcribe(SttRequest {
                audio: Some(vec![0u8; 16]),
                profile: Some(remote_profile(&format!("http://127.0.0.1:{}", addr.port()))),
                ..Default::default()
            })
            .await
            .expect_err("should fail");
        assert_eq!(error_code(&err).as_deref(), Some("E_HTTP_STATUS_503"));
    }

    #[tokio::test]
    async fn blank_transcript_is_an_empty_text_error() {
        let (addr, _server) = one_shot_server("200 OK", r#"{"text":"   "}"#).await;
        let td = tempfile::tempdir().expect("tempdir");
        let p = provider_in(td.path());
        let err = p
            .transcribe(SttRequest {
                audio: Some(vec![0u8; 16]),
                profile: Some(remote_profile(&format!("http://127.0.0.1:{}", addr.port()))),
                ..Default::default()
            })
            .await
            .expect_err("should fail");
        assert_eq!(error_code(&err).as_deref(), Some("E_EMPTY_TEXT"));
    }
}
