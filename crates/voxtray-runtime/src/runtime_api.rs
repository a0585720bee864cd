use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RuntimeApiConfig,
    installer::{InstallAction, StartJobRequest},
    orchestrator::Orchestrator,
    provider::{error_code, LlmMessage, LlmRequest, OcrRequest, SttRequest},
    secrets::SecretsService,
};

pub const AUTH_TOKEN_REF: &str = "runtime_api.auth_token";

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

struct HttpRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

struct HttpResponse {
    status: u16,
    body: Value,
}

fn json_response(status: u16, body: Value) -> HttpResponse {
    HttpResponse { status, body }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "",
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<HttpRequest> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut tmp = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            bail!("request head too large");
        }
        let n = stream.read(&mut tmp).await.context("read request failed")?;
        if n == 0 {
            bail!("connection closed before request head");
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end]).context("request head is not utf-8")?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("missing request method")?.to_string();
    let path = parts.next().context("missing request path")?.to_string();

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(n, _)| n == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        bail!("request body too large");
    }
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).await.context("read request body failed")?;
        if n == 0 {
            bail!("connection closed mid-body");
        }
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_length);

    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

async fn write_response<S: AsyncWrite + Unpin>(stream: &mut S, resp: &HttpResponse) -> Result<()> {
    let body = serde_json::to_vec(&resp.body).unwrap_or_else(|_| b"{}".to_vec());
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        resp.status,
        reason(resp.status),
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .context("write response head failed")?;
    stream
        .write_all(&body)
        .await
        .context("write response body failed")?;
    stream.flush().await.context("flush response failed")?;
    Ok(())
}

// Malformed JSON is a 500 carrying the parse error; missing fields are the
// caller's fault and come back as 400 from the individual handlers.
fn parse_json(body: &[u8]) -> std::result::Result<Value, HttpResponse> {
    serde_json::from_slice(body)
        .map_err(|e| json_response(500, json!({"error": format!("invalid json body: {e}")})))
}

fn provider_failure(e: &anyhow::Error) -> HttpResponse {
    json_response(
        500,
        json!({"error": format!("{e:#}"), "code": error_code(e)}),
    )
}

/// Thin HTTP face over the orchestrator for local verification and
/// integrations. One request per connection, JSON in and out.
#[derive(Clone)]
pub struct RuntimeApiServer {
    orchestrator: Orchestrator,
    auth_token: Option<String>,
}

impl RuntimeApiServer {
    pub fn new(orchestrator: Orchestrator, auth_token: Option<String>) -> Self {
        Self {
            orchestrator,
            auth_token,
        }
    }

    /// Resolve the bearer token through the secrets service. Fails closed:
    /// auth required with no resolvable token refuses to build rather than
    /// serving an open endpoint.
    pub fn from_config(
        orchestrator: Orchestrator,
        secrets: &SecretsService,
        cfg: &RuntimeApiConfig,
    ) -> Result<Self> {
        let auth_token = if cfg.auth_required {
            let secret_ref = cfg.auth_token_ref.as_deref().unwrap_or(AUTH_TOKEN_REF);
            let token = secrets
                .get_secret(secret_ref)
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            if token.is_empty() {
                bail!("runtime api auth is required but secret '{secret_ref}' resolves to nothing");
            }
            Some(token)
        } else {
            None
        };
        Ok(Self::new(orchestrator, auth_token))
    }

    /// Bind and serve on TCP; returns the bound address (useful with port
    /// 0). Serving stops when `cancel` fires.
    pub async fn start_tcp(
        &self,
        host: &str,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("bind {host}:{port} failed"))?;
        let addr = listener.local_addr().context("local_addr failed")?;
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.handle_connection(stream).await {
                                crate::safe_eprintln!("runtime api: {e:#}");
                            }
                        });
                    }
                }
            }
        });
        Ok(addr)
    }

    #[cfg(unix)]
    pub async fn start_unix(
        &self,
        path: &std::path::Path,
        cancel: CancellationToken,
    ) -> Result<()> {
        // A previous run may have left its socket file behind.
        let _ = std::fs::remove_file(path);
        let listener = tokio::net::UnixListener::bind(path)
            .with_context(|| format!("bind {} failed", path.display()))?;
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.handle_connection(stream).await {
                                crate::safe_eprintln!("runtime api: {e:#}");
                            }
                        });
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        mut stream: S,
    ) -> Result<()> {
        let resp = match read_request(&mut stream).await {
            Ok(req) => self.dispatch(req).await,
            Err(e) => json_response(400, json!({"error": format!("bad request: {e:#}")})),
        };
        write_response(&mut stream, &resp).await
    }

    async fn dispatch(&self, req: HttpRequest) -> HttpResponse {
        if let Some(expected) = &self.auth_token {
            let ok = req
                .header("authorization")
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim() == expected)
                .unwrap_or(false);
            if !ok {
                return json_response(401, json!({"error": "unauthorized"}));
            }
        }

        let path = req.path.split('?').next().unwrap_or_default().to_string();
        match (req.method.as_str(), path.as_str()) {
            ("GET", "/v1/providers") => json_response(
                200,
                json!({"providers": self.orchestrator.list_providers(None)}),
            ),
            ("GET", p) if p.starts_with("/v1/providers/") => {
                self.handle_provider_status(&p["/v1/providers/".len()..])
            }
            ("POST", "/v1/stt/transcribe") => self.handle_transcribe(&req.body).await,
            ("POST", "/v1/llm/respond") => self.handle_respond(&req.body).await,
            ("POST", "/v1/ocr/extract") => self.handle_ocr(&req.body).await,
            ("POST", "/v1/install/jobs") => self.handle_start_job(&req.body),
            ("GET", p) if p.starts_with("/v1/install/jobs/") => {
                self.handle_get_job(&p["/v1/install/jobs/".len()..])
            }
            _ => json_response(
                404,
                json!({"error": format!("no route for {} {}", req.method, path)}),
            ),
        }
    }

    fn handle_provider_status(&self, rest: &str) -> HttpResponse {
        let id = rest.strip_suffix("/status").unwrap_or(rest).trim_matches('/');
        if id.is_empty() || id.contains('/') {
            return json_response(404, json!({"error": "no such route"}));
        }
        match self.orchestrator.provider_status(id) {
            Some(status) => json_response(200, serde_json::to_value(&status).unwrap_or_default()),
            None => json_response(404, json!({"error": format!("unknown provider: {id}")})),
        }
    }

    async fn handle_transcribe(&self, body: &[u8]) -> HttpResponse {
        let v = match parse_json(body) {
            Ok(v) => v,
            Err(r) => return r,
        };
        let Some(audio_b64) = v.get("audio_base64").and_then(Value::as_str) else {
            return json_response(400, json!({"error": "audio_base64 is required"}));
        };
        let audio = match BASE64.decode(audio_b64.trim()) {
            Ok(b) => b,
            Err(e) => {
                return json_response(
                    400,
                    json!({"error": format!("audio_base64 is not valid base64: {e}")}),
                )
            }
        };
        let extension = v.get("extension").and_then(Value::as_str);
        match self
            .orchestrator
            .transcribe_from_buffer(&audio, extension, SttRequest::default())
            .await
        {
            Ok(r) => json_response(200, json!({"text": r.text})),
            Err(e) => provider_failure(&e),
        }
    }

    async fn handle_respond(&self, body: &[u8]) -> HttpResponse {
        let v = match parse_json(body) {
            Ok(v) => v,
            Err(r) => return r,
        };
        let prompt = v
            .get("prompt")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        let messages: Vec<LlmMessage> = match v.get("messages") {
            None | Some(Value::Null) => Vec::new(),
            Some(m) => match serde_json::from_value(m.clone()) {
                Ok(list) => list,
                Err(e) => {
                    return json_response(
                        400,
                        json!({"error": format!("messages must be a list of {{role, content}}: {e}")}),
                    )
                }
            },
        };
        if prompt.as_deref().map(str::trim).unwrap_or("").is_empty() && messages.is_empty() {
            return json_response(400, json!({"error": "prompt or messages is required"}));
        }
        let req = LlmRequest {
            prompt,
            messages,
            ..Default::default()
        };
        match self.orchestrator.respond_llm(req).await {
            Ok(r) => json_response(200, json!({"text": r.text})),
            Err(e) => provider_failure(&e),
        }
    }

    async fn handle_ocr(&self, body: &[u8]) -> HttpResponse {
        let v = match parse_json(body) {
            Ok(v) => v,
            Err(r) => return r,
        };
        let Some(image_b64) = v.get("image_base64").and_then(Value::as_str) else {
            return json_response(400, json!({"error": "image_base64 is required"}));
        };
        let image = match BASE64.decode(image_b64.trim()) {
            Ok(b) => b,
            Err(e) => {
                return json_response(
                    400,
                    json!({"error": format!("image_base64 is not valid base64: {e}")}),
                )
            }
        };
        let language_hint = v
            .get("languageHint")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        let req = OcrRequest {
            image: Some(image),
            language_hint,
            ..Default::default()
        };
        match self.orchestrator.extract_ocr(req).await {
            Ok(r) => json_response(200, json!({"text": r.text})),
            Err(e) => provider_failure(&e),
        }
    }

    fn handle_start_job(&self, body: &[u8]) -> HttpResponse {
        let v = match parse_json(body) {
            Ok(v) => v,
            Err(r) => return r,
        };
        let Some(provider_id) = v.get("providerId").and_then(Value::as_str) else {
            return json_response(400, json!({"error": "providerId is required"}));
        };
        let Some(action_raw) = v.get("action") else {
            return json_response(400, json!({"error": "action is required"}));
        };
        let action: InstallAction = match serde_json::from_value(action_raw.clone()) {
            Ok(a) => a,
            Err(_) => {
                return json_response(
                    400,
                    json!({"error": "action must be one of install|update|remove|use_existing"}),
                )
            }
        };
        let local_path = v
            .get("localPath")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        match self.orchestrator.installer().start_job(StartJobRequest {
            provider_id: provider_id.to_string(),
            action,
            local_path,
        }) {
            Ok(job) => json_response(202, json!({"job": job})),
            Err(e) => json_response(400, json!({"error": format!("{e:#}")})),
        }
    }

    fn handle_get_job(&self, rest: &str) -> HttpResponse {
        let id = rest.trim_matches('/');
        if id.is_empty() || id.contains('/') {
            return json_response(404, json!({"error": "no such route"}));
        }
        match self.orchestrator.installer().job(id) {
            Some(job) => json_response(200, json!({"job": job})),
            None => json_response(404, json!({"error": format!("unknown install job: {id}")})),
        }
    }
}
