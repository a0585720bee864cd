use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::{
    config::ProviderProfile,
    data_dir,
    installer,
    provider::{
        provider_err, Capability, ProviderDescriptor, ProviderKind, ProviderStatus, SttProvider,
        SttRequest, SttResult, PROVIDER_STT_WHISPER_CLI,
    },
};

pub(crate) const STT_WORKER_MODULE: &str = "vox_stt_worker";
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_ENGINE: &str = "faster-whisper";
const STDERR_TAIL_CHARS: usize = 600;

/// Backend module missing inside the worker environment, with the exact
/// remediation the worker reports for each engine.
pub fn engine_install_hint(engine: &str) -> Option<&'static str> {
    match engine {
        "whisper" => Some("whisper is not installed. Install with: pip install -U openai-whisper"),
        "faster-whisper" => {
            Some("faster-whisper is not installed. Install with: pip install -U faster-whisper")
        }
        "whisperx" => Some("whisperx is not installed. Install with: pip install -U whisperx"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum WorkerInvocation {
    /// Run the path directly (profile localPath points at a worker binary).
    Direct(PathBuf),
    /// Run `<python> -m vox_stt_worker`.
    PythonModule(PathBuf),
}

#[derive(Debug, Clone, serde::Deserialize)]
struct WorkerError {
    code: String,
    message: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct WorkerResponse {
    ok: bool,
    text: Option<String>,
    error: Option<WorkerError>,
}

fn tail(s: &str, max_chars: usize) -> String {
    let t = s.trim();
    if t.chars().count() <= max_chars {
        return t.to_string();
    }
    t.chars()
        .skip(t.chars().count().saturating_sub(max_chars))
        .collect()
}

pub struct WhisperCliProvider {
    descriptor: ProviderDescriptor,
    data_dir: PathBuf,
}

impl WhisperCliProvider {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: PROVIDER_STT_WHISPER_CLI.to_string(),
                capability: Capability::Stt,
                display_name: "Local Whisper".to_string(),
                kind: ProviderKind::Local,
                requires_install: true,
                supports_local_path: true,
            },
            data_dir: data_dir.to_path_buf(),
        }
    }

    fn installed_python(&self) -> PathBuf {
        let venv = installer::provider_install_dir(&self.data_dir, PROVIDER_STT_WHISPER_CLI)
            .join("venv");
        if cfg!(windows) {
            venv.join("Scripts").join("python.exe")
        } else {
            venv.join("bin").join("python")
        }
    }

    fn resolve_invocation(&self, profile: Option<&ProviderProfile>) -> Result<WorkerInvocation> {
        if let Some(p) = profile
            .and_then(|p| p.local_path.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let path = PathBuf::from(p);
            if !path.exists() {
                return Err(provider_err(
                    "E_BINARY_MISSING",
                    format!("transcription worker not found at {}", path.display()),
                ));
            }
            return Ok(WorkerInvocation::Direct(path));
        }
        if let Ok(p) = std::env::var("VOXTRAY_STT_PYTHON") {
            let path = PathBuf::from(p);
            if !path.exists() {
                return Err(provider_err(
                    "E_BINARY_MISSING",
                    format!(
                        "VOXTRAY_STT_PYTHON is set but does not exist: {}",
                        path.display()
                    ),
                ));
            }
            return Ok(WorkerInvocation::PythonModule(path));
        }
        let installed = self.installed_python();
        if installed.exists() {
            return Ok(WorkerInvocation::PythonModule(installed));
        }
        // Last resort: whatever python the PATH offers.
        let fallback = if cfg!(windows) { "python" } else { "python3" };
        Ok(WorkerInvocation::PythonModule(PathBuf::from(fallback)))
    }

    fn build_command(&self, invocation: &WorkerInvocation, args: &[String]) -> Command {
        let mut cmd = match invocation {
            WorkerInvocation::Direct(path) => Command::new(path),
            WorkerInvocation::PythonModule(py) => {
                let mut c = Command::new(py);
                c.arg("-m").arg(STT_WORKER_MODULE);
                c
            }
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_worker(
        &self,
        invocation: &WorkerInvocation,
        args: &[String],
        timeout_secs: u64,
        cancel: &tokio_util::sync::CancellationToken,
        engine: &str,
    ) -> Result<WorkerResponse> {
        let mut cmd = self.build_command(invocation, args);
        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(provider_err(
                    "E_BINARY_MISSING",
                    format!("transcription worker could not be spawned: {e}"),
                ));
            }
            Err(e) => {
                return Err(provider_err(
                    "E_EXEC_FAILED",
                    format!("transcription worker spawn failed: {e}"),
                ));
            }
        };

        // kill_on_drop tears the child down on both timeout and cancel.
        let waited = child.wait_with_output();
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(provider_err("E_CANCELLED", "transcription cancelled"));
            }
            r = tokio::time::timeout(Duration::from_secs(timeout_secs), waited) => match r {
                Ok(Ok(out)) => out,
                Ok(Err(e)) => {
                    return Err(provider_err(
                        "E_EXEC_FAILED",
                        format!("transcription worker wait failed: {e}"),
                    ));
                }
                Err(_) => {
                    return Err(provider_err(
                        "E_TIMEOUT",
                        format!("transcription worker exceeded {timeout_secs}s"),
                    ));
                }
            },
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            if stderr.contains("No module named") {
                let message = engine_install_hint(engine)
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| format!("worker backend missing: {}", tail(&stderr, STDERR_TAIL_CHARS)));
                return Err(provider_err("E_ENGINE_NOT_INSTALLED", message));
            }
            return Err(provider_err(
                "E_EXEC_FAILED",
                format!(
                    "transcription worker exit={}: {}",
                    output.status,
                    tail(&stderr, STDERR_TAIL_CHARS)
                ),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("");
        let resp: WorkerResponse = serde_json::from_str(line.trim()).map_err(|e| {
            provider_err(
                "E_EXEC_FAILED",
                format!("worker returned invalid json: {e}: {}", tail(&stdout, STDERR_TAIL_CHARS)),
            )
        })?;
        Ok(resp)
    }
}

#[async_trait]
impl SttProvider for WhisperCliProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn status(&self) -> ProviderStatus {
        match self.resolve_invocation(None) {
            Ok(WorkerInvocation::Direct(p)) | Ok(WorkerInvocation::PythonModule(p)) => {
                if p.is_absolute() && !p.exists() {
                    ProviderStatus::not_ready(
                        "E_BINARY_MISSING",
                        format!("worker python not found at {}", p.display()),
                    )
                } else {
                    ProviderStatus::ready()
                }
            }
            Err(e) => ProviderStatus::not_ready("E_BINARY_MISSING", e.to_string()),
        }
    }

    async fn transcribe(&self, req: SttRequest) -> Result<SttResult> {
        let profile = req.profile.as_ref();
        let engine = profile
            .and_then(|p| p.option_str("engine"))
            .unwrap_or(DEFAULT_ENGINE)
            .to_string();
        let timeout_secs = profile
            .and_then(|p| p.options.get("timeoutSecs"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let invocation = self.resolve_invocation(profile)?;

        // Bytes-only requests get a scratch file the worker can read; it is
        // removed on every exit path.
        let mut scratch: Option<PathBuf> = None;
        let audio_path = match (&req.audio_path, &req.audio) {
            (Some(p), _) => p.clone(),
            (None, Some(bytes)) => {
                let ext = req.extension.as_deref().unwrap_or("wav");
                let dir = data_dir::temp_dir(&self.data_dir)?;
                let p = dir.join(format!("stt-{}.{ext}", uuid::Uuid::new_v4()));
                std::fs::write(&p, bytes)
                    .with_context(|| format!("write scratch audio failed: {}", p.display()))?;
                scratch = Some(p.clone());
                p
            }
            (None, None) => {
                return Err(provider_err(
                    "E_EXEC_FAILED",
                    "transcribe request carries neither audio_path nor audio bytes",
                ));
            }
        };

        let mut args: Vec<String> = vec![
            "--audio".to_string(),
            audio_path.to_string_lossy().into_owned(),
            "--engine".to_string(),
            engine.clone(),
        ];
        if let Some(model) = profile.and_then(|p| p.model.as_deref()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if let Some(lang) = req
            .language
            .as_deref()
            .or_else(|| profile.and_then(|p| p.language.as_deref()))
        {
            args.push("--language".to_string());
            args.push(lang.to_string());
        }

        let result = self
            .run_worker(&invocation, &args, timeout_secs, &req.cancel, &engine)
            .await;
        if let Some(p) = scratch {
            let _ = std::fs::remove_file(&p);
        }
        let resp = result?;

        if !resp.ok {
            let e = resp.error.unwrap_or(WorkerError {
                code: "E_EXEC_FAILED".to_string(),
                message: "worker reported failure without detail".to_string(),
            });
            let code = match e.code.as_str() {
                "engine_not_installed" => "E_ENGINE_NOT_INSTALLED",
                other if other.starts_with("E_") => other,
                _ => "E_EXEC_FAILED",
            };
            return Err(provider_err(code, e.message));
        }
        Ok(SttResult {
            text: resp.text.unwrap_or_default().trim().to_string(),
        })
    }

    async fn warmup(&self) -> Result<()> {
        let invocation = self.resolve_invocation(None)?;
        let args = vec!["--selftest".to_string()];
        let cancel = tokio_util::sync::CancellationToken::new();
        self.run_worker(&invocation, &args, 120, &cancel, DEFAULT_ENGINE)
            .await
            .map(|_| ())
    }
}
