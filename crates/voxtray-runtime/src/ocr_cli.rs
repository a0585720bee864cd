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
    provider::{
        provider_err, Capability, OcrProvider, OcrRequest, OcrResult, ProviderDescriptor,
        ProviderKind, ProviderStatus, PROVIDER_OCR_TESSERACT_CLI,
    },
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const STDERR_TAIL_CHARS: usize = 600;

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn default_binary_name() -> &'static str {
    if cfg!(windows) {
        "tesseract.exe"
    } else {
        "tesseract"
    }
}

fn stderr_tail(s: &str) -> String {
    let t = s.trim();
    let count = t.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return t.to_string();
    }
    t.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

pub struct TesseractCliProvider {
    descriptor: ProviderDescriptor,
    data_dir: PathBuf,
}

impl TesseractCliProvider {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: PROVIDER_OCR_TESSERACT_CLI.to_string(),
                capability: Capability::Ocr,
                display_name: "Tesseract OCR".to_string(),
                kind: ProviderKind::Local,
                requires_install: false,
                supports_local_path: true,
            },
            data_dir: data_dir.to_path_buf(),
        }
    }

    fn resolve_binary(&self, profile: Option<&ProviderProfile>) -> Result<PathBuf> {
        if let Some(p) = profile
            .and_then(|p| p.local_path.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let path = PathBuf::from(p);
            if !path.exists() {
                return Err(provider_err(
                    "E_BINARY_MISSING",
                    format!("ocr binary not found at {}", path.display()),
                ));
            }
            return Ok(path);
        }
        if let Ok(p) = std::env::var("VOXTRAY_TESSERACT_PATH") {
            let path = PathBuf::from(p);
            if !path.exists() {
                return Err(provider_err(
                    "E_BINARY_MISSING",
                    format!(
                        "VOXTRAY_TESSERACT_PATH is set but does not exist: {}",
                        path.display()
                    ),
                ));
            }
            return Ok(path);
        }
        Ok(PathBuf::from(default_binary_name()))
    }

    async fn run_binary(
        &self,
        binary: &Path,
        args: &[String],
        timeout_secs: u64,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<String> {
        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(provider_err(
                    "E_BINARY_MISSING",
                    format!("ocr binary could not be spawned: {e}"),
                ));
            }
            Err(e) => {
                return Err(provider_err(
                    "E_EXEC_FAILED",
                    format!("ocr binary spawn failed: {e}"),
                ));
            }
        };

        let waited = child.wait_with_output();
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(provider_err("E_CANCELLED", "ocr cancelled"));
            }
            r = tokio::time::timeout(Duration::from_secs(timeout_secs), waited) => match r {
                Ok(Ok(out)) => out,
                Ok(Err(e)) => {
                    return Err(provider_err(
                        "E_EXEC_FAILED",
                        format!("ocr binary wait failed: {e}"),
                    ));
                }
                Err(_) => {
                    return Err(provider_err(
                        "E_TIMEOUT",
                        format!("ocr binary exceeded {timeout_secs}s"),
                    ));
                }
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(provider_err(
                "E_EXEC_FAILED",
                format!("ocr binary exit={}: {}", output.status, stderr_tail(&stderr)),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl OcrProvider for TesseractCliProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn status(&self) -> ProviderStatus {
        match self.resolve_binary(None) {
            Ok(p) => {
                let present = if p.is_absolute() {
                    p.exists()
                } else {
                    find_in_path(&p.to_string_lossy()).is_some()
                };
                if present {
                    ProviderStatus::ready()
                } else {
                    ProviderStatus::not_ready(
                        "E_BINARY_MISSING",
                        format!("{} not found on PATH", p.display()),
                    )
                }
            }
            Err(e) => ProviderStatus::not_ready("E_BINARY_MISSING", e.to_string()),
        }
    }

    async fn extract_text(&self, req: OcrRequest) -> Result<OcrResult> {
        let profile = req.profile.as_ref();
        let binary = self.resolve_binary(profile)?;
        let timeout_secs = req.timeout_secs.unwrap_or_else(|| {
            profile
                .and_then(|p| p.options.get("timeoutSecs"))
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(DEFAULT_TIMEOUT_SECS)
        });

        // Byte inputs get a scratch image the binary can open; removed on
        // every exit path.
        let mut scratch: Option<PathBuf> = None;
        let image_path = match (&req.image_path, &req.image) {
            (Some(p), _) => p.clone(),
            (None, Some(bytes)) => {
                let dir = data_dir::temp_dir(&self.data_dir)?;
                let p = dir.join(format!("ocr-{}.png", uuid::Uuid::new_v4()));
                std::fs::write(&p, bytes)
                    .with_context(|| format!("write scratch image failed: {}", p.display()))?;
                scratch = Some(p.clone());
                p
            }
            (None, None) => {
                return Err(provider_err(
                    "E_EXEC_FAILED",
                    "ocr request carries neither image_path nor image bytes",
                ));
            }
        };

        let mut args: Vec<String> = vec![
            image_path.to_string_lossy().into_owned(),
            "stdout".to_string(),
        ];
        if let Some(lang) = req
            .language_hint
            .as_deref()
            .or_else(|| profile.and_then(|p| p.language.as_deref()))
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            args.push("-l".to_string());
            args.push(lang.to_string());
        }
        if let Some(extra) = profile
            .and_then(|p| p.options.get("extraArgs"))
            .and_then(serde_json::Value::as_array)
        {
            for v in extra {
                if let Some(s) = v.as_str() {
                    args.push(s.to_string());
                }
            }
        }

        let result = self
            .run_binary(&binary, &args, timeout_secs, &req.cancel)
            .await;
        if let Some(p) = scratch {
            let _ = std::fs::remove_file(&p);
        }
        let stdout = result?;

        // A blank region legitimately recognizes to nothing; empty is not an
        // error here, unlike transcription.
        Ok(OcrResult {
            text: stdout.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::error_code;

    fn profile_with_local_path(path: &Path) -> ProviderProfile {
        ProviderProfile {
            id: "p".to_string(),
            provider_id: PROVIDER_OCR_TESSERACT_CLI.to_string(),
            label: "P".to_string(),
            local_path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_local_path_is_classified_as_binary_missing() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = TesseractCliProvider::new(td.path());
        let err = p
            .extract_text(OcrRequest {
                image: Some(vec![1, 2, 3]),
                profile: Some(profile_with_local_path(&td.path().join("no-such-binary"))),
                ..Default::default()
            })
            .await
            .expect_err("should fail");
        assert_eq!(error_code(&err).as_deref(), Some("E_BINARY_MISSING"));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let p = dir.join(name);
            std::fs::write(&p, body).expect("write script");
            let mut perm = std::fs::metadata(&p).expect("meta").permissions();
            perm.set_mode(0o755);
            std::fs::set_permissions(&p, perm).expect("chmod");
            p
        }

        fn scratch_files(data_dir: &Path) -> Vec<std::fs::DirEntry> {
            std::fs::read_dir(data_dir.join("tmp"))
                .map(|rd| rd.filter_map(|e| e.ok()).collect())
                .unwrap_or_default()
        }

        #[tokio::test]
        async fn recognized_text_is_trimmed_and_args_include_language() {
            let td = tempfile::tempdir().expect("tempdir");
            let args_file = td.path().join("args.txt");
            let script = write_script(
                td.path(),
                "fake-ocr.sh",
                &format!(
                    "#!/bin/sh\necho \"$@\" > {}\necho '  recognized text  '\n",
                    args_file.display()
                ),
            );
            let mut profile = profile_with_local_path(&script);
            profile.options.insert(
                "extraArgs".to_string(),
                serde_json::json!(["--psm", "6"]),
            );
            let p = TesseractCliProvider::new(td.path());
            let out = p
                .extract_text(OcrRequest {
                    image: Some(vec![0u8; 8]),
                    language_hint: Some("eng".to_string()),
                    profile: Some(profile),
                    ..Default::default()
                })
                .await
                .expect("extract");
            assert_eq!(out.text, "recognized text");

            let args = std::fs::read_to_string(&args_file).expect("args recorded");
            assert!(args.contains("stdout"));
            assert!(args.contains("-l eng"));
            assert!(args.contains("--psm 6"));
            assert!(scratch_files(td.path()).is_empty(), "scratch image removed");
        }

        #[tokio::test]
        async fn scratch_image_is_removed_when_the_binary_fails() {
            let td = tempfile::tempdir().expect("tempdir");
            let script = write_script(
                td.path(),
                "fake-ocr.sh",
                "#!/bin/sh\necho 'cannot open image' >&2\nexit 1\n",
            );
            let p = TesseractCliProvider::new(td.path());
            let err = p
                .extract_text(OcrRequest {
                    image: Some(vec![0u8; 8]),
                    profile: Some(profile_with_local_path(&script)),
                    ..Default::default()
                })
                .await
                .expect_err("should fail");
            assert_eq!(error_code(&err).as_deref(), Some("E_EXEC_FAILED"));
            assert!(err.to_string().contains("cannot open image"));
            assert!(scratch_files(td.path()).is_empty(), "scratch image removed");
        }

        #[tokio::test]
        async fn slow_binary_hits_the_wall_clock_timeout() {
            let td = tempfile::tempdir().expect("tempdir");
            let script = write_script(td.path(), "fake-ocr.sh", "#!/bin/sh\nsleep 30\n");
            let p = TesseractCliProvider::new(td.path());
            let err = p
                .extract_text(OcrRequest {
                    image: Some(vec![0u8; 8]),
                    profile: Some(profile_with_local_path(&script)),
                    timeout_secs: Some(1),
                    ..Default::default()
                })
                .await
                .expect_err("should time out");
            assert_eq!(error_code(&err).as_deref(), Some("E_TIMEOUT"));
            assert!(scratch_files(td.path()).is_empty(), "scratch image removed");
        }
    }
}
