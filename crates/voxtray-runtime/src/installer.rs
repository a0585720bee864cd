use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    config::InstallerConfig,
    fsio, metrics,
    provider::{error_code, provider_err, PROVIDER_STT_WHISPER_CLI},
    stt_cli::STT_WORKER_MODULE,
    trace::{self, now_ms, Span},
};

const STATE_FILE: &str = "installer-state.json";
const STDERR_TAIL_CHARS: usize = 600;

pub fn provider_install_dir(data_dir: &Path, provider_id: &str) -> PathBuf {
    data_dir.join("providers").join(provider_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallAction {
    Install,
    Update,
    Remove,
    UseExisting,
}

impl InstallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallAction::Install => "install",
            InstallAction::Update => "update",
            InstallAction::Remove => "remove",
            InstallAction::UseExisting => "use_existing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Downloading,
    Verifying,
    Installing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Downloading => "downloading",
            JobState::Verifying => "verifying",
            JobState::Installing => "installing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSpec {
    pub url: String,
    pub sha256: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderManifest {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallJob {
    pub id: String,
    pub provider_id: String,
    pub action: InstallAction,
    pub state: JobState,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallSource {
    Managed,
    Existing,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallState {
    pub provider_id: String,
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,
    pub source: InstallSource,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartJobRequest {
    pub provider_id: String,
    pub action: InstallAction,
    #[serde(default)]
    pub local_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedState {
    jobs: Vec<InstallJob>,
    installs: BTreeMap<String, InstallState>,
}

struct Inner {
    jobs: Vec<InstallJob>,
    queue: VecDeque<String>,
    installs: BTreeMap<String, InstallState>,
    running: bool,
}

fn has_python_bootstrap(provider_id: &str) -> bool {
    provider_id == PROVIDER_STT_WHISPER_CLI
}

fn venv_python(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python")
    }
}

fn is_pip_installable(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    name.ends_with(".whl") || name.ends_with(".tar.gz")
}

fn stderr_tail(s: &str) -> String {
    let t = s.trim();
    let count = t.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return t.to_string();
    }
    t.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

async fn run_checked(mut cmd: Command, what: &str, timeout_secs: u64) -> Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(provider_err(
                "E_BINARY_MISSING",
                format!("{what}: interpreter not found: {e}"),
            ));
        }
        Err(e) => {
            return Err(provider_err("E_EXEC_FAILED", format!("{what}: spawn failed: {e}")));
        }
    };
    let output = match tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        child.wait_with_output(),
    )
    .await
    {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            return Err(provider_err("E_EXEC_FAILED", format!("{what}: wait failed: {e}")));
        }
        Err(_) => {
            return Err(provider_err(
                "E_TIMEOUT",
                format!("{what} exceeded {timeout_secs}s"),
            ));
        }
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(provider_err(
            "E_EXEC_FAILED",
            format!("{what} exit={}: {}", output.status, stderr_tail(&stderr)),
        ));
    }
    Ok(())
}

fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let mut f = std::fs::File::open(path)
        .with_context(|| format!("open artifact failed: {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut f, &mut hasher).context("hash artifact failed")?;
    let actual = hex::encode(hasher.finalize());
    let want = expected.trim().to_ascii_lowercase();
    if actual != want {
        return Err(provider_err(
            "E_CHECKSUM_MISMATCH",
            format!("{}: expected {want}, got {actual}", path.display()),
        ));
    }
    Ok(())
}

fn gunzip_file(src: &Path, dest: &Path) -> Result<()> {
    let f =
        std::fs::File::open(src).with_context(|| format!("open {} failed", src.display()))?;
    let mut dec = flate2::read::GzDecoder::new(f);
    let mut out = std::fs::File::create(dest)
        .with_context(|| format!("create {} failed", dest.display()))?;
    std::io::copy(&mut dec, &mut out)
        .with_context(|| format!("gunzip {} failed", src.display()))?;
    Ok(())
}

/// Durable installer job queue. One drain task processes jobs strictly in
/// FIFO order; every state transition persists the whole {jobs, installs}
/// snapshot. Job history is never deleted.
#[derive(Clone)]
pub struct InstallerService {
    data_dir: PathBuf,
    client: Client,
    config: Arc<Mutex<InstallerConfig>>,
    manifests: Arc<Mutex<HashMap<String, ProviderManifest>>>,
    inner: Arc<Mutex<Inner>>,
}

impl InstallerService {
    pub fn new(data_dir: &Path) -> Self {
        let mut persisted = Self::load_state(data_dir);
        // Jobs that were mid-flight when the process died cannot be resumed;
        // surface that instead of leaving them open forever.
        let mut interrupted = false;
        let now = now_ms();
        for j in persisted.jobs.iter_mut() {
            if !j.state.is_terminal() {
                j.state = JobState::Failed;
                j.updated_at = now;
                j.message = Some("interrupted by shutdown".to_string());
                interrupted = true;
            }
        }
        let svc = Self {
            data_dir: data_dir.to_path_buf(),
            client: Client::new(),
            config: Arc::new(Mutex::new(InstallerConfig::default())),
            manifests: Arc::new(Mutex::new(HashMap::new())),
            inner: Arc::new(Mutex::new(Inner {
                jobs: persisted.jobs,
                queue: VecDeque::new(),
                installs: persisted.installs,
                running: false,
            })),
        };
        if interrupted {
            let g = svc.inner.lock().unwrap();
            if let Err(e) = svc.persist_locked(&g) {
                crate::safe_eprintln!("installer: persist after recovery failed: {e:#}");
            }
        }
        svc
    }

    fn load_state(data_dir: &Path) -> PersistedState {
        let p = data_dir.join(STATE_FILE);
        let Ok(s) = std::fs::read_to_string(&p) else {
            return PersistedState::default();
        };
        serde_json::from_str(&s).unwrap_or_default()
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }

    pub fn configure(&self, cfg: InstallerConfig) {
        *self.config.lock().unwrap() = cfg;
    }

    fn config_snapshot(&self) -> InstallerConfig {
        self.config.lock().unwrap().clone()
    }

    /// Register a provider manifest directly, bypassing any remote fetch.
    pub fn set_manifest(&self, provider_id: &str, manifest: ProviderManifest) {
        self.manifests
            .lock()
            .unwrap()
            .insert(provider_id.to_string(), manifest);
    }

    async fn load_manifest(
        &self,
        provider_id: &str,
        cfg: &InstallerConfig,
    ) -> Option<ProviderManifest> {
        if let Some(m) = self.manifests.lock().unwrap().get(provider_id).cloned() {
            return Some(m);
        }
        let base = cfg.manifest_url.as_deref()?.trim_end_matches('/');
        let url = format!("{base}/{provider_id}.json");
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                trace::event(
                    &self.data_dir,
                    None,
                    "Installer",
                    "INSTALL.manifest_fetch",
                    "err",
                    Some(serde_json::json!({"url": url, "status": resp.status().as_u16()})),
                );
                None
            }
            Err(e) => {
                trace::event(
                    &self.data_dir,
                    None,
                    "Installer",
                    "INSTALL.manifest_fetch",
                    "err",
                    Some(serde_json::json!({"url": url, "error": e.to_string()})),
                );
                None
            }
        }
    }

    fn install_dir_for(&self, provider_id: &str) -> PathBuf {
        let cfg = self.config_snapshot();
        match cfg.install_root.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(root) => PathBuf::from(root).join(provider_id),
            None => provider_install_dir(&self.data_dir, provider_id),
        }
    }

    fn persist_locked(&self, g: &Inner) -> Result<()> {
        let snapshot = PersistedState {
            jobs: g.jobs.clone(),
            installs: g.installs.clone(),
        };
        fsio::write_json_pretty(&self.state_path(), &snapshot)
            .context("write installer-state.json failed")
    }

    /// Append a new job to the history and the live queue, then kick the
    /// drain without blocking the caller.
    pub fn start_job(&self, req: StartJobRequest) -> Result<InstallJob> {
        let provider_id = req.provider_id.trim().to_string();
        if provider_id.is_empty() {
            return Err(anyhow!("providerId is required"));
        }
        if req.action == InstallAction::UseExisting
            && req
                .local_path
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(anyhow!("use_existing requires localPath"));
        }

        let now = now_ms();
        let job = InstallJob {
            id: uuid::Uuid::new_v4().to_string(),
            provider_id,
            action: req.action,
            state: JobState::Queued,
            created_at: now,
            updated_at: now,
            message: None,
            local_path: req.local_path.map(|s| s.trim().to_string()),
            artifact: None,
        };
        {
            let mut g = self.inner.lock().unwrap();
            g.jobs.push(job.clone());
            g.queue.push_back(job.id.clone());
            self.persist_locked(&g)?;
        }
        self.kick_drain();
        Ok(job)
    }

    /// Honored only while the job is still queued; once execution has begun
    /// the run completes on its own terms.
    pub fn cancel_job(&self, id: &str) -> Result<InstallJob> {
        let mut g = self.inner.lock().unwrap();
        let job = g
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| anyhow!("unknown install job: {id}"))?;
        if job.state != JobState::Queued {
            return Err(anyhow!(
                "job {id} is {}; only queued jobs can be cancelled",
                job.state.as_str()
            ));
        }
        job.state = JobState::Cancelled;
        job.updated_at = now_ms();
        job.message = Some("cancelled before execution".to_string());
        let snapshot = job.clone();
        g.queue.retain(|q| q != id);
        self.persist_locked(&g)?;
        Ok(snapshot)
    }

    pub fn list_jobs(&self) -> Vec<InstallJob> {
        self.inner.lock().unwrap().jobs.clone()
    }

    pub fn job(&self, id: &str) -> Option<InstallJob> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
    }

    pub fn install_state(&self, provider_id: &str) -> Option<InstallState> {
        self.inner.lock().unwrap().installs.get(provider_id).cloned()
    }

    pub fn install_states(&self) -> BTreeMap<String, InstallState> {
        self.inner.lock().unwrap().installs.clone()
    }

    /// Wait for the queue to fully drain. Used on shutdown so in-flight
    /// installs are not torn down mid-write.
    pub async fn wait_idle(&self) {
        loop {
            {
                let g = self.inner.lock().unwrap();
                if !g.running && g.queue.is_empty() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn kick_drain(&self) {
        {
            let mut g = self.inner.lock().unwrap();
            if g.running {
                return;
            }
            g.running = true;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.drain_loop().await;
        });
    }

    async fn drain_loop(&self) {
        loop {
            let next_id = {
                let mut g = self.inner.lock().unwrap();
                match g.queue.pop_front() {
                    Some(id) => id,
                    None => {
                        g.running = false;
                        return;
                    }
                }
            };
            let Some(job) = self.job(&next_id) else {
                continue;
            };
            if job.state != JobState::Queued {
                continue;
            }
            // Errors become a failed terminal state; the drain itself never
            // propagates them, so one bad job cannot halt the queue.
            if let Err(e) = self.execute(&job).await {
                let code = error_code(&e).unwrap_or_else(|| "E_EXEC_FAILED".to_string());
                self.transition(
                    &job.id,
                    JobState::Failed,
                    Some(format!("{code}: {e:#}")),
                    None,
                );
            }
        }
    }

    fn transition(&self, id: &str, state: JobState, message: Option<String>, artifact: Option<String>) {
        let mut g = self.inner.lock().unwrap();
        let Some(j) = g.jobs.iter_mut().find(|j| j.id == id) else {
            return;
        };
        // Terminal states are final; a raced cancel stays cancelled.
        if j.state.is_terminal() {
            return;
        }
        j.state = state;
        j.updated_at = now_ms();
        if message.is_some() {
            j.message = message;
        }
        if artifact.is_some() {
            j.artifact = artifact;
        }
        let snapshot = j.clone();
        if let Err(e) = self.persist_locked(&g) {
            crate::safe_eprintln!("installer: persist failed: {e:#}");
        }
        if state.is_terminal() {
            let _ = metrics::append_jsonl(
                &self.data_dir,
                &serde_json::json!({
                    "ts_ms": now_ms(),
                    "kind": "install_job",
                    "job_id": snapshot.id,
                    "provider_id": snapshot.provider_id,
                    "action": snapshot.action,
                    "state": snapshot.state,
                    "duration_ms": snapshot.updated_at - snapshot.created_at,
                }),
            );
        }
    }

    fn record_install(&self, provider_id: &str, st: InstallState) {
        let mut g = self.inner.lock().unwrap();
        g.installs.insert(provider_id.to_string(), st);
        if let Err(e) = self.persist_locked(&g) {
            crate::safe_eprintln!("installer: persist failed: {e:#}");
        }
    }

    async fn execute(&self, job: &InstallJob) -> Result<()> {
        let span = Span::start(
            &self.data_dir,
            Some(&job.id),
            "Installer",
            "INSTALL.job",
            Some(serde_json::json!({
                "provider_id": job.provider_id,
                "action": job.action.as_str(),
            })),
        );
        let out = match job.action {
            InstallAction::Install | InstallAction::Update => self.execute_install(job).await,
            InstallAction::Remove => self.execute_remove(job).await,
            InstallAction::UseExisting => self.execute_use_existing(job).await,
        };
        match &out {
            Ok(()) => span.ok(None),
            Err(e) => {
                let code = error_code(e).unwrap_or_else(|| "E_EXEC_FAILED".to_string());
                span.err_anyhow("process", &code, e, None);
            }
        }
        out
    }

    async fn execute_use_existing(&self, job: &InstallJob) -> Result<()> {
        let path = job
            .local_path
            .clone()
            .ok_or_else(|| anyhow!("use_existing requires localPath"))?;
        self.record_install(
            &job.provider_id,
            InstallState {
                provider_id: job.provider_id.clone(),
                installed: true,
                version: None,
                install_path: Some(path),
                source: InstallSource::Existing,
                updated_at: now_ms(),
            },
        );
        self.transition(
            &job.id,
            JobState::Completed,
            Some("using existing installation".to_string()),
            None,
        );
        Ok(())
    }

    async fn execute_remove(&self, job: &InstallJob) -> Result<()> {
        let current = self.install_state(&job.provider_id);
        // Only paths this service created are deleted; an existing-source
        // path belongs to the user and is merely forgotten.
        if current
            .as_ref()
            .map(|s| s.source == InstallSource::Managed)
            .unwrap_or(true)
        {
            let path = current
                .as_ref()
                .and_then(|s| s.install_path.clone())
                .map(PathBuf::from)
                .unwrap_or_else(|| self.install_dir_for(&job.provider_id));
            let _ = std::fs::remove_dir_all(&path);
        }
        self.record_install(
            &job.provider_id,
            InstallState {
                provider_id: job.provider_id.clone(),
                installed: false,
                version: None,
                install_path: None,
                source: InstallSource::None,
                updated_at: now_ms(),
            },
        );
        self.transition(
            &job.id,
            JobState::Completed,
            Some("removed".to_string()),
            None,
        );
        Ok(())
    }

    async fn execute_install(&self, job: &InstallJob) -> Result<()> {
        let cfg = self.config_snapshot();
        let manifest = self.load_manifest(&job.provider_id, &cfg).await;
        let bootstrap = has_python_bootstrap(&job.provider_id);

        if manifest.is_none() && !bootstrap {
            // Nothing managed to fetch or build. Acknowledge the install so
            // the UI can proceed; endpoint and credentials still come from
            // the profile.
            self.record_install(
                &job.provider_id,
                InstallState {
                    provider_id: job.provider_id.clone(),
                    installed: true,
                    version: None,
                    install_path: None,
                    source: InstallSource::Managed,
                    updated_at: now_ms(),
                },
            );
            self.transition(
                &job.id,
                JobState::Completed,
                Some("no managed artifacts; provider is configuration-only".to_string()),
                None,
            );
            return Ok(());
        }

        let dir = self.install_dir_for(&job.provider_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create install dir failed: {}", dir.display()))?;

        let version = manifest.as_ref().and_then(|m| m.version.clone());
        let mut fetched: Vec<PathBuf> = Vec::new();
        if let Some(m) = &manifest {
            for art in &m.artifacts {
                self.transition(
                    &job.id,
                    JobState::Downloading,
                    Some(format!("downloading {}", art.filename)),
                    Some(art.filename.clone()),
                );
                let dest = dir.join(&art.filename);
                self.download_artifact(&art.url, &dest, cfg.download_timeout_secs)
                    .await?;
                self.transition(
                    &job.id,
                    JobState::Verifying,
                    Some(format!("verifying {}", art.filename)),
                    Some(art.filename.clone()),
                );
                if let Err(e) = verify_sha256(&dest, &art.sha256) {
                    let _ = std::fs::remove_file(&dest);
                    return Err(e);
                }
                fetched.push(dest);
            }
        }

        self.transition(
            &job.id,
            JobState::Installing,
            Some("installing".to_string()),
            None,
        );
        let mut unpacked: Vec<PathBuf> = Vec::new();
        for f in &fetched {
            let name = f.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name.ends_with(".gz") && !name.ends_with(".tar.gz") {
                let out = f.with_file_name(name.trim_end_matches(".gz"));
                gunzip_file(f, &out)?;
                let _ = std::fs::remove_file(f);
                unpacked.push(out);
            } else {
                unpacked.push(f.clone());
            }
        }
        if bootstrap {
            self.bootstrap_python_env(&dir, &unpacked, cfg.download_timeout_secs)
                .await?;
        }

        self.record_install(
            &job.provider_id,
            InstallState {
                provider_id: job.provider_id.clone(),
                installed: true,
                version,
                install_path: Some(dir.to_string_lossy().into_owned()),
                source: InstallSource::Managed,
                updated_at: now_ms(),
            },
        );
        self.transition(
            &job.id,
            JobState::Completed,
            Some("installed".to_string()),
            None,
        );
        Ok(())
    }

    async fn download_artifact(&self, url: &str, dest: &Path, timeout_secs: u64) -> Result<()> {
        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let part = dest.with_file_name(format!("{file_name}.part"));
        let fut = async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .with_context(|| format!("artifact request failed: {url}"))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(provider_err(
                    &format!("E_HTTP_STATUS_{}", status.as_u16()),
                    format!("artifact download failed: {url}"),
                ));
            }
            let mut f = tokio::fs::File::create(&part)
                .await
                .with_context(|| format!("create {} failed", part.display()))?;
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let bytes = chunk.context("artifact stream read failed")?;
                f.write_all(&bytes).await.context("artifact write failed")?;
            }
            f.flush().await.context("artifact flush failed")?;
            Ok(())
        };
        match tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await {
            Ok(Ok(())) => {
                tokio::fs::rename(&part, dest)
                    .await
                    .with_context(|| format!("finalize {} failed", dest.display()))?;
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = std::fs::remove_file(&part);
                Err(e)
            }
            Err(_) => {
                let _ = std::fs::remove_file(&part);
                Err(provider_err(
                    "E_TIMEOUT",
                    format!("artifact download exceeded {timeout_secs}s: {url}"),
                ))
            }
        }
    }

    async fn bootstrap_python_env(
        &self,
        install_dir: &Path,
        artifacts: &[PathBuf],
        timeout_secs: u64,
    ) -> Result<()> {
        let venv = install_dir.join("venv");
        let python = std::env::var("VOXTRAY_PYTHON").unwrap_or_else(|_| {
            if cfg!(windows) {
                "python".to_string()
            } else {
                "python3".to_string()
            }
        });
        if !venv.exists() {
            let mut cmd = Command::new(&python);
            cmd.arg("-m").arg("venv").arg(&venv);
            run_checked(cmd, "create python venv", timeout_secs).await?;
        }
        let vpy = venv_python(&venv);

        let mut cmd = Command::new(&vpy);
        cmd.args(["-m", "pip", "install", "--upgrade", "pip"]);
        run_checked(cmd, "upgrade pip", timeout_secs).await?;

        let wheels: Vec<&PathBuf> = artifacts.iter().filter(|p| is_pip_installable(p)).collect();
        if wheels.is_empty() {
            let mut cmd = Command::new(&vpy);
            cmd.args(["-m", "pip", "install", "-U", "faster-whisper"]);
            run_checked(cmd, "install default engine", timeout_secs).await?;
        } else {
            for w in &wheels {
                let mut cmd = Command::new(&vpy);
                cmd.args(["-m", "pip", "install"]).arg(w);
                run_checked(cmd, "install worker artifact", timeout_secs).await?;
            }
            let mut cmd = Command::new(&vpy);
            cmd.args(["-m", STT_WORKER_MODULE, "--selftest"]);
            run_checked(cmd, "worker selftest", timeout_secs).await?;
        }
        Ok(())
    }
}
