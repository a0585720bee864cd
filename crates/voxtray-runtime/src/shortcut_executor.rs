use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

use crate::{
    metrics,
    orchestrator::Orchestrator,
    provider::{error_code, LlmRequest, OcrRequest, SttRequest},
    shortcuts::{ShortcutDefinition, ShortcutStep},
    trace::{now_ms, Span},
};

/// Audio handed over by the platform recording layer once the user
/// finishes the record interaction.
#[derive(Debug, Clone)]
pub struct RecordedAudio {
    pub audio: Vec<u8>,
    pub extension: String,
}

/// Platform seam: global hotkey handling and actual microphone capture
/// live outside this crate; a pipeline only sees the finished take.
#[async_trait]
pub trait RecordingSource: Send + Sync {
    async fn record(&self, step: &ShortcutStep) -> Result<RecordedAudio>;
}

/// Platform seam: region/screen selection UI lives outside this crate.
#[async_trait]
pub trait ScreenshotSource: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>>;
}

/// Platform seam: paste/clipboard automation. `mode` is the step's
/// `output_text` mode (`paste` when unset).
#[async_trait]
pub trait TextSink: Send + Sync {
    async fn deliver(&self, text: &str, mode: Option<&str>) -> Result<()>;
}

fn step_name(step: &ShortcutStep) -> &'static str {
    match step {
        ShortcutStep::RecordToggle => "record_toggle",
        ShortcutStep::RecordPressToTalk => "record_press_to_talk",
        ShortcutStep::RecordHoldToTalk => "record_hold_to_talk",
        ShortcutStep::ScreenshotCapture => "screenshot_capture",
        ShortcutStep::OcrExtract { .. } => "ocr_extract",
        ShortcutStep::AssistantPrompt { .. } => "assistant_prompt",
        ShortcutStep::OutputText { .. } => "output_text",
    }
}

/// Intermediate results threaded between steps of one pipeline run.
#[derive(Default)]
struct PipelineContext {
    text: Option<String>,
    image: Option<Vec<u8>>,
}

struct ExecQueue {
    pending: VecDeque<ShortcutDefinition>,
    running: bool,
}

/// Serial shortcut pipeline runner. Triggered pipelines queue FIFO and
/// never interleave: a second trigger waits for the first run to finish
/// end to end. A failing step aborts the rest of its pipeline; the queue
/// itself keeps draining.
#[derive(Clone)]
pub struct ShortcutExecutor {
    data_dir: PathBuf,
    orchestrator: Orchestrator,
    recording: Arc<dyn RecordingSource>,
    screenshot: Arc<dyn ScreenshotSource>,
    sink: Arc<dyn TextSink>,
    busy: Arc<AtomicBool>,
    queue: Arc<Mutex<ExecQueue>>,
}

impl ShortcutExecutor {
    pub fn new(
        data_dir: &Path,
        orchestrator: Orchestrator,
        recording: Arc<dyn RecordingSource>,
        screenshot: Arc<dyn ScreenshotSource>,
        sink: Arc<dyn TextSink>,
    ) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            orchestrator,
            recording,
            screenshot,
            sink,
            busy: Arc::new(AtomicBool::new(false)),
            queue: Arc::new(Mutex::new(ExecQueue {
                pending: VecDeque::new(),
                running: false,
            })),
        }
    }

    /// True while a pipeline run is in flight. The tray uses this to flip
    /// its busy indicator.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Enqueue a pipeline run and return immediately. Failures surface
    /// through the trace/metrics stream, not to the hotkey handler.
    pub fn trigger(&self, def: ShortcutDefinition) {
        {
            let mut q = self.queue.lock().unwrap();
            q.pending.push_back(def);
            if q.running {
                return;
            }
            q.running = true;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.drain().await;
        });
    }

    pub async fn wait_idle(&self) {
        loop {
            {
                let q = self.queue.lock().unwrap();
                if !q.running && q.pending.is_empty() {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    async fn drain(&self) {
        loop {
            let def = {
                let mut q = self.queue.lock().unwrap();
                match q.pending.pop_front() {
                    Some(d) => d,
                    None => {
                        q.running = false;
                        return;
                    }
                }
            };
            self.busy.store(true, Ordering::SeqCst);
            self.run_pipeline(&def).await;
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    async fn run_pipeline(&self, def: &ShortcutDefinition) {
        let task_id = uuid::Uuid::new_v4().to_string();
        let started = now_ms();
        let span = Span::start(
            &self.data_dir,
            Some(&task_id),
            "Shortcut",
            "PIPELINE.run",
            Some(serde_json::json!({
                "shortcut_id": def.id,
                "label": def.label,
                "steps": def.steps.len(),
            })),
        );
        let out = self.run_steps(def).await;
        let mut code = None;
        match &out {
            Ok(()) => span.ok(None),
            Err(e) => {
                let c = error_code(e).unwrap_or_else(|| "E_EXEC_FAILED".to_string());
                span.err_anyhow("pipeline", &c, e, None);
                crate::safe_eprintln!("shortcut '{}' failed: {e:#}", def.label);
                code = Some(c);
            }
        }
        let _ = metrics::append_jsonl(
            &self.data_dir,
            &serde_json::json!({
                "ts_ms": now_ms(),
                "kind": "shortcut_run",
                "shortcut_id": def.id,
                "ok": out.is_ok(),
                "error_code": code,
                "steps": def.steps.len(),
                "duration_ms": now_ms() - started,
            }),
        );
    }

    // Strict declared order; the first error aborts the remainder.
    async fn run_steps(&self, def: &ShortcutDefinition) -> Result<()> {
        let mut ctx = PipelineContext::default();
        for (idx, step) in def.steps.iter().enumerate() {
            self.run_step(step, &mut ctx)
                .await
                .with_context(|| format!("step {} ({}) failed", idx + 1, step_name(step)))?;
        }
        Ok(())
    }

    async fn run_step(&self, step: &ShortcutStep, ctx: &mut PipelineContext) -> Result<()> {
        match step {
            ShortcutStep::RecordToggle
            | ShortcutStep::RecordPressToTalk
            | ShortcutStep::RecordHoldToTalk => {
                let take = self.recording.record(step).await?;
                let result = self
                    .orchestrator
                    .transcribe_from_buffer(
                        &take.audio,
                        Some(&take.extension),
                        SttRequest::default(),
                    )
                    .await?;
                ctx.text = Some(result.text);
            }
            ShortcutStep::ScreenshotCapture => {
                ctx.image = Some(self.screenshot.capture().await?);
            }
            ShortcutStep::OcrExtract { .. } => {
                // Provider binding was checked at validation time; runtime
                // always dispatches to the active OCR provider.
                let image = ctx
                    .image
                    .take()
                    .ok_or_else(|| anyhow!("ocr_extract ran without a captured screenshot"))?;
                let result = self
                    .orchestrator
                    .extract_ocr(OcrRequest {
                        image: Some(image),
                        ..Default::default()
                    })
                    .await?;
                ctx.text = Some(result.text);
            }
            ShortcutStep::AssistantPrompt { prompt } => {
                let built = build_prompt(prompt.as_deref(), ctx.text.as_deref())?;
                let result = self
                    .orchestrator
                    .respond_llm(LlmRequest {
                        prompt: Some(built),
                        ..Default::default()
                    })
                    .await?;
                ctx.text = Some(result.text);
            }
            ShortcutStep::OutputText { mode } => {
                let text = ctx
                    .text
                    .as_deref()
                    .ok_or_else(|| anyhow!("output_text ran with no text to deliver"))?;
                self.sink.deliver(text, mode.as_deref()).await?;
            }
        }
        Ok(())
    }
}

/// `{text}` in a template is replaced by the pipeline text; a template
/// without the placeholder gets the text appended; no template means the
/// pipeline text itself is the prompt.
fn build_prompt(template: Option<&str>, pipeline_text: Option<&str>) -> Result<String> {
    let template = template.map(str::trim).filter(|t| !t.is_empty());
    match (template, pipeline_text) {
        (None, None) => Err(anyhow!("assistant_prompt has no prompt and no pipeline text")),
        (None, Some(text)) => Ok(text.to_string()),
        (Some(t), None) => Ok(t.replace("{text}", "")),
        (Some(t), Some(text)) => {
            if t.contains("{text}") {
                Ok(t.replace("{text}", text))
            } else {
                Ok(format!("{t}\n\n{text}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::InstallerService;
    use crate::provider::{
        Capability, LlmProvider, LlmResult, OcrProvider, OcrResult, ProviderDescriptor,
        ProviderHandle, ProviderKind, ProviderRegistry, ProviderStatus,
        PROVIDER_LLM_OPENAI_COMPATIBLE, PROVIDER_OCR_TESSERACT_CLI, PROVIDER_STT_WHISPER_CLI,
    };
    use std::time::Duration;

    type EventLog = Arc<Mutex<Vec<String>>>;

    fn descriptor(id: &str, capability: Capability) -> ProviderDescriptor {
        ProviderDescriptor {
            id: id.to_string(),
            capability,
            display_name: id.to_string(),
            kind: ProviderKind::Local,
            requires_install: false,
            supports_local_path: false,
        }
    }

    struct EchoLlm {
        descriptor: ProviderDescriptor,
        log: EventLog,
        slow_prompt: Option<String>,
    }

    #[async_trait]
    impl LlmProvider for EchoLlm {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.descriptor
        }

        fn status(&self) -> ProviderStatus {
            ProviderStatus::ready()
        }

        async fn respond(&self, req: LlmRequest) -> Result<LlmResult> {
            let prompt = req.prompt.unwrap_or_default();
            self.log.lock().unwrap().push(format!("start-{prompt}"));
            if self.slow_prompt.as_deref() == Some(prompt.as_str()) {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            Ok(LlmResult { text: prompt })
        }
    }

    struct FixedOcr {
        descriptor: ProviderDescriptor,
        reply: String,
    }

    #[async_trait]
    impl OcrProvider for FixedOcr {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.descriptor
        }

        fn status(&self) -> ProviderStatus {
            ProviderStatus::ready()
        }

        async fn extract_text(&self, req: OcrRequest) -> Result<OcrResult> {
            assert!(req.image.is_some(), "pipeline hands the captured image over");
            Ok(OcrResult {
                text: self.reply.clone(),
            })
        }
    }

    struct FixedRecording {
        audio: Vec<u8>,
    }

    #[async_trait]
    impl RecordingSource for FixedRecording {
        async fn record(&self, _step: &ShortcutStep) -> Result<RecordedAudio> {
            Ok(RecordedAudio {
                audio: self.audio.clone(),
                extension: "wav".to_string(),
            })
        }
    }

    struct NoRecording;

    #[async_trait]
    impl RecordingSource for NoRecording {
        async fn record(&self, _step: &ShortcutStep) -> Result<RecordedAudio> {
            Err(anyhow!("recording not wired in this test"))
        }
    }

    struct FixedScreenshot {
        image: Vec<u8>,
    }

    #[async_trait]
    impl ScreenshotSource for FixedScreenshot {
        async fn capture(&self) -> Result<Vec<u8>> {
            Ok(self.image.clone())
        }
    }

    struct FailingScreenshot;

    #[async_trait]
    impl ScreenshotSource for FailingScreenshot {
        async fn capture(&self) -> Result<Vec<u8>> {
            Err(anyhow!("screen capture denied"))
        }
    }

    struct LogSink {
        log: EventLog,
    }

    #[async_trait]
    impl TextSink for LogSink {
        async fn deliver(&self, text: &str, mode: Option<&str>) -> Result<()> {
            let mode = mode.unwrap_or("paste");
            self.log.lock().unwrap().push(format!("end-{text}@{mode}"));
            Ok(())
        }
    }

    struct Fixture {
        executor: ShortcutExecutor,
        log: EventLog,
        _td: tempfile::TempDir,
    }

    fn fixture(
        recording: Arc<dyn RecordingSource>,
        screenshot: Arc<dyn ScreenshotSource>,
        slow_prompt: Option<&str>,
        ocr_reply: &str,
    ) -> Fixture {
        let td = tempfile::tempdir().expect("tempdir");
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let registry = ProviderRegistry::new();
        registry.register(ProviderHandle::Llm(Arc::new(EchoLlm {
            descriptor: descriptor(PROVIDER_LLM_OPENAI_COMPATIBLE, Capability::Llm),
            log: log.clone(),
            slow_prompt: slow_prompt.map(|s| s.to_string()),
        })));
        registry.register(ProviderHandle::Ocr(Arc::new(FixedOcr {
            descriptor: descriptor(PROVIDER_OCR_TESSERACT_CLI, Capability::Ocr),
            reply: ocr_reply.to_string(),
        })));
        registry.register(crate::provider::tests::fixed_stt(
            PROVIDER_STT_WHISPER_CLI,
            "Local Whisper",
            "dictated words",
        ));
        let orchestrator = Orchestrator::new(
            td.path(),
            registry,
            InstallerService::new(td.path()),
        );
        let executor = ShortcutExecutor::new(
            td.path(),
            orchestrator,
            recording,
            screenshot,
            Arc::new(LogSink { log: log.clone() }),
        );
        Fixture {
            executor,
            log,
            _td: td,
        }
    }

    fn assistant_shortcut(id: &str, prompt: &str) -> ShortcutDefinition {
        ShortcutDefinition {
            id: id.to_string(),
            label: id.to_string(),
            enabled: true,
            shortcut: format!("F{}", id.len()),
            steps: vec![
                ShortcutStep::AssistantPrompt {
                    prompt: Some(prompt.to_string()),
                },
                ShortcutStep::OutputText { mode: None },
            ],
        }
    }

    #[tokio::test]
    async fn queued_pipelines_run_strictly_one_after_another() {
        let f = fixture(
            Arc::new(NoRecording),
            Arc::new(FailingScreenshot),
            Some("one"),
            "",
        );
        f.executor.trigger(assistant_shortcut("a", "one"));
        f.executor.trigger(assistant_shortcut("b", "two"));
        f.executor.wait_idle().await;

        let events = f.log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["start-one", "end-one@paste", "start-two", "end-two@paste"],
            "the slow first run finishes before the second starts"
        );
        assert!(!f.executor.is_busy());
    }

    #[tokio::test]
    async fn busy_flag_is_up_for_the_duration_of_a_run() {
        let f = fixture(
            Arc::new(NoRecording),
            Arc::new(FailingScreenshot),
            Some("slow"),
            "",
        );
        f.executor.trigger(assistant_shortcut("a", "slow"));
        let mut saw_busy = false;
        for _ in 0..100 {
            if f.executor.is_busy() {
                saw_busy = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(saw_busy, "busy flag raised while the pipeline runs");
        f.executor.wait_idle().await;
        assert!(!f.executor.is_busy(), "busy flag dropped at run end");
    }

    #[tokio::test]
    async fn screenshot_ocr_assistant_output_threads_text_through() {
        let f = fixture(
            Arc::new(NoRecording),
            Arc::new(FixedScreenshot {
                image: b"\x89PNG fake".to_vec(),
            }),
            None,
            "recognized words",
        );
        f.executor.trigger(ShortcutDefinition {
            id: "grab".to_string(),
            label: "Grab".to_string(),
            enabled: true,
            shortcut: "F6".to_string(),
            steps: vec![
                ShortcutStep::ScreenshotCapture,
                ShortcutStep::OcrExtract { provider_id: None },
                ShortcutStep::AssistantPrompt {
                    prompt: Some("Summarize: {text}".to_string()),
                },
                ShortcutStep::OutputText {
                    mode: Some("clipboard".to_string()),
                },
            ],
        });
        f.executor.wait_idle().await;

        let events = f.log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "start-Summarize: recognized words",
                "end-Summarize: recognized words@clipboard",
            ]
        );
    }

    #[tokio::test]
    async fn recording_pipeline_transcribes_and_delivers() {
        let f = fixture(
            Arc::new(FixedRecording {
                audio: b"RIFF....WAVE".to_vec(),
            }),
            Arc::new(FailingScreenshot),
            None,
            "",
        );
        f.executor.trigger(ShortcutDefinition {
            id: "dictate".to_string(),
            label: "Dictate".to_string(),
            enabled: true,
            shortcut: "F9".to_string(),
            steps: vec![
                ShortcutStep::RecordToggle,
                ShortcutStep::OutputText { mode: None },
            ],
        });
        f.executor.wait_idle().await;

        let events = f.log.lock().unwrap().clone();
        assert_eq!(events, vec!["end-dictated words@paste"]);
    }

    #[tokio::test]
    async fn failing_step_aborts_the_pipeline_but_not_the_queue() {
        let f = fixture(
            Arc::new(NoRecording),
            Arc::new(FailingScreenshot),
            None,
            "never seen",
        );
        f.executor.trigger(ShortcutDefinition {
            id: "broken".to_string(),
            label: "Broken".to_string(),
            enabled: true,
            shortcut: "F6".to_string(),
            steps: vec![
                ShortcutStep::ScreenshotCapture,
                ShortcutStep::OcrExtract { provider_id: None },
                ShortcutStep::OutputText { mode: None },
            ],
        });
        f.executor.trigger(assistant_shortcut("after", "still runs"));
        f.executor.wait_idle().await;

        let events = f.log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["start-still runs", "end-still runs@paste"],
            "no ocr/output events from the aborted pipeline"
        );
    }

    #[test]
    fn prompt_template_substitution_rules() {
        assert_eq!(
            build_prompt(Some("Fix: {text}"), Some("teh text")).unwrap(),
            "Fix: teh text"
        );
        assert_eq!(
            build_prompt(Some("Translate this."), Some("bonjour")).unwrap(),
            "Translate this.\n\nbonjour"
        );
        assert_eq!(build_prompt(None, Some("raw")).unwrap(), "raw");
        assert_eq!(build_prompt(Some("Standalone ask."), None).unwrap(), "Standalone ask.");
        assert!(build_prompt(None, None).is_err());
    }
}
