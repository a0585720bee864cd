use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShortcutStep {
    RecordToggle,
    RecordPressToTalk,
    RecordHoldToTalk,
    ScreenshotCapture,
    #[serde(rename_all = "camelCase")]
    OcrExtract {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_id: Option<String>,
    },
    AssistantPrompt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    OutputText {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>, // paste|clipboard
    },
}

impl ShortcutStep {
    pub fn is_recording(&self) -> bool {
        matches!(
            self,
            ShortcutStep::RecordToggle
                | ShortcutStep::RecordPressToTalk
                | ShortcutStep::RecordHoldToTalk
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutDefinition {
    pub id: String,
    pub label: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub shortcut: String,
    #[serde(default)]
    pub steps: Vec<ShortcutStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAssistantShortcut {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub shortcut: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Flat pre-ShortcutDefinition keys, handed over by the config normalizer.
#[derive(Debug, Clone, Default)]
pub struct LegacyShortcutFields {
    pub hotkey: Option<String>,
    pub hold_to_talk: Option<bool>,
    pub assistant_shortcuts: Option<Vec<LegacyAssistantShortcut>>,
}

impl LegacyShortcutFields {
    fn is_empty(&self) -> bool {
        self.hotkey.is_none() && self.hold_to_talk.is_none() && self.assistant_shortcuts.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortcut_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

pub fn normalized_accelerator(raw: &str) -> String {
    raw.split('+')
        .map(|part| part.trim().to_ascii_uppercase())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("+")
}

fn issue(code: &str, message: String, shortcut_id: Option<&str>) -> ValidationIssue {
    ValidationIssue {
        code: code.to_string(),
        message,
        shortcut_id: shortcut_id.map(|s| s.to_string()),
    }
}

/// All rules must pass before a shortcut configuration is accepted.
/// Structure rules apply to every definition; activity rules (accelerator
/// conflicts, recording exclusivity, OCR provider match) only to enabled ones.
pub fn validate_shortcuts(
    defs: &[ShortcutDefinition],
    active_ocr_provider_id: &str,
) -> ValidationReport {
    let mut errors: Vec<ValidationIssue> = Vec::new();
    let warnings: Vec<ValidationIssue> = Vec::new();

    // Enabled accelerators must be pairwise distinct.
    let enabled: Vec<&ShortcutDefinition> = defs.iter().filter(|d| d.enabled).collect();
    for (i, a) in enabled.iter().enumerate() {
        let na = normalized_accelerator(&a.shortcut);
        if na.is_empty() {
            errors.push(issue(
                "VALIDATION_FAILED",
                format!("shortcut '{}' has an empty accelerator", a.label),
                Some(&a.id),
            ));
            continue;
        }
        for b in enabled.iter().skip(i + 1) {
            if normalized_accelerator(&b.shortcut) == na {
                errors.push(issue(
                    "SHORTCUT_CONFLICT",
                    format!(
                        "shortcuts '{}' and '{}' share accelerator {}",
                        a.label, b.label, na
                    ),
                    Some(&b.id),
                ));
            }
        }
    }

    // At most one enabled shortcut may record.
    let recorders: Vec<&ShortcutDefinition> = enabled
        .iter()
        .copied()
        .filter(|d| d.steps.iter().any(ShortcutStep::is_recording))
        .collect();
    if recorders.len() > 1 {
        let ids: Vec<&str> = recorders.iter().map(|d| d.id.as_str()).collect();
        errors.push(issue(
            "MULTIPLE_RECORDING_SHORTCUTS",
            format!("only one enabled shortcut may record (found: {})", ids.join(", ")),
            None,
        ));
    }

    for d in defs {
        let mut screenshot_seen = false;
        for step in &d.steps {
            match step {
                ShortcutStep::ScreenshotCapture => screenshot_seen = true,
                ShortcutStep::OcrExtract { provider_id } => {
                    if !screenshot_seen {
                        errors.push(issue(
                            "OCR_REQUIRES_SCREENSHOT",
                            format!(
                                "shortcut '{}' runs ocr_extract without a preceding screenshot_capture",
                                d.label
                            ),
                            Some(&d.id),
                        ));
                    }
                    if d.enabled {
                        if let Some(pid) = provider_id.as_deref() {
                            if pid != active_ocr_provider_id {
                                errors.push(issue(
                                    "OCR_PROVIDER_INACTIVE",
                                    format!(
                                        "shortcut '{}' is bound to OCR provider {pid}, but {active_ocr_provider_id} is active",
                                        d.label
                                    ),
                                    Some(&d.id),
                                ));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // A pipeline that never records must deliver its result.
        let records = d.steps.iter().any(ShortcutStep::is_recording);
        let ends_with_output = matches!(d.steps.last(), Some(ShortcutStep::OutputText { .. }));
        if !records && !ends_with_output {
            errors.push(issue(
                "PIPELINE_TERMINAL_REQUIRED",
                format!("shortcut '{}' must end with output_text", d.label),
                Some(&d.id),
            ));
        }
    }

    ValidationReport {
        ok: errors.is_empty(),
        errors,
        warnings,
    }
}

pub fn default_shortcuts() -> Vec<ShortcutDefinition> {
    vec![ShortcutDefinition {
        id: "recording_main".to_string(),
        label: "Dictate".to_string(),
        enabled: true,
        shortcut: "CommandOrControl+Shift+Space".to_string(),
        steps: vec![
            ShortcutStep::RecordToggle,
            ShortcutStep::OutputText { mode: None },
        ],
    }]
}

/// Translate flat legacy hotkey fields into shortcut definitions. Runs on
/// every load; already-migrated input passes through untouched, and ids are
/// deterministic so a replay converges instead of duplicating.
pub fn normalize_shortcut_config(
    existing: Vec<ShortcutDefinition>,
    legacy: LegacyShortcutFields,
) -> Vec<ShortcutDefinition> {
    let mut out = existing;
    if legacy.is_empty() {
        return out;
    }

    if let Some(hotkey) = legacy.hotkey.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        if !out.iter().any(|d| d.id == "recording_main") {
            let record_step = if legacy.hold_to_talk == Some(true) {
                ShortcutStep::RecordHoldToTalk
            } else {
                ShortcutStep::RecordToggle
            };
            out.push(ShortcutDefinition {
                id: "recording_main".to_string(),
                label: "Dictate".to_string(),
                enabled: true,
                shortcut: hotkey.to_string(),
                steps: vec![record_step, ShortcutStep::OutputText { mode: None }],
            });
        }
    }

    for (i, a) in legacy.assistant_shortcuts.iter().flatten().enumerate() {
        let id = format!("assistant_{}", i + 1);
        let accel = a.shortcut.trim();
        if accel.is_empty() || out.iter().any(|d| d.id == id) {
            continue;
        }
        out.push(ShortcutDefinition {
            id,
            label: a
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("Assistant {}", i + 1)),
            enabled: true,
            shortcut: accel.to_string(),
            steps: vec![
                ShortcutStep::AssistantPrompt {
                    prompt: a.prompt.clone(),
                },
                ShortcutStep::OutputText { mode: None },
            ],
        });
    }

    out
}
