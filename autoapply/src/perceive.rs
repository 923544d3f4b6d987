//! Perception: turns the live page into a [`PerceptionSnapshot`].
//!
//! The structural element list comes from one enumeration script; the
//! optional visual summary comes from a screenshot sent to the vision model.
//! Vision problems degrade to a placeholder summary and never fail a capture.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::perception::{PerceptionSnapshot, RawCandidate, SnapshotLimits};
use crate::io::browser::{BrowserDriver, BrowserError};
use crate::io::model::{ModelError, VisionModel};

pub const ENUMERATE_SCRIPT: &str = include_str!("scripts/enumerate.js");

/// Why a screen description could not be produced.
#[derive(Debug, Error)]
pub enum ScreenError {
    #[error("vision is disabled")]
    Disabled,
    #[error("screenshot failed: {0}")]
    Browser(#[from] BrowserError),
    #[error("read screenshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone)]
pub struct VisionSettings {
    pub model: String,
    /// Fixed page-health prompt used for every capture.
    pub prompt: String,
    /// Overwritten on every capture.
    pub screenshot_path: PathBuf,
}

/// Builds snapshots for one browser session and owns the generation counter.
#[derive(Debug, Clone)]
pub struct PerceptionBuilder {
    generation: u64,
    limits: SnapshotLimits,
    vision: Option<VisionSettings>,
}

impl PerceptionBuilder {
    pub fn new(limits: SnapshotLimits, vision: Option<VisionSettings>) -> Self {
        Self {
            generation: 0,
            limits,
            vision,
        }
    }

    /// Generation of the most recent capture; 0 before the first.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Enumerate, filter and number the page's interactive elements.
    ///
    /// Element IDs from earlier captures stop resolving on the page because
    /// every capture re-tags candidates under a new generation.
    #[instrument(skip_all, fields(generation = self.generation + 1))]
    pub fn capture<D, V>(
        &mut self,
        driver: &mut D,
        vision: &V,
    ) -> Result<PerceptionSnapshot, BrowserError>
    where
        D: BrowserDriver + ?Sized,
        V: VisionModel + ?Sized,
    {
        self.generation += 1;
        let generation = self.generation;
        let raw = driver.execute_script(ENUMERATE_SCRIPT, vec![json!(generation)])?;
        let candidates: Vec<RawCandidate> = serde_json::from_value(raw)
            .map_err(|err| BrowserError::Script(format!("unexpected enumeration result: {err}")))?;
        let snapshot =
            PerceptionSnapshot::from_candidates(generation, candidates, self.limits, Utc::now());
        debug!(
            elements = snapshot.len(),
            omitted = snapshot.omitted,
            "captured snapshot"
        );

        let Some(settings) = &self.vision else {
            return Ok(snapshot);
        };
        let summary = match describe(driver, vision, settings, &settings.prompt) {
            Ok(text) => text.trim().to_string(),
            Err(ScreenError::Browser(err)) if err.is_session_fatal() => return Err(err),
            Err(err) => {
                warn!(error = %err, "visual summary unavailable");
                format!("(visual summary unavailable: {err})")
            }
        };
        Ok(snapshot.with_visual_summary(summary))
    }

    /// Ask the vision model a free-form question about the current screen.
    pub fn look<D, V>(&self, driver: &mut D, vision: &V, prompt: &str) -> Result<String, ScreenError>
    where
        D: BrowserDriver + ?Sized,
        V: VisionModel + ?Sized,
    {
        let settings = self.vision.as_ref().ok_or(ScreenError::Disabled)?;
        describe(driver, vision, settings, prompt)
    }
}

fn describe<D, V>(
    driver: &mut D,
    vision: &V,
    settings: &VisionSettings,
    prompt: &str,
) -> Result<String, ScreenError>
where
    D: BrowserDriver + ?Sized,
    V: VisionModel + ?Sized,
{
    if let Some(parent) = settings.screenshot_path.parent() {
        fs::create_dir_all(parent).map_err(|source| ScreenError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    driver.screenshot(&settings.screenshot_path)?;
    let png = fs::read(&settings.screenshot_path).map_err(|source| ScreenError::Io {
        path: settings.screenshot_path.clone(),
        source,
    })?;
    Ok(vision.describe(&settings.model, prompt, &png)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeBrowser, ScriptedModel, candidate};

    fn vision_settings(dir: &std::path::Path) -> VisionSettings {
        VisionSettings {
            model: "llava".to_string(),
            prompt: "Describe the page.".to_string(),
            screenshot_path: dir.join("screens").join("w.png"),
        }
    }

    #[test]
    fn hidden_candidates_never_reach_the_snapshot() {
        let browser = FakeBrowser::new();
        let mut hidden_type = candidate("input", "");
        hidden_type.input_type = Some("hidden".to_string());
        let mut inline_none = candidate("button", "Ghost");
        inline_none.inline_style = "color: red; display: none".to_string();
        let mut inline_hidden = candidate("a", "Invisible");
        inline_hidden.inline_style = "visibility:hidden".to_string();
        browser.set_page(vec![
            candidate("button", "Apply"),
            hidden_type,
            inline_none,
            inline_hidden,
            candidate("input", "Email"),
        ]);

        let mut builder = PerceptionBuilder::new(SnapshotLimits::default(), None);
        let mut driver = browser.clone();
        let snapshot = builder
            .capture(&mut driver, &ScriptedModel::new())
            .expect("capture");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.element(1).map(|e| e.visible_text.as_str()), Some("Apply"));
        assert_eq!(snapshot.element(2).map(|e| e.tag.as_str()), Some("input"));
        assert!(snapshot.visual_summary.is_empty());
    }

    #[test]
    fn each_capture_uses_a_new_generation() {
        let browser = FakeBrowser::new();
        browser.set_page(vec![candidate("button", "Next")]);
        let mut builder = PerceptionBuilder::new(SnapshotLimits::default(), None);
        let mut driver = browser.clone();
        let model = ScriptedModel::new();

        let first = builder.capture(&mut driver, &model).expect("first");
        let second = builder.capture(&mut driver, &model).expect("second");
        assert_eq!(first.generation + 1, second.generation);
        let (_, handle) = second.resolve(1).expect("resolve");
        assert_eq!(handle.generation, second.generation);
        assert_eq!(builder.generation(), 2);
    }

    #[test]
    fn vision_summary_is_attached() {
        let temp = tempfile::tempdir().expect("tempdir");
        let browser = FakeBrowser::new();
        browser.set_page(vec![candidate("button", "Submit")]);
        let model = ScriptedModel::new().with_vision(["A red banner says: Email is required."]);
        let mut builder =
            PerceptionBuilder::new(SnapshotLimits::default(), Some(vision_settings(temp.path())));
        let mut driver = browser.clone();

        let snapshot = builder.capture(&mut driver, &model).expect("capture");
        assert_eq!(snapshot.visual_summary, "A red banner says: Email is required.");
        assert_eq!(model.vision_prompts(), vec!["Describe the page.".to_string()]);
    }

    #[test]
    fn vision_failure_degrades_to_placeholder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let browser = FakeBrowser::new();
        browser.set_page(vec![candidate("button", "Submit")]);
        let model = ScriptedModel::new()
            .with_vision_error(ModelError::Timeout("vision took too long".to_string()));
        let mut builder =
            PerceptionBuilder::new(SnapshotLimits::default(), Some(vision_settings(temp.path())));
        let mut driver = browser.clone();

        let snapshot = builder.capture(&mut driver, &model).expect("capture");
        assert_eq!(snapshot.len(), 1);
        assert!(
            snapshot
                .visual_summary
                .starts_with("(visual summary unavailable: "),
            "{}",
            snapshot.visual_summary
        );
    }

    #[test]
    fn lost_session_during_enumeration_is_returned() {
        let browser = FakeBrowser::new();
        browser.fail_next_script(BrowserError::SessionLost("chrome exited".to_string()));
        let mut builder = PerceptionBuilder::new(SnapshotLimits::default(), None);
        let mut driver = browser.clone();
        let err = builder
            .capture(&mut driver, &ScriptedModel::new())
            .expect_err("session lost");
        assert!(err.is_session_fatal());
    }

    #[test]
    fn look_requires_vision() {
        let browser = FakeBrowser::new();
        let builder = PerceptionBuilder::new(SnapshotLimits::default(), None);
        let mut driver = browser.clone();
        let err = builder
            .look(&mut driver, &ScriptedModel::new(), "Is there a CAPTCHA?")
            .expect_err("disabled");
        assert!(matches!(err, ScreenError::Disabled));
    }
}
