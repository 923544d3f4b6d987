//! Test doubles for the browser, the model server and the job store.
//!
//! Compiled for unit tests and, behind the `test-support` feature, for the
//! integration tests in `tests/`.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use serde_json::Value;

use crate::core::perception::{ElementHandle, RawCandidate};
use crate::io::browser::{BrowserDriver, BrowserError, BrowserFactory};
use crate::io::model::{ModelError, TextModel, VisionModel};
use crate::io::store::JobStore;
use crate::perceive::ENUMERATE_SCRIPT;

/// A visible candidate with a non-zero box.
pub fn candidate(tag: &str, text: &str) -> RawCandidate {
    RawCandidate {
        tag: tag.to_string(),
        text: text.to_string(),
        display: "block".to_string(),
        visibility: "visible".to_string(),
        x: 10.0,
        y: 10.0,
        width: 120.0,
        height: 24.0,
        ..RawCandidate::default()
    }
}

/// A visible `<input type=...>` candidate.
pub fn input(input_type: &str, label: &str) -> RawCandidate {
    RawCandidate {
        input_type: Some(input_type.to_string()),
        label: label.to_string(),
        ..candidate("input", "")
    }
}

/// Driver operations that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOp {
    Navigate,
    Script,
    Screenshot,
    Click,
    Type,
    Upload,
    Back,
}

#[derive(Debug, Default)]
struct FakeState {
    url: String,
    page: Vec<RawCandidate>,
    generation: Option<u64>,
    dialog: Option<String>,
    failures: Vec<(FakeOp, BrowserError)>,
    calls: Vec<String>,
    landed: Vec<String>,
}

impl FakeState {
    fn take_failure(&mut self, op: FakeOp) -> Result<(), BrowserError> {
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(idx) => Err(self.failures.remove(idx).1),
            None => Ok(()),
        }
    }

    fn check_handle(&self, element: &ElementHandle) -> Result<(), BrowserError> {
        let current = self.generation == Some(element.generation);
        if current && (element.ordinal as usize) < self.page.len() {
            Ok(())
        } else {
            Err(BrowserError::StaleElement)
        }
    }

    fn blocked_by_dialog(&self) -> Result<(), BrowserError> {
        match &self.dialog {
            Some(text) => Err(BrowserError::UnexpectedDialog(text.clone())),
            None => Ok(()),
        }
    }
}

/// In-memory browser session. Clones share state, so a test can keep a copy
/// to inspect calls while the worker owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeBrowser {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the candidates the enumeration script returns.
    pub fn set_page(&self, page: Vec<RawCandidate>) {
        self.lock().page = page;
    }

    pub fn open_dialog(&self, text: &str) {
        self.lock().dialog = Some(text.to_string());
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: FakeOp, err: BrowserError) {
        self.lock().failures.push((op, err));
    }

    pub fn fail_next_script(&self, err: BrowserError) {
        self.fail_next(FakeOp::Script, err);
    }

    /// Every driver call so far, e.g. `click 3:0` or `navigate https://...`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Markers of native clicks that reached a live element.
    pub fn landed_clicks(&self) -> Vec<String> {
        self.lock().landed.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

impl BrowserDriver for FakeBrowser {
    fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        let mut state = self.lock();
        state.calls.push(format!("navigate {url}"));
        state.take_failure(FakeOp::Navigate)?;
        state.url = url.to_string();
        Ok(())
    }

    fn current_url(&mut self) -> Result<String, BrowserError> {
        Ok(self.lock().url.clone())
    }

    fn page_source(&mut self) -> Result<String, BrowserError> {
        Ok("<html><body></body></html>".to_string())
    }

    fn screenshot(&mut self, path: &Path) -> Result<(), BrowserError> {
        let mut state = self.lock();
        state.calls.push("screenshot".to_string());
        state.take_failure(FakeOp::Screenshot)?;
        fs::write(path, [0x89, b'P', b'N', b'G']).map_err(|err| BrowserError::Protocol(err.to_string()))
    }

    fn execute_script(&mut self, script: &str, args: Vec<Value>) -> Result<Value, BrowserError> {
        let mut state = self.lock();
        state.take_failure(FakeOp::Script)?;
        state.blocked_by_dialog()?;
        if script == ENUMERATE_SCRIPT {
            state.calls.push("enumerate".to_string());
            state.generation = args.first().and_then(Value::as_u64);
            let page: Vec<RawCandidate> = state
                .page
                .iter()
                .cloned()
                .enumerate()
                .map(|(ordinal, mut c)| {
                    c.ordinal = u32::try_from(ordinal).unwrap_or(u32::MAX);
                    c
                })
                .collect();
            return serde_json::to_value(page).map_err(|err| BrowserError::Script(err.to_string()));
        }
        let selector = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
        if selector.is_empty() {
            state.calls.push("script".to_string());
            return Ok(Value::Bool(true));
        }
        state.calls.push(format!("script {selector}"));
        let generation = state.generation.map(|g| format!("\"{g}:")).unwrap_or_default();
        Ok(Value::Bool(
            !generation.is_empty() && selector.contains(&generation),
        ))
    }

    fn dialog_text(&mut self) -> Result<Option<String>, BrowserError> {
        Ok(self.lock().dialog.clone())
    }

    fn accept_dialog(&mut self) -> Result<(), BrowserError> {
        let mut state = self.lock();
        state.calls.push("accept_dialog".to_string());
        state.dialog.take().map(|_| ()).ok_or(BrowserError::NoDialog)
    }

    fn back(&mut self) -> Result<(), BrowserError> {
        let mut state = self.lock();
        state.calls.push("back".to_string());
        state.take_failure(FakeOp::Back)
    }

    fn click(&mut self, element: &ElementHandle) -> Result<(), BrowserError> {
        let mut state = self.lock();
        state.calls.push(format!("click {}", element.marker()));
        state.take_failure(FakeOp::Click)?;
        state.blocked_by_dialog()?;
        state.check_handle(element)?;
        state.landed.push(element.marker());
        Ok(())
    }

    fn type_text(&mut self, element: &ElementHandle, text: &str) -> Result<(), BrowserError> {
        let mut state = self.lock();
        state.calls.push(format!("type {} {text}", element.marker()));
        state.take_failure(FakeOp::Type)?;
        state.check_handle(element)
    }

    fn upload_file(&mut self, element: &ElementHandle, path: &Path) -> Result<(), BrowserError> {
        let mut state = self.lock();
        state
            .calls
            .push(format!("upload {} {}", element.marker(), path.display()));
        state.take_failure(FakeOp::Upload)?;
        state.check_handle(element)
    }

    fn close(&mut self) -> Result<(), BrowserError> {
        self.lock().calls.push("close".to_string());
        Ok(())
    }
}

/// Hands out clones of one [`FakeBrowser`] and counts sessions opened.
#[derive(Debug, Clone, Default)]
pub struct FakeBrowserFactory {
    browser: FakeBrowser,
    opened: Arc<AtomicUsize>,
}

impl FakeBrowserFactory {
    pub fn new(browser: FakeBrowser) -> Self {
        Self {
            browser,
            opened: Arc::default(),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl BrowserFactory for FakeBrowserFactory {
    type Driver = FakeBrowser;

    fn open(&self) -> Result<FakeBrowser> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.browser.clone())
    }
}

#[derive(Debug, Default)]
struct ModelScript {
    text: VecDeque<Result<String, ModelError>>,
    fallback: Option<String>,
    vision: VecDeque<Result<String, ModelError>>,
    text_calls: Vec<(String, String)>,
    vision_prompts: Vec<String>,
}

/// Model server replaying queued responses in order.
#[derive(Debug, Clone, Default)]
pub struct ScriptedModel {
    script: Arc<Mutex<ModelScript>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ModelScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_text<I, S>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .text
            .extend(responses.into_iter().map(|r| Ok(r.into())));
        self
    }

    pub fn with_text_error(self, err: ModelError) -> Self {
        self.lock().text.push_back(Err(err));
        self
    }

    /// Response returned once the text queue is empty.
    pub fn with_fallback(self, response: impl Into<String>) -> Self {
        self.lock().fallback = Some(response.into());
        self
    }

    pub fn with_vision<I, S>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .vision
            .extend(responses.into_iter().map(|r| Ok(r.into())));
        self
    }

    pub fn with_vision_error(self, err: ModelError) -> Self {
        self.lock().vision.push_back(Err(err));
        self
    }

    /// `(model, prompt)` for every text request.
    pub fn text_calls(&self) -> Vec<(String, String)> {
        self.lock().text_calls.clone()
    }

    pub fn vision_prompts(&self) -> Vec<String> {
        self.lock().vision_prompts.clone()
    }
}

impl TextModel for ScriptedModel {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, ModelError> {
        let mut script = self.lock();
        script
            .text_calls
            .push((model.to_string(), prompt.to_string()));
        match script.text.pop_front() {
            Some(next) => next,
            None => script
                .fallback
                .clone()
                .ok_or_else(|| ModelError::Transport("text script exhausted".to_string())),
        }
    }
}

impl VisionModel for ScriptedModel {
    fn describe(&self, _model: &str, prompt: &str, png: &[u8]) -> Result<String, ModelError> {
        let mut script = self.lock();
        script.vision_prompts.push(prompt.to_string());
        if png.is_empty() {
            return Err(ModelError::Decode("empty screenshot".to_string()));
        }
        script
            .vision
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Transport("vision script exhausted".to_string())))
    }
}

/// SQLite job store in a temporary directory.
pub struct TestStore {
    dir: tempfile::TempDir,
    path: PathBuf,
}

impl TestStore {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("jobs.db");
        JobStore::open(&path)?;
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// A new connection to the same database.
    pub fn open(&self) -> Result<JobStore> {
        Ok(JobStore::open(&self.path)?)
    }
}
