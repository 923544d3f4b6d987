//! Browser driver boundary.
//!
//! The agent depends only on [`BrowserDriver`]. Each worker owns one driver
//! by value and every method takes `&mut self`, so one session is never used
//! concurrently by a capture and an action.

use std::path::Path;

use serde_json::{Value, json};
use thiserror::Error;

use crate::core::perception::ElementHandle;

/// Clicks the element matching `arguments[0]`; `false` when it is gone.
const SCRIPT_CLICK: &str = r#"
const el = document.querySelector(arguments[0]);
if (!el) { return false; }
el.scrollIntoView({block: "center"});
el.click();
return true;
"#;

/// Sets `.value` on the element matching `arguments[0]` and fires input/change.
const SCRIPT_SET_VALUE: &str = r#"
const el = document.querySelector(arguments[0]);
if (!el) { return false; }
el.focus();
const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype
  : el instanceof HTMLSelectElement ? HTMLSelectElement.prototype
  : HTMLInputElement.prototype;
const setter = Object.getOwnPropertyDescriptor(proto, "value");
if (setter && setter.set) { setter.set.call(el, arguments[1]); } else { el.value = arguments[1]; }
el.dispatchEvent(new Event("input", {bubbles: true}));
el.dispatchEvent(new Event("change", {bubbles: true}));
return true;
"#;

const SCRIPT_SCROLL_INTO_VIEW: &str = r#"
const el = document.querySelector(arguments[0]);
if (!el) { return false; }
el.scrollIntoView({block: "center"});
return true;
"#;

/// Typed driver failures, routed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrowserError {
    #[error("element click intercepted: {0}")]
    Obscured(String),
    #[error("element not interactable: {0}")]
    NotInteractable(String),
    #[error("element is no longer attached to the page")]
    StaleElement,
    #[error("no native dialog is open")]
    NoDialog,
    #[error("a native dialog is open: {0}")]
    UnexpectedDialog(String),
    #[error("script error: {0}")]
    Script(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("browser session lost: {0}")]
    SessionLost(String),
    #[error("driver transport error: {0}")]
    Http(String),
    #[error("driver error: {0}")]
    Protocol(String),
}

impl BrowserError {
    /// Session-level failures end the job and force a new session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, BrowserError::SessionLost(_) | BrowserError::Http(_))
    }

    /// Guidance appended to failure observations so the model can self-correct.
    pub fn hint(&self) -> &'static str {
        match self {
            BrowserError::Obscured(_) => {
                "The target is covered by another element such as a popup, modal or cookie banner. \
                 Find the Close, Dismiss or X button of the overlay and click it first, then retry."
            }
            BrowserError::NotInteractable(_) => {
                "The element cannot be used right now (hidden, disabled or off-screen). \
                 Scroll, or choose a different element."
            }
            BrowserError::StaleElement => {
                "The page changed and that element is gone. Use IDs from the current element list."
            }
            BrowserError::NoDialog => "There was no dialog to handle.",
            BrowserError::UnexpectedDialog(_) => {
                "A browser dialog appeared; it will be handled before the next step."
            }
            BrowserError::Script(_) => "The page rejected the scripted action.",
            BrowserError::Timeout(_) => "The page did not respond in time. Wait or try another action.",
            BrowserError::SessionLost(_) | BrowserError::Http(_) | BrowserError::Protocol(_) => {
                "The browser reported an unexpected error."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
}

/// The narrow surface the agent needs from a remote browser.
pub trait BrowserDriver {
    fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    fn current_url(&mut self) -> Result<String, BrowserError>;

    /// Current rendered markup.
    fn page_source(&mut self) -> Result<String, BrowserError>;

    /// Write a PNG screenshot of the viewport to `path`.
    fn screenshot(&mut self, path: &Path) -> Result<(), BrowserError>;

    /// Run a synchronous script with positional `arguments` and return its value.
    fn execute_script(&mut self, script: &str, args: Vec<Value>) -> Result<Value, BrowserError>;

    /// Text of the open native dialog, if any.
    fn dialog_text(&mut self) -> Result<Option<String>, BrowserError>;

    fn accept_dialog(&mut self) -> Result<(), BrowserError>;

    fn back(&mut self) -> Result<(), BrowserError>;

    /// Native click, so overlays intercepting it are reported as `Obscured`.
    fn click(&mut self, element: &ElementHandle) -> Result<(), BrowserError>;

    /// Clear the element and send `text` as keystrokes.
    fn type_text(&mut self, element: &ElementHandle, text: &str) -> Result<(), BrowserError>;

    /// Attach a local file to a file input.
    fn upload_file(&mut self, element: &ElementHandle, path: &Path) -> Result<(), BrowserError>;

    fn close(&mut self) -> Result<(), BrowserError>;

    /// Scroll by one viewport height.
    fn scroll(&mut self, direction: ScrollDirection) -> Result<(), BrowserError> {
        let sign = match direction {
            ScrollDirection::Up => "-",
            ScrollDirection::Down => "",
        };
        self.execute_script(
            &format!("window.scrollBy(0, {sign}window.innerHeight); return true;"),
            Vec::new(),
        )?;
        Ok(())
    }

    fn scroll_into_view(&mut self, element: &ElementHandle) -> Result<(), BrowserError> {
        expect_found(self.execute_script(SCRIPT_SCROLL_INTO_VIEW, vec![json!(element.selector())])?)
    }

    /// Click through the DOM, bypassing hit testing.
    fn script_click(&mut self, element: &ElementHandle) -> Result<(), BrowserError> {
        expect_found(self.execute_script(SCRIPT_CLICK, vec![json!(element.selector())])?)
    }

    /// Assign `.value` directly and fire `input`/`change`.
    fn script_set_value(&mut self, element: &ElementHandle, text: &str) -> Result<(), BrowserError> {
        expect_found(self.execute_script(
            SCRIPT_SET_VALUE,
            vec![json!(element.selector()), json!(text)],
        )?)
    }
}

fn expect_found(value: Value) -> Result<(), BrowserError> {
    if value == Value::Bool(true) {
        Ok(())
    } else {
        Err(BrowserError::StaleElement)
    }
}

/// Opens browser sessions; called lazily by a worker and again after a crash.
pub trait BrowserFactory {
    type Driver: BrowserDriver;

    fn open(&self) -> anyhow::Result<Self::Driver>;
}
