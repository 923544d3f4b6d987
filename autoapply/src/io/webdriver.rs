//! W3C WebDriver client (chromedriver and compatible servers).

use std::fs;
use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Method;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::perception::ElementHandle;
use crate::io::browser::{BrowserDriver, BrowserError, BrowserFactory};
use crate::io::config::BrowserConfig;

/// Key of a web element reference in W3C responses.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Map a W3C error code to a typed error.
fn classify(code: &str, message: &str) -> BrowserError {
    let message = message.lines().next().unwrap_or_default().to_string();
    match code {
        "element click intercepted" => BrowserError::Obscured(message),
        "element not interactable" | "invalid element state" => {
            BrowserError::NotInteractable(message)
        }
        "stale element reference" | "no such element" | "detached shadow root" => {
            BrowserError::StaleElement
        }
        "no such alert" => BrowserError::NoDialog,
        "unexpected alert open" => BrowserError::UnexpectedDialog(message),
        "javascript error" => BrowserError::Script(message),
        "timeout" | "script timeout" => BrowserError::Timeout(message),
        "invalid session id" | "session not created" | "no such window" => {
            BrowserError::SessionLost(message)
        }
        other => BrowserError::Protocol(format!("{other}: {message}")),
    }
}

fn transport_error(err: &reqwest::Error) -> BrowserError {
    if err.is_timeout() {
        BrowserError::Timeout(err.to_string())
    } else if err.is_connect() {
        BrowserError::SessionLost(format!("driver unreachable: {err}"))
    } else {
        BrowserError::Http(err.to_string())
    }
}

/// One live WebDriver session. Deleted on `close` or drop.
#[derive(Debug)]
pub struct WebDriverSession {
    client: Client,
    base_url: String,
    session_id: String,
    closed: bool,
}

impl WebDriverSession {
    /// Create a new session against `config.webdriver_url`.
    #[instrument(skip_all, fields(url = %config.webdriver_url))]
    pub fn connect(config: &BrowserConfig) -> Result<Self, BrowserError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|err| BrowserError::Http(err.to_string()))?;
        let base_url = config.webdriver_url.trim_end_matches('/').to_string();

        let [width, height] = config.window_size;
        let mut args = config.browser_args.clone();
        args.push(format!("--window-size={width},{height}"));
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "normal",
                    // Leave dialogs open so the agent can read and accept them.
                    "unhandledPromptBehavior": "ignore",
                    "timeouts": {"pageLoad": 60_000, "script": 30_000, "implicit": 0},
                    "goog:chromeOptions": {"args": args},
                }
            }
        });

        let value = send(&client, Method::POST, &format!("{base_url}/session"), Some(capabilities))?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Protocol("new session response missing sessionId".into()))?
            .to_string();
        info!(session_id = %session_id, "webdriver session created");
        Ok(Self {
            client,
            base_url,
            session_id,
            closed: false,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, BrowserError> {
        if self.closed {
            return Err(BrowserError::SessionLost("session already closed".into()));
        }
        let url = format!("{}/session/{}{}", self.base_url, self.session_id, path);
        send(&self.client, method, &url, body)
    }

    fn find(&self, element: &ElementHandle) -> Result<String, BrowserError> {
        let value = self.command(
            Method::POST,
            "/element",
            Some(json!({"using": "css selector", "value": element.selector()})),
        )?;
        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BrowserError::Protocol("find element response missing reference".into()))
    }

    fn element_command(
        &self,
        element: &ElementHandle,
        action: &str,
        body: Value,
    ) -> Result<(), BrowserError> {
        let id = self.find(element)?;
        self.command(Method::POST, &format!("/element/{id}/{action}"), Some(body))?;
        Ok(())
    }
}

fn send(client: &Client, method: Method, url: &str, body: Option<Value>) -> Result<Value, BrowserError> {
    debug!(%method, url, "webdriver request");
    let request = client.request(method, url);
    // POST endpoints require a JSON body, even when empty.
    let request = match body {
        Some(body) => request.json(&body),
        None => request,
    };
    let response = request.send().map_err(|err| transport_error(&err))?;
    let status = response.status();
    let payload: Value = response.json().map_err(|err| {
        BrowserError::Http(format!("decode webdriver response ({status}): {err}"))
    })?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);
    if let Some(code) = value.get("error").and_then(Value::as_str) {
        let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
        return Err(classify(code, message));
    }
    if !status.is_success() {
        return Err(BrowserError::Protocol(format!("http status {status}")));
    }
    Ok(value)
}

impl BrowserDriver for WebDriverSession {
    fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.command(Method::POST, "/url", Some(json!({"url": url})))?;
        Ok(())
    }

    fn current_url(&mut self) -> Result<String, BrowserError> {
        let value = self.command(Method::GET, "/url", None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn page_source(&mut self) -> Result<String, BrowserError> {
        let value = self.command(Method::GET, "/source", None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn screenshot(&mut self, path: &Path) -> Result<(), BrowserError> {
        let value = self.command(Method::GET, "/screenshot", None)?;
        let encoded = value
            .as_str()
            .ok_or_else(|| BrowserError::Protocol("screenshot response was not a string".into()))?;
        let png = STANDARD
            .decode(encoded)
            .map_err(|err| BrowserError::Protocol(format!("decode screenshot: {err}")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| BrowserError::Protocol(format!("create {}: {err}", parent.display())))?;
        }
        fs::write(path, png)
            .map_err(|err| BrowserError::Protocol(format!("write {}: {err}", path.display())))
    }

    fn execute_script(&mut self, script: &str, args: Vec<Value>) -> Result<Value, BrowserError> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({"script": script, "args": args})),
        )
    }

    fn dialog_text(&mut self) -> Result<Option<String>, BrowserError> {
        match self.command(Method::GET, "/alert/text", None) {
            Ok(value) => Ok(Some(value.as_str().unwrap_or_default().to_string())),
            Err(BrowserError::NoDialog) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn accept_dialog(&mut self) -> Result<(), BrowserError> {
        self.command(Method::POST, "/alert/accept", Some(json!({})))?;
        Ok(())
    }

    fn back(&mut self) -> Result<(), BrowserError> {
        self.command(Method::POST, "/back", Some(json!({})))?;
        Ok(())
    }

    fn click(&mut self, element: &ElementHandle) -> Result<(), BrowserError> {
        self.element_command(element, "click", json!({}))
    }

    fn type_text(&mut self, element: &ElementHandle, text: &str) -> Result<(), BrowserError> {
        let id = self.find(element)?;
        self.command(Method::POST, &format!("/element/{id}/clear"), Some(json!({})))?;
        self.command(
            Method::POST,
            &format!("/element/{id}/value"),
            Some(json!({"text": text})),
        )?;
        Ok(())
    }

    fn upload_file(&mut self, element: &ElementHandle, path: &Path) -> Result<(), BrowserError> {
        let absolute = path
            .canonicalize()
            .map_err(|err| BrowserError::Protocol(format!("resolve {}: {err}", path.display())))?;
        self.element_command(
            element,
            "value",
            json!({"text": absolute.display().to_string()}),
        )
    }

    fn close(&mut self) -> Result<(), BrowserError> {
        if self.closed {
            return Ok(());
        }
        let result = self.command(Method::DELETE, "", None);
        self.closed = true;
        result.map(|_| ())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(err = %err, "failed to delete webdriver session");
        }
    }
}

/// Opens a fresh [`WebDriverSession`] per call.
#[derive(Debug, Clone)]
pub struct WebDriverFactory {
    config: BrowserConfig,
}

impl WebDriverFactory {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

impl BrowserFactory for WebDriverFactory {
    type Driver = WebDriverSession;

    fn open(&self) -> anyhow::Result<WebDriverSession> {
        WebDriverSession::connect(&self.config)
            .map_err(|err| anyhow::anyhow!("open webdriver session at {}: {err}", self.config.webdriver_url))
    }
}
