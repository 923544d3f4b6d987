//! Optional WebDriver server child process.

use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

const READY_POLL: Duration = Duration::from_millis(250);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A driver binary (e.g. chromedriver) owned by this process.
#[derive(Debug)]
pub struct DriverProcess {
    child: Option<Child>,
    program: String,
}

impl DriverProcess {
    /// Spawn `command` and wait until `{webdriver_url}/status` reports ready.
    #[instrument(skip_all, fields(program = command.first().map(String::as_str).unwrap_or_default()))]
    pub fn spawn(command: &[String], webdriver_url: &str, ready_timeout: Duration) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("browser.driver_command is empty"))?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn driver {program}"))?;
        let mut process = Self {
            child: Some(child),
            program: program.clone(),
        };
        process.wait_ready(webdriver_url, ready_timeout)?;
        info!("driver ready");
        Ok(process)
    }

    fn wait_ready(&mut self, webdriver_url: &str, timeout: Duration) -> Result<()> {
        let client = Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .context("build http client")?;
        let status_url = format!("{}/status", webdriver_url.trim_end_matches('/'));
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(child) = self.child.as_mut()
                && let Some(status) = child.wait_timeout(Duration::ZERO).context("poll driver")?
            {
                self.child = None;
                return Err(anyhow!("driver {} exited during startup with {status}", self.program));
            }
            match client.get(&status_url).send() {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => debug!(status = %resp.status(), "driver not ready"),
                Err(err) => debug!(err = %err, "driver not reachable yet"),
            }
            if Instant::now() >= deadline {
                self.stop();
                return Err(anyhow!(
                    "driver {} not ready at {status_url} after {timeout:?}",
                    self.program
                ));
            }
            thread::sleep(READY_POLL);
        }
    }

    /// Kill the driver and reap it within a grace period.
    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(err) = child.kill() {
            warn!(err = %err, "kill driver");
        }
        match child.wait_timeout(STOP_GRACE) {
            Ok(Some(status)) => debug!(%status, "driver stopped"),
            Ok(None) => warn!(
                grace_secs = STOP_GRACE.as_secs(),
                "driver did not exit within grace period"
            ),
            Err(err) => warn!(err = %err, "wait for driver"),
        }
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

impl Drop for DriverProcess {
    fn drop(&mut self) {
        self.stop();
    }
}
