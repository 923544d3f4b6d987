//! `autoapply` command line.
//!
//! Manages the job queue under `.autoapply/` and runs workers in the
//! foreground. Interventions are answered on stdin while `work` runs.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use autoapply::exit_codes;
use autoapply::io::init::{DEFAULT_STATE_DIR, InitOptions, StatePaths, init_state};
use autoapply::io::intervention::{InterventionError, InterventionGate};
use autoapply::io::model::OllamaClient;
use autoapply::io::monitor::{AgentEvent, Monitor};
use autoapply::io::process::DriverProcess;
use autoapply::io::store::{JobStore, StoreError};
use autoapply::io::webdriver::WebDriverFactory;
use autoapply::logging;
use autoapply::worker::{PoolSpec, Worker, spawn_workers};
use clap::{Parser, Subcommand};
use tracing::warn;

const DRIVER_READY_TIMEOUT: Duration = Duration::from_secs(30);
const CONSOLE_TICK: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "autoapply", version, about = "Autonomous job-application agent")]
struct Cli {
    /// State directory holding config, profile and the job database.
    #[arg(long, global = true, default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the state directory with default config, profile template and database.
    Init {
        /// Overwrite existing config and profile.
        #[arg(short, long)]
        force: bool,
    },
    /// Queue a job URL. Exits with 2 if the URL is already queued.
    Enqueue {
        url: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        company: String,
    },
    /// List all jobs, most recently updated first.
    Jobs {
        #[arg(long)]
        json: bool,
    },
    /// Mark a pending or running job as failed. Exits with 2 if nothing changed.
    Abort {
        id: i64,
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },
    /// Run workers in the foreground; type answers to interventions on stdin.
    Work {
        /// Process at most one job, then exit.
        #[arg(long)]
        once: bool,
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = StatePaths::new(&cli.state_dir);
    match cli.command {
        Command::Init { force } => cmd_init(&cli.state_dir, force),
        Command::Enqueue {
            url,
            title,
            company,
        } => cmd_enqueue(&paths, &url, &title, &company),
        Command::Jobs { json } => cmd_jobs(&paths, json),
        Command::Abort { id, reason } => cmd_abort(&paths, id, &reason),
        Command::Work { once, workers } => cmd_work(paths, once, workers),
    }
}

fn cmd_init(state_dir: &std::path::Path, force: bool) -> Result<i32> {
    let paths = init_state(state_dir, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    println!("edit {} before running `autoapply work`", paths.profile_path.display());
    Ok(exit_codes::OK)
}

fn open_store(paths: &StatePaths) -> Result<JobStore> {
    if !paths.db_path.exists() {
        bail!(
            "{} not found; run `autoapply init` first",
            paths.db_path.display()
        );
    }
    JobStore::open(&paths.db_path).with_context(|| format!("open {}", paths.db_path.display()))
}

fn cmd_enqueue(paths: &StatePaths, url: &str, title: &str, company: &str) -> Result<i32> {
    let url = url.trim();
    if url.is_empty() {
        bail!("url must not be empty");
    }
    let mut store = open_store(paths)?;
    if store.enqueue(url, title, company)? {
        println!("added");
        Ok(exit_codes::OK)
    } else {
        println!("duplicate");
        Ok(exit_codes::NOOP)
    }
}

fn cmd_jobs(paths: &StatePaths, json: bool) -> Result<i32> {
    let store = open_store(paths)?;
    let jobs = store.list_all()?;
    if json {
        let payload = serde_json::to_string_pretty(&jobs).context("serialize jobs")?;
        println!("{payload}");
        return Ok(exit_codes::OK);
    }
    println!("{:>5}  {:<11}  {:<20}  {:<30}  URL", "ID", "STATUS", "COMPANY", "TITLE");
    for job in &jobs {
        println!(
            "{:>5}  {:<11}  {:<20}  {:<30}  {}",
            job.id,
            job.status,
            clip(&job.company, 20),
            clip(&job.title, 30),
            job.url
        );
    }
    let counts = store.counts()?;
    println!(
        "\npending {}, in progress {}, success {}, failed {}",
        counts.pending, counts.in_progress, counts.success, counts.failed
    );
    Ok(exit_codes::OK)
}

fn clip(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn cmd_abort(paths: &StatePaths, id: i64, reason: &str) -> Result<i32> {
    let mut store = open_store(paths)?;
    match store.abort(id, reason) {
        Ok(true) => {
            println!("aborted job {id}");
            Ok(exit_codes::OK)
        }
        Ok(false) => {
            println!("job {id} is not pending or in progress");
            Ok(exit_codes::NOOP)
        }
        Err(StoreError::NotFound(_)) => {
            println!("job {id} not found");
            Ok(exit_codes::NOOP)
        }
        Err(err) => Err(err.into()),
    }
}

fn cmd_work(paths: StatePaths, once: bool, workers: usize) -> Result<i32> {
    if workers == 0 {
        bail!("--workers must be at least 1");
    }
    let gate = InterventionGate::new();
    let monitor = Monitor::new();
    let spec = PoolSpec::load(paths, gate.clone(), monitor.clone())?;
    let config = &spec.config;

    // Held for the lifetime of the workers; dropping it stops the driver.
    let _driver = if config.browser.driver_command.is_empty() {
        None
    } else {
        Some(DriverProcess::spawn(
            &config.browser.driver_command,
            &config.browser.webdriver_url,
            DRIVER_READY_TIMEOUT,
        )?)
    };
    let model = OllamaClient::new(&config.model.base_url, config.model_timeout())?;
    let factory = WebDriverFactory::new(config.browser.clone());

    let events = monitor.handle().subscribe();
    let shutdown = Arc::new(AtomicBool::new(false));
    let handles = if once {
        let store = JobStore::open(&spec.paths.db_path)?;
        let mut worker = Worker::new(spec.worker_options(0), store, factory, model)?;
        let stop = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(worker.name().to_string())
            .spawn(move || match worker.run_once_until(&stop) {
                Ok(Some(outcome)) => println!("{}", outcome.log_line()),
                Ok(None) => println!("queue empty"),
                Err(err) => eprintln!("job store unavailable: {err}"),
            })
            .context("spawn worker")?;
        vec![handle]
    } else {
        spawn_workers(&spec, workers, factory, model, Arc::clone(&shutdown))?
    };
    println!("{} worker(s) running; type `quit` to stop after the current job", handles.len());

    let lines = spawn_stdin_reader();
    console_loop(&gate, &events, lines.as_ref(), &handles, &shutdown);
    for handle in handles {
        if handle.join().is_err() {
            warn!("worker thread panicked");
        }
    }
    Ok(exit_codes::OK)
}

fn spawn_stdin_reader() -> Option<Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    match spawned {
        Ok(_) => Some(rx),
        Err(err) => {
            warn!(error = %err, "stdin reader unavailable; interventions cannot be answered");
            None
        }
    }
}

/// Relay events to the terminal and operator lines to the gate until every worker exits.
fn console_loop(
    gate: &InterventionGate,
    events: &Receiver<AgentEvent>,
    mut lines: Option<&Receiver<String>>,
    handles: &[JoinHandle<()>],
    shutdown: &AtomicBool,
) {
    while !handles.iter().all(JoinHandle::is_finished) {
        while let Ok(event) = events.try_recv() {
            print_event(&event);
        }
        let Some(rx) = lines else {
            thread::sleep(CONSOLE_TICK);
            continue;
        };
        match rx.recv_timeout(CONSOLE_TICK) {
            Ok(line) => println!("{}", handle_line(gate, shutdown, &line)),
            Err(RecvTimeoutError::Timeout) => {}
            // stdin closed: keep working, stop reading.
            Err(RecvTimeoutError::Disconnected) => lines = None,
        }
    }
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::InterventionRequested {
            worker,
            job_id,
            prompt,
        } => {
            println!("[{worker}] job {job_id} needs help: {prompt}");
            println!("type the answer and press Enter (`skip` declines)");
        }
        AgentEvent::InterventionResolved { worker, job_id } => {
            println!("[{worker}] job {job_id} resumed");
        }
        AgentEvent::JobFinished {
            worker,
            job_id,
            outcome,
        } => println!("[{worker}] job {job_id}: {}", outcome.log_line()),
        AgentEvent::StoreDown {
            worker,
            error,
            retry_in_secs,
        } => eprintln!("[{worker}] job store unavailable, retrying in {retry_in_secs}s: {error}"),
        AgentEvent::ModelDown {
            worker,
            job_id,
            error,
            retry_in_millis,
        } => eprintln!(
            "[{worker}] job {job_id} waiting for the model server, retrying in {retry_in_millis}ms: {error}"
        ),
        AgentEvent::PhaseChanged { .. } | AgentEvent::Log { .. } => {}
    }
}

/// Apply one operator line and return the reply to print.
fn handle_line(gate: &InterventionGate, shutdown: &AtomicBool, line: &str) -> String {
    let line = line.trim();
    match line {
        "" => String::new(),
        "quit" | "exit" => {
            shutdown.store(true, Ordering::SeqCst);
            let _ = gate.cancel();
            "stopping after the current job".to_string()
        }
        "skip" => match gate.cancel() {
            Ok(()) => "intervention declined".to_string(),
            Err(err) => err.to_string(),
        },
        value => match gate.resolve(value) {
            Ok(()) => "sent".to_string(),
            Err(InterventionError::NothingPending) => {
                "no intervention is pending; type `quit` to stop".to_string()
            }
            Err(err) => err.to_string(),
        },
    }
}
