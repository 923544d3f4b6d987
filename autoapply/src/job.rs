//! Drives one claimed job through perceive/decide/act iterations.
//!
//! The caller owns the claim and the terminal status write; this module only
//! appends progress lines, so an operator abort is never overwritten.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::IterationBudget;
use crate::core::decision::Decision;
use crate::core::perception::PerceptionSnapshot;
use crate::core::phase::Phase;
use crate::core::scratchpad::{HistoryEntry, Scratchpad};
use crate::core::tools::{Tool, ToolCall};
use crate::core::types::{Job, JobOutcome, JobStatus};
use crate::decide::{DecisionEngine, DecisionTurn};
use crate::dispatch::{SessionCrash, ToolRegistry};
use crate::io::attempt_log::{AttemptMeta, AttemptWriteRequest, write_attempt};
use crate::io::browser::{BrowserDriver, BrowserError};
use crate::io::config::AgentConfig;
use crate::io::intervention::{InterventionError, InterventionGate};
use crate::io::model::{ModelError, TextModel, VisionModel};
use crate::io::monitor::WorkerReporter;
use crate::io::profile::Profile;
use crate::io::prompt::{DecisionInputs, PromptBuilder};
use crate::io::store::JobStore;
use crate::perceive::PerceptionBuilder;

/// Longest observation excerpt copied into the job log.
const LOG_EXCERPT_CHARS: usize = 160;

/// How often a held job re-checks for an abort or a shutdown.
const HOLD_POLL: Duration = Duration::from_millis(100);

/// History action recorded for an accepted native dialog.
pub const DIALOG_ACTION: &str = "(browser dialog)";

/// Shared, read-only dependencies of a job run.
pub struct JobContext<'a, M: ?Sized> {
    pub config: &'a AgentConfig,
    pub profile: &'a Profile,
    pub model: &'a M,
    pub prompts: &'a PromptBuilder,
    pub gate: &'a InterventionGate,
    pub reporter: &'a WorkerReporter,
    /// Set when the worker should stop; ends a model outage wait.
    pub shutdown: &'a AtomicBool,
    /// `None` disables per-iteration artifacts.
    pub attempts_dir: Option<&'a Path>,
}

/// What one iteration produced for the history.
struct StepRecord {
    thought: String,
    action: String,
    input: String,
    observation: String,
    settle: bool,
}

enum Step {
    Continue(StepRecord),
    Done(JobOutcome),
}

enum Interrupt {
    Aborted,
    Shutdown,
}

/// Run `job` on `driver` until it finishes, times out, crashes or is aborted.
#[instrument(skip_all, fields(job_id = job.id, worker = ctx.reporter.worker()))]
pub fn drive_job<D, M>(
    ctx: &JobContext<'_, M>,
    store: &mut JobStore,
    driver: &mut D,
    perception: &mut PerceptionBuilder,
    job: &Job,
) -> JobOutcome
where
    D: BrowserDriver + ?Sized,
    M: TextModel + VisionModel + ?Sized,
{
    let engine = DecisionEngine::new(&ctx.config.model.decision_model, ctx.config.finish.policy());
    let mut budget = IterationBudget::new(ctx.config.max_iterations);
    let mut history = Scratchpad::new();

    ctx.reporter.phase(Phase::Perceiving, Some(job.id), 0);
    if let Err(err) = driver.navigate(&job.url) {
        warn!(error = %err, "navigation failed");
        return JobOutcome::Crashed {
            error: format!("navigate to {}: {err}", job.url),
            iterations: 0,
        };
    }
    thread::sleep(ctx.config.page_load_wait());

    while let Some(iteration) = budget.next_iteration() {
        if !still_in_progress(store, job.id) {
            info!(iteration, "job no longer in progress; stopping");
            return JobOutcome::Aborted {
                iterations: iteration - 1,
            };
        }

        ctx.reporter.phase(Phase::Perceiving, Some(job.id), iteration);
        match dismiss_dialog(driver) {
            Ok(Some(text)) => {
                let observation = format!("A browser dialog said \"{text}\" and was accepted.");
                log_progress(ctx, store, job.id, &format!("[{iteration}] dialog: {text}"));
                history.push(HistoryEntry::new(DIALOG_ACTION, "", observation));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "browser session failed");
                return JobOutcome::Crashed {
                    error: err.to_string(),
                    iterations: iteration,
                };
            }
        }

        let step = run_iteration(
            ctx,
            &engine,
            store,
            driver,
            perception,
            job,
            &history,
            iteration,
        );
        let record = match step {
            Step::Done(outcome) => return outcome,
            Step::Continue(record) => record,
        };

        ctx.reporter.phase(Phase::Observing, Some(job.id), iteration);
        let line = format!(
            "[{iteration}] {} {} -> {}",
            record.action,
            record.input,
            excerpt(&record.observation)
        );
        log_progress(ctx, store, job.id, &line);
        history.push(
            HistoryEntry::new(record.action, record.input, record.observation)
                .with_thought(record.thought),
        );
        if record.settle {
            thread::sleep(ctx.config.settle());
        }
    }

    JobOutcome::TimedOut {
        iterations: budget.used(),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_iteration<D, M>(
    ctx: &JobContext<'_, M>,
    engine: &DecisionEngine,
    store: &mut JobStore,
    driver: &mut D,
    perception: &mut PerceptionBuilder,
    job: &Job,
    history: &Scratchpad,
    iteration: u32,
) -> Step
where
    D: BrowserDriver + ?Sized,
    M: TextModel + VisionModel + ?Sized,
{
    let started_at = Utc::now();
    let started = Instant::now();

    let snapshot = match perception.capture(driver, ctx.model) {
        Ok(snapshot) => snapshot,
        Err(err) if err.is_session_fatal() => return crashed(err, iteration),
        Err(err) => {
            warn!(error = %err, "capture failed");
            return Step::Continue(StepRecord {
                thought: String::new(),
                action: "(read page)".to_string(),
                input: String::new(),
                observation: format!("Could not read the page: {err}. {}", err.hint()),
                settle: true,
            });
        }
    };

    ctx.reporter.phase(Phase::Deciding, Some(job.id), iteration);
    let inputs = DecisionInputs {
        job,
        iteration,
        max_iterations: ctx.config.max_iterations,
        history,
        snapshot: &snapshot,
    };
    let turn = match decide_when_available(ctx, engine, store, job, &inputs) {
        Ok(turn) => turn,
        Err(outcome) => return Step::Done(outcome),
    };

    let step = match &turn.decision {
        Decision::Finish { message, .. } => Step::Done(JobOutcome::Succeeded {
            message: message.clone(),
            iterations: iteration,
        }),
        Decision::Act {
            thought,
            call: ToolCall::PauseForHuman { prompt },
        } => {
            ctx.reporter.phase(Phase::Intervening, Some(job.id), iteration);
            match intervene(ctx, store, job, prompt) {
                Some(observation) => Step::Continue(StepRecord {
                    thought: thought.clone(),
                    action: Tool::PauseForHuman.name().to_string(),
                    input: prompt.clone(),
                    observation,
                    settle: true,
                }),
                None => Step::Done(JobOutcome::Aborted {
                    iterations: iteration,
                }),
            }
        }
        Decision::Act { thought, call } => {
            ctx.reporter.phase(Phase::Acting, Some(job.id), iteration);
            let registry = ToolRegistry {
                profile: ctx.profile,
                model: ctx.model,
                prompts: ctx.prompts,
                answer_model: &ctx.config.model.answer_model,
                perception,
            };
            match registry.dispatch(driver, &snapshot, job, call) {
                Ok(observation) => Step::Continue(StepRecord {
                    thought: thought.clone(),
                    action: call.tool().name().to_string(),
                    input: call.input_text(),
                    observation,
                    settle: true,
                }),
                Err(SessionCrash(err)) => crashed(err, iteration),
            }
        }
        Decision::Malformed { error, .. } => {
            ctx.reporter.phase(Phase::ParsingRecovery, Some(job.id), iteration);
            debug!(%error, "malformed decision");
            Step::Continue(StepRecord {
                thought: String::new(),
                action: "(invalid format)".to_string(),
                input: String::new(),
                observation: error.observation(),
                settle: false,
            })
        }
        Decision::Stalled { reason } => Step::Continue(StepRecord {
            thought: String::new(),
            action: "(no decision)".to_string(),
            input: String::new(),
            observation: format!(
                "The decision model gave no usable answer ({reason}). Look at the page again and continue."
            ),
            settle: false,
        }),
    };

    record_attempt(ctx, job, iteration, &snapshot, &turn, &step, started_at, started);
    step
}

/// Ask for the next decision, holding the job while the model server is down.
///
/// The claim is kept and the same prompt is retried with backoff until the
/// server answers, the job stops being IN_PROGRESS or the worker shuts down.
fn decide_when_available<M>(
    ctx: &JobContext<'_, M>,
    engine: &DecisionEngine,
    store: &JobStore,
    job: &Job,
    inputs: &DecisionInputs<'_>,
) -> Result<DecisionTurn, JobOutcome>
where
    M: TextModel + ?Sized,
{
    let iteration = inputs.iteration;
    let mut backoff = ctx.config.model_retry_backoff();
    loop {
        let err = match engine.decide(ctx.model, ctx.prompts, inputs) {
            Ok(turn) => return Ok(turn),
            Err(err) => err,
        };
        let error = format!("{err:#}");
        let unavailable = err
            .downcast_ref::<ModelError>()
            .is_some_and(ModelError::is_unavailable);
        if !unavailable {
            return Err(JobOutcome::Crashed {
                error,
                iterations: iteration,
            });
        }

        let delay = backoff.next_delay();
        let retry_in_millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        warn!(%error, retry_in_millis, "model server unavailable; holding job");
        ctx.reporter.model_down(job.id, &error, retry_in_millis);
        match hold(ctx, store, job.id, delay) {
            None => {}
            Some(Interrupt::Aborted) => {
                info!("job no longer in progress; stopping");
                return Err(JobOutcome::Aborted {
                    iterations: iteration,
                });
            }
            Some(Interrupt::Shutdown) => {
                return Err(JobOutcome::Crashed {
                    error: format!("worker stopped while the model server was unavailable: {error}"),
                    iterations: iteration,
                });
            }
        }
    }
}

/// Sleep for up to `total`; returns early when the job must stop.
fn hold<M: ?Sized>(
    ctx: &JobContext<'_, M>,
    store: &JobStore,
    id: i64,
    total: Duration,
) -> Option<Interrupt> {
    let deadline = Instant::now() + total;
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            return Some(Interrupt::Shutdown);
        }
        if !still_in_progress(store, id) {
            return Some(Interrupt::Aborted);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        thread::sleep(HOLD_POLL.min(deadline - now));
    }
}

fn crashed(err: BrowserError, iteration: u32) -> Step {
    warn!(error = %err, "browser session failed");
    Step::Done(JobOutcome::Crashed {
        error: err.to_string(),
        iterations: iteration,
    })
}

/// Accept a native dialog if one is open and return its text.
///
/// Only session-fatal errors are returned; anything else means no dialog.
fn dismiss_dialog<D: BrowserDriver + ?Sized>(driver: &mut D) -> Result<Option<String>, BrowserError> {
    let text = match driver.dialog_text() {
        Ok(Some(text)) => text,
        Ok(None) => return Ok(None),
        Err(err) if err.is_session_fatal() => return Err(err),
        Err(_) => return Ok(None),
    };
    match driver.accept_dialog() {
        Ok(()) | Err(BrowserError::NoDialog) => {}
        Err(err) if err.is_session_fatal() => return Err(err),
        Err(err) => warn!(error = %err, "could not accept dialog"),
    }
    info!(dialog = %text, "accepted native dialog");
    Ok(Some(text))
}

/// Park on the gate until a human answers; `None` when the job was aborted meanwhile.
fn intervene<M: ?Sized>(
    ctx: &JobContext<'_, M>,
    store: &JobStore,
    job: &Job,
    prompt: &str,
) -> Option<String> {
    ctx.reporter.intervention_requested(job.id, prompt);
    let cancelled = || !still_in_progress(store, job.id);
    match ctx.gate.request(ctx.reporter.worker(), prompt, cancelled) {
        Ok(value) => {
            ctx.reporter.intervention_resolved(job.id);
            Some(format!("The human operator replied: {value}"))
        }
        Err(InterventionError::Cancelled) if !still_in_progress(store, job.id) => None,
        Err(InterventionError::Cancelled) => {
            ctx.reporter.intervention_resolved(job.id);
            Some("The human operator declined to help. Continue on your own.".to_string())
        }
        Err(InterventionError::Busy { prompt: other }) => Some(format!(
            "The human operator is busy with another request (\"{other}\"). \
             Continue on your own or ask again later."
        )),
        Err(InterventionError::NothingPending) => {
            Some("The human operator did not reply. Continue on your own.".to_string())
        }
    }
}

/// Store errors count as "still running"; the worker finds out on the status write.
fn still_in_progress(store: &JobStore, id: i64) -> bool {
    match store.status(id) {
        Ok(Some(status)) => status == JobStatus::InProgress,
        Ok(None) => false,
        Err(err) => {
            warn!(error = %err, job_id = id, "could not read job status");
            true
        }
    }
}

fn log_progress<M: ?Sized>(ctx: &JobContext<'_, M>, store: &mut JobStore, id: i64, line: &str) {
    ctx.reporter.log(Some(id), line);
    if let Err(err) = store.append_log(id, line) {
        warn!(error = %err, job_id = id, "could not append job log");
    }
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= LOG_EXCERPT_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(LOG_EXCERPT_CHARS).collect();
    cut.push('…');
    cut
}

#[allow(clippy::too_many_arguments)]
fn record_attempt<M: ?Sized>(
    ctx: &JobContext<'_, M>,
    job: &Job,
    iteration: u32,
    snapshot: &PerceptionSnapshot,
    turn: &DecisionTurn,
    step: &Step,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
) {
    let Some(attempts_dir) = ctx.attempts_dir else {
        return;
    };
    let (tool, tool_input, observation) = match (&turn.decision, step) {
        (Decision::Act { call, .. }, Step::Continue(record)) => (
            Some(call.tool().name().to_string()),
            Some(call.input_text()),
            Some(record.observation.clone()),
        ),
        (_, Step::Continue(record)) => (None, None, Some(record.observation.clone())),
        (Decision::Finish { message, .. }, Step::Done(_)) => (None, None, Some(message.clone())),
        (_, Step::Done(outcome)) => (None, None, Some(outcome.log_line())),
    };
    let meta = AttemptMeta {
        job_id: job.id,
        iter: iteration,
        worker: ctx.reporter.worker().to_string(),
        url: job.url.clone(),
        generation: snapshot.generation,
        elements: snapshot.len(),
        decision: turn.decision.label().to_string(),
        tool,
        tool_input,
        observation,
        started_at,
        ended_at: Utc::now(),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    let request = AttemptWriteRequest {
        attempts_dir,
        meta: &meta,
        prompt: &turn.prompt,
        response: &turn.response,
    };
    if let Err(err) = write_attempt(&request) {
        warn!(error = %err, "could not write attempt artifacts");
    }
}
